use crate::message::{Message, MessageQueue, ResponseMessage};

/// Handler invoked once with the response to a request.
///
/// State the handler needs (the C API's `userdata`) is captured by the closure.
pub type ResponseCallback = Box<dyn FnMut(&ResponseMessage) + Send>;

/// Where the resolution of a pending request goes.
pub(crate) enum Delivery {
    /// Left on the message queue for polling.
    Poll,
    /// Handed to a registered handler during `pump`.
    Callback(ResponseCallback),
    /// Discarded silently.
    Eat,
    /// Held for a blocking caller waiting on this id.
    Wait,
}

impl Delivery {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Delivery::Poll => "poll",
            Delivery::Callback(_) => "callback",
            Delivery::Eat => "eat",
            Delivery::Wait => "wait",
        }
    }

    /// Route a response. Returns it back only for `Wait`, so the blocking
    /// caller can pick it up.
    pub(crate) fn deliver(
        self,
        response: ResponseMessage,
        queue: &MessageQueue,
    ) -> Option<ResponseMessage> {
        match self {
            Delivery::Poll => {
                queue.push(Message::Response(response));
                None
            }
            Delivery::Callback(mut callback) => {
                log::trace!("Invoking callback for request {}", response.request_id);
                callback(&response);
                None
            }
            Delivery::Eat => {
                log::trace!("Eating response for request {}", response.request_id);
                None
            }
            Delivery::Wait => Some(response),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
