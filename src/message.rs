//! Messages delivered to the application and the queue that orders them.

use crate::protocol::{
    OpaquePayload, ResponsePayload, EVENT_CONTROLLER_LIST_UPDATED, EVENT_TRACKER_LIST_UPDATED,
};
use crate::types::{RequestId, ResultCode};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    // Client events
    ConnectedToService = 0,
    FailedToConnectToService = 1,
    DisconnectedFromService = 2,

    // Service events
    /// A service event this client does not model; inspect the payload.
    OpaqueServiceEvent = 3,
    ControllerListUpdated = 4,
    TrackerListUpdated = 5,
}

impl EventType {
    pub fn from_service_tag(tag: u8) -> EventType {
        match tag {
            EVENT_CONTROLLER_LIST_UPDATED => EventType::ControllerListUpdated,
            EVENT_TRACKER_LIST_UPDATED => EventType::TrackerListUpdated,
            _ => EventType::OpaqueServiceEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub event_type: EventType,
    /// Raw service event; empty for client events.
    pub event_data: OpaquePayload,
}

impl EventMessage {
    pub(crate) fn client(event_type: EventType) -> Self {
        Self {
            event_type,
            event_data: OpaquePayload::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    /// The request this response answers.
    pub request_id: RequestId,
    pub result_code: ResultCode,
    /// The request as it was sent.
    pub request: OpaquePayload,
    /// The response body as received; empty for locally resolved requests.
    pub response: OpaquePayload,
    /// Decoded view of `response`.
    pub payload: ResponsePayload,
}

impl ResponseMessage {
    pub(crate) fn canceled(request_id: RequestId, request: OpaquePayload) -> Self {
        Self {
            request_id,
            result_code: ResultCode::Canceled,
            request,
            response: OpaquePayload::default(),
            payload: ResponsePayload::Empty,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePayloadType {
    Event = 0,
    Response = 1,
}

/// What [`Client::poll_next_message`](crate::Client::poll_next_message) yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Event(EventMessage),
    Response(ResponseMessage),
}

impl Message {
    pub fn payload_type(&self) -> MessagePayloadType {
        match self {
            Message::Event(_) => MessagePayloadType::Event,
            Message::Response(_) => MessagePayloadType::Response,
        }
    }

    pub fn as_event(&self) -> Option<&EventMessage> {
        match self {
            Message::Event(e) => Some(e),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseMessage> {
        match self {
            Message::Response(r) => Some(r),
            Message::Event(_) => None,
        }
    }
}

/// Thread-safe FIFO of undelivered messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // The deque is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, message: Message) {
        self.lock().push_back(message);
    }

    /// Oldest undelivered message.
    pub fn pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(id: i32) -> Message {
        Message::Response(ResponseMessage::canceled(
            RequestId(id),
            OpaquePayload::empty(0),
        ))
    }

    #[test]
    fn test_queue_is_fifo_across_kinds() {
        let queue = MessageQueue::new();
        queue.push(Message::Event(EventMessage::client(EventType::ConnectedToService)));
        queue.push(response(1));
        queue.push(response(2));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().payload_type(), MessagePayloadType::Event);
        assert_eq!(queue.pop().unwrap().as_response().unwrap().request_id, RequestId(1));
        assert_eq!(queue.pop().unwrap().as_response().unwrap().request_id, RequestId(2));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_queue_preserves_per_producer_order() {
        let queue = Arc::new(MessageQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for id in 0..500 {
                    queue.push(response(id));
                }
            })
        };
        producer.join().unwrap();

        let mut last = -1;
        while let Some(msg) = queue.pop() {
            let id = msg.as_response().unwrap().request_id.0;
            assert!(id > last);
            last = id;
        }
        assert_eq!(last, 499);
    }

    #[test]
    fn test_service_event_tags() {
        assert_eq!(
            EventType::from_service_tag(EVENT_TRACKER_LIST_UPDATED),
            EventType::TrackerListUpdated
        );
        assert_eq!(EventType::from_service_tag(0x40), EventType::OpaqueServiceEvent);
    }
}
