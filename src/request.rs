//! Request id allocation and the table of in-flight requests.

use crate::callback::Delivery;
use crate::protocol::{Frame, OpaquePayload};
use crate::transport::Transport;
use crate::types::RequestId;
use crate::{ClientError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// First id handed out in a process.
pub const FIRST_REQUEST_ID: i32 = 1;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(FIRST_REQUEST_ID);

/// Ids are process-wide so that two clients never share one.
fn next_request_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

pub(crate) struct PendingRequest {
    pub request: OpaquePayload,
    pub created_at: Instant,
    pub delivery: Delivery,
}

/// Owns the pending table. A request leaves the table exactly once: by its
/// response, by cancellation, or by a connection teardown.
#[derive(Default)]
pub struct RequestDispatcher {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the request as pending and write it to the transport.
    ///
    /// The entry exists before the frame is written, so a response can
    /// never be observed for an id the table does not know yet.
    pub(crate) fn send(
        &self,
        transport: &mut dyn Transport,
        request: OpaquePayload,
        delivery: Delivery,
    ) -> Result<RequestId> {
        if !transport.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request_id = next_request_id();
        let bytes = Frame::Request {
            request_id,
            payload: request.clone(),
        }
        .encode();

        self.lock().insert(
            request_id,
            PendingRequest {
                request,
                created_at: Instant::now(),
                delivery,
            },
        );

        if let Err(e) = transport.send(&bytes) {
            self.lock().remove(&request_id);
            return Err(e);
        }

        log::debug!("Sent request {}", request_id);
        Ok(request_id)
    }

    /// Change where a still-pending request's response goes.
    pub(crate) fn set_delivery(&self, request_id: RequestId, delivery: Delivery) -> Result<()> {
        let mut pending = self.lock();
        let entry = pending
            .get_mut(&request_id)
            .ok_or(ClientError::UnknownRequest(request_id))?;
        log::debug!(
            "Request {} delivery {} -> {}",
            request_id,
            entry.delivery.name(),
            delivery.name()
        );
        entry.delivery = delivery;
        Ok(())
    }

    /// Take the request out of the table because its response arrived.
    pub(crate) fn resolve(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.lock().remove(&request_id)
    }

    /// Resolve as canceled without delivering anything. Returns whether the
    /// id was still pending; unknown ids are not an error.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.lock().remove(&request_id) {
            Some(p) => {
                log::debug!(
                    "Canceled request {} after {:?}",
                    request_id,
                    p.created_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Empty the table, oldest request first.
    pub(crate) fn drain(&self) -> Vec<(RequestId, PendingRequest)> {
        let mut drained: Vec<_> = self.lock().drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.lock().contains_key(&request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback;
    use crate::protocol::Request;

    #[test]
    fn test_ids_strictly_increase() {
        let (mut transport, service) = loopback::pair();
        let dispatcher = RequestDispatcher::new();
        let a = dispatcher
            .send(&mut transport, Request::GetControllerList.to_payload(), Delivery::Poll)
            .unwrap();
        let b = dispatcher
            .send(&mut transport, Request::GetTrackerList.to_payload(), Delivery::Poll)
            .unwrap();
        assert!(a.0 >= FIRST_REQUEST_ID);
        assert!(b > a);

        let sent: Vec<_> = service.drain_requests().into_iter().map(|(id, _)| id).collect();
        assert_eq!(sent, vec![a, b]);
        assert_eq!(dispatcher.pending_count(), 2);
    }

    #[test]
    fn test_resolution_happens_once() {
        let (mut transport, _service) = loopback::pair();
        let dispatcher = RequestDispatcher::new();
        let id = dispatcher
            .send(&mut transport, Request::GetControllerList.to_payload(), Delivery::Poll)
            .unwrap();

        assert!(dispatcher.resolve(id).is_some());
        assert!(dispatcher.resolve(id).is_none());
        assert!(!dispatcher.cancel(id));
        assert!(matches!(
            dispatcher.set_delivery(id, Delivery::Eat),
            Err(ClientError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let dispatcher = RequestDispatcher::new();
        assert!(!dispatcher.cancel(RequestId(-5)));
    }

    #[test]
    fn test_send_without_connection() {
        let (mut transport, service) = loopback::pair();
        service.disconnect("down");
        let dispatcher = RequestDispatcher::new();
        let result =
            dispatcher.send(&mut transport, Request::GetControllerList.to_payload(), Delivery::Poll);
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_drain_is_ordered() {
        let (mut transport, _service) = loopback::pair();
        let dispatcher = RequestDispatcher::new();
        let ids: Vec<_> = (0..4)
            .map(|_| {
                dispatcher
                    .send(&mut transport, Request::GetTrackerList.to_payload(), Delivery::Eat)
                    .unwrap()
            })
            .collect();
        let drained: Vec<_> = dispatcher.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(drained, ids);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
