//! In-process transport pair for tests and offline tools.
//!
//! [`pair`] returns the client half (a [`Transport`]) and a service half that
//! sees every request the client writes and can inject responses, events and
//! data frames, optionally with explicit arrival times.

use crate::protocol::{
    ControllerDataFrame, Frame, FrameBuffer, OpaquePayload, Request, ResponsePayload,
    TrackerDataFrame,
};
use crate::transport::{InboundFrame, Transport, TransportEvent};
use crate::types::{RequestId, ResultCode};
use crate::{ClientError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Create a connected client/service pair.
pub fn pair() -> (LoopbackTransport, LoopbackService) {
    let (to_client, from_service) = crossbeam_channel::unbounded();
    let (to_service, from_client) = crossbeam_channel::unbounded();
    let connected = Arc::new(AtomicBool::new(true));
    (
        LoopbackTransport {
            inbound: from_service,
            outbound: to_service,
            connected: connected.clone(),
        },
        LoopbackService {
            inbound: to_client,
            outbound: from_client,
            connected,
        },
    )
}

pub struct LoopbackTransport {
    inbound: Receiver<TransportEvent>,
    outbound: Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        // The service half may already be gone; that is a closed connection,
        // which pump learns about from the Closed event.
        if self.outbound.send(frame.to_vec()).is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.inbound.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Service half of a loopback pair.
pub struct LoopbackService {
    inbound: Sender<TransportEvent>,
    outbound: Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl LoopbackService {
    /// Next request written by the client, if any.
    pub fn next_request(&self) -> Option<(RequestId, OpaquePayload)> {
        let bytes = self.outbound.try_recv().ok()?;
        decode_request(&bytes)
    }

    /// Wait up to `timeout` for the next typed request.
    pub fn wait_request(&self, timeout: Duration) -> Option<(RequestId, Request)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bytes = match self.outbound.recv_timeout(remaining) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            };
            if let Some((id, payload)) = decode_request(&bytes) {
                match Request::from_payload(&payload) {
                    Ok(request) => return Some((id, request)),
                    Err(e) => log::debug!("Loopback skipping opaque request {}: {}", id, e),
                }
            }
        }
    }

    /// All requests written so far, oldest first.
    pub fn drain_requests(&self) -> Vec<(RequestId, OpaquePayload)> {
        std::iter::from_fn(|| self.next_request()).collect()
    }

    pub fn respond(&self, request_id: RequestId, result: ResultCode, payload: &ResponsePayload) {
        self.respond_opaque(request_id, result, payload.to_payload());
    }

    pub fn respond_opaque(&self, request_id: RequestId, result: ResultCode, payload: OpaquePayload) {
        self.push_frame(Frame::Response {
            request_id,
            result,
            payload,
        });
    }

    pub fn push_event(&self, tag: u8, bytes: Vec<u8>) {
        self.push_frame(Frame::Event(OpaquePayload::new(tag, bytes)));
    }

    pub fn push_controller_data(&self, frame: ControllerDataFrame) {
        self.push_frame(Frame::ControllerData(frame));
    }

    /// Inject a data frame stamped with an explicit arrival time.
    pub fn push_controller_data_at(&self, frame: ControllerDataFrame, received_at: Instant) {
        self.push_inbound(InboundFrame {
            frame: Frame::ControllerData(frame),
            received_at,
        });
    }

    pub fn push_tracker_data(&self, frame: TrackerDataFrame) {
        self.push_frame(Frame::TrackerData(frame));
    }

    pub fn push_tracker_data_at(&self, frame: TrackerDataFrame, received_at: Instant) {
        self.push_inbound(InboundFrame {
            frame: Frame::TrackerData(frame),
            received_at,
        });
    }

    pub fn push_frame(&self, frame: Frame) {
        self.push_inbound(InboundFrame::now(frame));
    }

    pub fn push_inbound(&self, inbound: InboundFrame) {
        let _ = self.inbound.send(TransportEvent::Frame(inbound));
    }

    /// Drop the connection as if the service went away.
    pub fn disconnect(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(TransportEvent::Closed(reason.to_string()));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn decode_request(bytes: &[u8]) -> Option<(RequestId, OpaquePayload)> {
    let mut frames = FrameBuffer::new(bytes.len().max(1));
    frames.extend(bytes);
    match frames.next_frame() {
        Ok(Some(Frame::Request {
            request_id,
            payload,
        })) => Some((request_id, payload)),
        Ok(other) => {
            log::warn!("Loopback service got a non-request frame: {:?}", other);
            None
        }
        Err(e) => {
            log::warn!("Loopback service got a malformed frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestType;

    #[test]
    fn test_requests_reach_service() {
        let (mut transport, service) = pair();
        let frame = Frame::Request {
            request_id: RequestId(5),
            payload: Request::GetTrackerList.to_payload(),
        };
        transport.send(&frame.encode()).unwrap();

        let (id, payload) = service.next_request().unwrap();
        assert_eq!(id, RequestId(5));
        assert_eq!(payload.tag, RequestType::GetTrackerList as u8);
        assert!(service.next_request().is_none());
    }

    #[test]
    fn test_disconnect_posts_closed_once() {
        let (mut transport, service) = pair();
        service.disconnect("gone");
        service.disconnect("gone again");

        assert_eq!(
            transport.try_recv(),
            Some(TransportEvent::Closed("gone".to_string()))
        );
        assert!(transport.try_recv().is_none());
        assert!(!transport.is_connected());
        assert!(matches!(transport.send(&[1]), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_wait_request_times_out() {
        let (_transport, service) = pair();
        assert!(service.wait_request(Duration::from_millis(10)).is_none());
    }
}
