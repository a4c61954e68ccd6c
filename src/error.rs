use crate::types::{RequestId, ResultCode};
use std::fmt;

/// Errors that can occur when talking to PSMoveService.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected to PSMoveService")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown or already resolved request {0}")]
    UnknownRequest(RequestId),

    #[error("Unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: i32 },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Request canceled")]
    Canceled,

    #[error("Message size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service reported an error for request {0}")]
    ServiceError(RequestId),
}

impl ClientError {
    /// Collapse the error onto the result codes exposed by the C API.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ClientError::Timeout => ResultCode::Timeout,
            ClientError::Canceled => ResultCode::Canceled,
            _ => ResultCode::Error,
        }
    }

    pub(crate) fn unknown_controller(id: i32) -> Self {
        ClientError::UnknownId {
            kind: "controller",
            id,
        }
    }

    pub(crate) fn unknown_tracker(id: i32) -> Self {
        ClientError::UnknownId { kind: "tracker", id }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &ClientError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ClientError::Timeout.result_code(), ResultCode::Timeout);
        assert_eq!(ClientError::Canceled.result_code(), ResultCode::Canceled);
        assert_eq!(ClientError::NotConnected.result_code(), ResultCode::Error);
        assert_eq!(
            ClientError::SizeMismatch {
                expected: 4,
                actual: 2
            }
            .result_code(),
            ResultCode::Error
        );
    }

    #[test]
    fn test_display() {
        let msg = ClientError::unknown_controller(7).to_string();
        assert_eq!(msg, "Unknown controller id 7");
        let msg = ClientError::UnknownRequest(RequestId(12)).to_string();
        assert!(msg.contains("12"), "{}", msg);
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        let last = LastError::new();
        assert!(last.as_ptr().is_null());
        last.set(&ClientError::NotConnected);
        let s = unsafe { std::ffi::CStr::from_ptr(last.as_ptr()) };
        assert_eq!(s.to_str().unwrap(), "Not connected to PSMoveService");
        last.clear();
        assert!(last.as_ptr().is_null());
    }
}
