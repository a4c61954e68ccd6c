//! # psmove-client - Rust client for PSMoveService
//!
//! Talks to a running PSMoveService over TCP. Provides:
//! - Request/response plumbing with polling, callbacks or blocking waits
//! - Local mirrors of controllers and trackers, refreshed from data streams
//! - A loopback transport for testing without a service
//! - C FFI for integration with C/C++/Unity
//!
//! ## Quick Start
//! ```no_run
//! use psmove_client::{Client, DataStreamFlags, PsMoveButton};
//! use std::time::Duration;
//!
//! let mut client = Client::new();
//! client.initialize("localhost", "9512").unwrap();
//!
//! let list = client.get_controller_list().unwrap();
//! let id = list.controllers[0].controller_id;
//! client.register_as_controller_listener(id).unwrap();
//! client
//!     .start_controller_data_stream(id, DataStreamFlags::INCLUDE_POSITION)
//!     .unwrap();
//!
//! for _ in 0..100 {
//!     client.pump().unwrap();
//!     if let Some(psmove) = client.controller(id).and_then(|c| c.psmove()) {
//!         println!("pos: {:?} trigger: {:?}", psmove.pose.position, psmove.button(PsMoveButton::Trigger));
//!     }
//!     std::thread::sleep(Duration::from_millis(16));
//! }
//! client.shutdown().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod protocol;
pub mod message;
pub mod callback;
pub mod request;
pub mod controller;
pub mod tracker;
pub mod transport;
pub mod loopback;
pub mod client;
pub mod ffi;

pub use callback::ResponseCallback;
pub use client::{Client, SessionState};
pub use config::ClientConfig;
pub use controller::{Controller, ControllerState, ListenerState, PsMoveButton, PsMoveState, PsNaviButton, PsNaviState};
pub use error::ClientError;
pub use message::{EventMessage, EventType, Message, ResponseMessage};
pub use protocol::{OpaquePayload, Request, ResponsePayload};
pub use tracker::{Tracker, VideoFrameAccessor};
pub use transport::{TcpTransport, Transport};
pub use types::*;

/// Result type alias for psmove-client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
