//! C FFI layer for psmove-client.
//!
//! One process-global client behind a mutex. Every function returns a
//! `PSMResult` code: -1 error, 0 success, 1 timeout, 2 request sent,
//! 3 canceled. The generated C header is written to
//! `include/psmove_client.h` by cbindgen.

use crate::client::{Client, SessionState};
use crate::config::ClientConfig;
use crate::controller::PsMoveButton;
use crate::error::LastError;
use crate::message::{Message, ResponseMessage};
use crate::protocol::OpaquePayload;
use crate::types::{DataStreamFlags, RequestId, TrackingColorType};
use crate::{ClientError, Result};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::{Mutex, MutexGuard};

static LAST_ERROR: LastError = LastError::new();

static STATE: Mutex<Option<FfiState>> = Mutex::new(None);

struct FfiState {
    client: Client,
    /// Keeps the payload of the last polled message alive for the caller.
    polled: Option<Message>,
}

const PSM_RESULT_ERROR: c_int = -1;
const PSM_RESULT_SUCCESS: c_int = 0;
const PSM_RESULT_REQUEST_SENT: c_int = 2;

/// A polled message in C layout.
///
/// `payload_type` is 0 for events and 1 for responses. For events
/// `event_type` is set and `payload` holds the service event body. For
/// responses `request_id`, `result_code` and the response body are set.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PsmMessage {
    pub payload_type: c_int,
    pub event_type: c_int,
    pub request_id: c_int,
    pub result_code: c_int,
    /// Tag of the request a response answers.
    pub request_tag: u8,
    /// Tag of `payload`.
    pub payload_tag: u8,
    pub payload: *const u8,
    pub payload_len: usize,
}

impl Default for PsmMessage {
    fn default() -> Self {
        Self {
            payload_type: 0,
            event_type: 0,
            request_id: -1,
            result_code: PSM_RESULT_ERROR,
            request_tag: 0,
            payload_tag: 0,
            payload: std::ptr::null(),
            payload_len: 0,
        }
    }
}

/// Controller snapshot in C layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PsmControllerState {
    /// -1 none, 0 PSMove, 1 PSNavi.
    pub controller_type: c_int,
    pub is_valid: bool,
    pub is_connected: bool,
    pub is_streaming: bool,
    pub input_sequence_num: c_int,
    pub output_sequence_num: c_int,
    pub data_frame_average_fps: f32,
    /// Centimeters.
    pub position: [f32; 3],
    /// [w, x, y, z].
    pub orientation: [f32; 4],
    /// Two bits per PSMove button, in button order.
    pub button_states: u32,
    pub trigger_value: u8,
    pub rumble: u8,
}

/// Response handler for `psm_register_callback`. The message and its payload
/// are only valid during the call.
pub type PsmResponseCallback = extern "C" fn(message: *const PsmMessage, userdata: *mut c_void);

struct UserData(*mut c_void);

// The pointer is handed back to the caller's own callback unchanged.
unsafe impl Send for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

fn lock_state() -> MutexGuard<'static, Option<FfiState>> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn report(result: Result<c_int>) -> c_int {
    match result {
        Ok(code) => {
            LAST_ERROR.clear();
            code
        }
        Err(e) => {
            log::debug!("FFI call failed: {}", e);
            LAST_ERROR.set(&e);
            e.result_code().to_wire() as c_int
        }
    }
}

fn with_client<F>(f: F) -> c_int
where
    F: FnOnce(&mut FfiState) -> Result<c_int>,
{
    let mut guard = lock_state();
    let result = match guard.as_mut() {
        Some(state) => f(state),
        None => Err(ClientError::NotConnected),
    };
    report(result)
}

/// Write a request id for an async helper and report `RequestSent`.
///
/// # Safety
/// `out` must be a valid pointer or null.
unsafe fn request_sent(request_id: RequestId, out: *mut c_int) -> c_int {
    if !out.is_null() {
        out.write(request_id.0);
    }
    PSM_RESULT_REQUEST_SENT
}

unsafe fn c_str_arg(s: *const c_char, name: &str) -> Result<String> {
    if s.is_null() {
        return Err(ClientError::Protocol(format!("{} is null", name)));
    }
    Ok(CStr::from_ptr(s).to_string_lossy().into_owned())
}

fn payload_parts(payload: &OpaquePayload) -> (u8, *const u8, usize) {
    if payload.bytes.is_empty() {
        (payload.tag, std::ptr::null(), 0)
    } else {
        (payload.tag, payload.bytes.as_ptr(), payload.bytes.len())
    }
}

fn response_to_c(response: &ResponseMessage) -> PsmMessage {
    let (payload_tag, payload, payload_len) = payload_parts(&response.response);
    PsmMessage {
        payload_type: 1,
        event_type: 0,
        request_id: response.request_id.0,
        result_code: response.result_code.to_wire() as c_int,
        request_tag: response.request.tag,
        payload_tag,
        payload,
        payload_len,
    }
}

/// Flatten a message. Pointers borrow from `message`.
fn message_to_c(message: &Message) -> PsmMessage {
    match message {
        Message::Event(event) => {
            let (payload_tag, payload, payload_len) = payload_parts(&event.event_data);
            PsmMessage {
                payload_type: 0,
                event_type: event.event_type as c_int,
                payload_tag,
                payload,
                payload_len,
                result_code: PSM_RESULT_SUCCESS,
                ..Default::default()
            }
        }
        Message::Response(response) => response_to_c(response),
    }
}

/// Library version as a null-terminated string.
#[no_mangle]
pub extern "C" fn psm_get_version_string() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Connect to PSMoveService. Settings other than the endpoint come from
/// `PSM_*` environment variables.
///
/// # Safety
/// `host` and `port` must be valid null-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn psm_initialize(host: *const c_char, port: *const c_char) -> c_int {
    let endpoint = c_str_arg(host, "host").and_then(|h| Ok((h, c_str_arg(port, "port")?)));
    let (host, port) = match endpoint {
        Ok(endpoint) => endpoint,
        Err(e) => return report(Err(e)),
    };

    let mut guard = lock_state();
    let reusable = match guard.as_ref().map(|state| state.client.state()) {
        Some(SessionState::Uninitialized) => true,
        Some(SessionState::Connected) | Some(SessionState::Disconnected) => {
            return report(Err(ClientError::Connection("client already initialized".into())));
        }
        Some(SessionState::ShutDown) | None => false,
    };

    // A failed attempt keeps the client so its failure event can be polled.
    if !reusable {
        *guard = None;
    }
    let state = guard.get_or_insert_with(|| FfiState {
        client: Client::with_config(ClientConfig::from_env().with_endpoint(&host, &port)),
        polled: None,
    });
    report(state.client.initialize(&host, &port).map(|_| PSM_RESULT_SUCCESS))
}

/// Disconnect and release the global client. Pending callbacks fire with
/// `Canceled` before this returns.
#[no_mangle]
pub extern "C" fn psm_shutdown() -> c_int {
    let mut guard = lock_state();
    let result = match guard.take() {
        Some(mut state) => state.client.shutdown().map(|_| PSM_RESULT_SUCCESS),
        None => Ok(PSM_RESULT_SUCCESS),
    };
    report(result)
}

/// Pump the connection. Registered callbacks run on this thread and must not
/// call back into this API.
#[no_mangle]
pub extern "C" fn psm_update() -> c_int {
    with_client(|state| {
        state.polled = None;
        state.client.pump().map(|_| PSM_RESULT_SUCCESS)
    })
}

/// Take the next queued message. Returns `Error` when the queue is empty;
/// in that case `psm_last_error` returns NULL, which tells an empty queue
/// apart from a real failure.
///
/// `size` must be `sizeof(PsmMessage)`. Payload pointers stay valid until the
/// next poll or update.
///
/// # Safety
/// `out` must point to a writable `PsmMessage`, or be null.
#[no_mangle]
pub unsafe extern "C" fn psm_poll_next_message(out: *mut PsmMessage, size: usize) -> c_int {
    if size != std::mem::size_of::<PsmMessage>() {
        return report(Err(ClientError::SizeMismatch {
            expected: std::mem::size_of::<PsmMessage>(),
            actual: size,
        }));
    }
    if out.is_null() {
        return report(Err(ClientError::Protocol("message pointer is null".into())));
    }
    with_client(|state| {
        state.polled = state.client.poll_next_message();
        match &state.polled {
            Some(message) => {
                out.write(message_to_c(message));
                Ok(PSM_RESULT_SUCCESS)
            }
            None => Ok(PSM_RESULT_ERROR),
        }
    })
}

/// Send a request body the typed API does not cover.
///
/// # Safety
/// `data` must point to `len` readable bytes (or be null with `len == 0`).
/// `out_request_id` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn psm_send_opaque_request(
    tag: u8,
    data: *const u8,
    len: usize,
    out_request_id: *mut c_int,
) -> c_int {
    let bytes = if data.is_null() || len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, len).to_vec()
    };
    with_client(|state| {
        let request_id = state
            .client
            .send_opaque_request(OpaquePayload::new(tag, bytes))?;
        Ok(request_sent(request_id, out_request_id))
    })
}

/// Route a pending request's response to `callback`.
///
/// # Safety
/// `userdata` is passed back untouched and must stay valid until the
/// callback has run or been canceled.
#[no_mangle]
pub unsafe extern "C" fn psm_register_callback(
    request_id: c_int,
    callback: PsmResponseCallback,
    userdata: *mut c_void,
) -> c_int {
    let userdata = UserData(userdata);
    with_client(move |state| {
        state
            .client
            .register_callback(RequestId(request_id), move |response: &ResponseMessage| {
                let message = response_to_c(response);
                callback(&message, userdata.get());
            })?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

#[no_mangle]
pub extern "C" fn psm_cancel_callback(request_id: c_int) -> c_int {
    with_client(|state| {
        state.client.cancel_callback(RequestId(request_id))?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

#[no_mangle]
pub extern "C" fn psm_eat_response(request_id: c_int) -> c_int {
    with_client(|state| {
        state.client.eat_response(RequestId(request_id))?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

#[no_mangle]
pub extern "C" fn psm_register_as_controller_listener(controller_id: c_int) -> c_int {
    with_client(|state| {
        state.client.register_as_controller_listener(controller_id)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

#[no_mangle]
pub extern "C" fn psm_deregister_as_controller_listener(controller_id: c_int) -> c_int {
    with_client(|state| {
        state.client.deregister_as_controller_listener(controller_id)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// `flags` is a bitmask: 1 position, 2 physics, 4 raw sensor, 8 raw tracker.
#[no_mangle]
pub extern "C" fn psm_start_controller_data_stream(controller_id: c_int, flags: u32) -> c_int {
    with_client(|state| {
        state
            .client
            .start_controller_data_stream(controller_id, DataStreamFlags::from_bits_truncate(flags))?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// # Safety
/// `out_request_id` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn psm_start_controller_data_stream_async(
    controller_id: c_int,
    flags: u32,
    out_request_id: *mut c_int,
) -> c_int {
    with_client(|state| {
        let request_id = state.client.start_controller_data_stream_async(
            controller_id,
            DataStreamFlags::from_bits_truncate(flags),
        )?;
        Ok(request_sent(request_id, out_request_id))
    })
}

#[no_mangle]
pub extern "C" fn psm_stop_controller_data_stream(controller_id: c_int) -> c_int {
    with_client(|state| {
        state.client.stop_controller_data_stream(controller_id)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// # Safety
/// `out_request_id` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn psm_stop_controller_data_stream_async(
    controller_id: c_int,
    out_request_id: *mut c_int,
) -> c_int {
    with_client(|state| {
        let request_id = state.client.stop_controller_data_stream_async(controller_id)?;
        Ok(request_sent(request_id, out_request_id))
    })
}

fn tracking_color_arg(color: c_int) -> Result<TrackingColorType> {
    u8::try_from(color)
        .ok()
        .and_then(TrackingColorType::from_wire)
        .ok_or_else(|| ClientError::Protocol(format!("invalid tracking color {}", color)))
}

#[no_mangle]
pub extern "C" fn psm_set_controller_led_color(controller_id: c_int, color: c_int) -> c_int {
    with_client(|state| {
        let color = tracking_color_arg(color)?;
        state.client.set_controller_led_color(controller_id, color)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// # Safety
/// `out_request_id` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn psm_set_controller_led_color_async(
    controller_id: c_int,
    color: c_int,
    out_request_id: *mut c_int,
) -> c_int {
    with_client(|state| {
        let color = tracking_color_arg(color)?;
        let request_id = state
            .client
            .set_controller_led_color_async(controller_id, color)?;
        Ok(request_sent(request_id, out_request_id))
    })
}

#[no_mangle]
pub extern "C" fn psm_reset_controller_pose(controller_id: c_int) -> c_int {
    with_client(|state| {
        state.client.reset_controller_pose(controller_id)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// # Safety
/// `out_request_id` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn psm_reset_controller_pose_async(
    controller_id: c_int,
    out_request_id: *mut c_int,
) -> c_int {
    with_client(|state| {
        let request_id = state.client.reset_controller_pose_async(controller_id)?;
        Ok(request_sent(request_id, out_request_id))
    })
}

/// Set rumble (0-255) and push pending output to the service.
#[no_mangle]
pub extern "C" fn psm_set_controller_rumble(controller_id: c_int, rumble: u8) -> c_int {
    with_client(|state| {
        let controller = state
            .client
            .controller_mut(controller_id)
            .ok_or(ClientError::unknown_controller(controller_id))?;
        if let Some(psmove) = controller.psmove_mut() {
            psmove.set_rumble(rumble);
        }
        state.client.update_controller(controller_id)?;
        Ok(PSM_RESULT_SUCCESS)
    })
}

/// Copy the mirrored state of a registered controller.
///
/// # Safety
/// `out` must point to a writable `PsmControllerState`, or be null.
#[no_mangle]
pub unsafe extern "C" fn psm_get_controller_state(
    controller_id: c_int,
    out: *mut PsmControllerState,
) -> c_int {
    if out.is_null() {
        return report(Err(ClientError::Protocol("state pointer is null".into())));
    }
    with_client(|state| {
        let controller = state
            .client
            .controller(controller_id)
            .ok_or(ClientError::unknown_controller(controller_id))?;
        let mut snapshot = PsmControllerState {
            controller_type: controller.controller_type().to_wire() as c_int,
            is_valid: controller.is_valid(),
            is_connected: controller.is_connected(),
            is_streaming: controller.is_streaming(),
            input_sequence_num: controller.input_sequence_num(),
            output_sequence_num: controller.output_sequence_num(),
            data_frame_average_fps: controller.data_frame_average_fps(),
            ..Default::default()
        };
        if let Some(psmove) = controller.psmove() {
            let p = psmove.pose.position;
            let q = psmove.pose.orientation;
            snapshot.position = [p.x, p.y, p.z];
            snapshot.orientation = [q.w, q.x, q.y, q.z];
            snapshot.button_states = pack_buttons(|b| psmove.button(b) as u32);
            snapshot.trigger_value = psmove.trigger_value;
            snapshot.rumble = psmove.rumble();
        }
        out.write(snapshot);
        Ok(PSM_RESULT_SUCCESS)
    })
}

fn pack_buttons(state_of: impl Fn(PsMoveButton) -> u32) -> u32 {
    PsMoveButton::ALL
        .iter()
        .enumerate()
        .fold(0, |acc, (i, b)| acc | (state_of(*b) & 0b11) << (2 * i))
}

/// Get the last error message. Returns NULL if the last call succeeded.
/// The returned pointer is valid until the next psm_* call.
#[no_mangle]
pub extern "C" fn psm_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventMessage, EventType};
    use crate::protocol::ResponsePayload;
    use crate::types::ResultCode;

    #[test]
    fn test_event_flattening() {
        let message = Message::Event(EventMessage {
            event_type: EventType::OpaqueServiceEvent,
            event_data: OpaquePayload::new(9, vec![1, 2]),
        });
        let c = message_to_c(&message);
        assert_eq!(c.payload_type, 0);
        assert_eq!(c.event_type, EventType::OpaqueServiceEvent as c_int);
        assert_eq!(c.payload_tag, 9);
        assert_eq!(c.payload_len, 2);
        let bytes = unsafe { std::slice::from_raw_parts(c.payload, c.payload_len) };
        assert_eq!(bytes, &[1, 2]);
    }

    #[test]
    fn test_response_flattening() {
        let message = Message::Response(ResponseMessage {
            request_id: RequestId(41),
            result_code: ResultCode::Canceled,
            request: OpaquePayload::empty(0x10),
            response: OpaquePayload::default(),
            payload: ResponsePayload::Empty,
        });
        let c = message_to_c(&message);
        assert_eq!(c.payload_type, 1);
        assert_eq!(c.request_id, 41);
        assert_eq!(c.result_code, 3);
        assert_eq!(c.request_tag, 0x10);
        assert!(c.payload.is_null());
    }

    #[test]
    fn test_button_packing() {
        let packed = pack_buttons(|b| if b == PsMoveButton::Trigger { 3 } else { 0 });
        assert_eq!(packed, 0b11 << (2 * PsMoveButton::Trigger as u32));
    }

    // The global client is shared, so every step runs in one test.
    #[test]
    fn test_global_client_lifecycle() {
        assert!(!psm_get_version_string().is_null());

        let mut msg = PsmMessage::default();
        let wrong = std::mem::size_of::<PsmMessage>() - 1;
        assert_eq!(unsafe { psm_poll_next_message(&mut msg, wrong) }, PSM_RESULT_ERROR);
        assert!(!psm_last_error().is_null());

        assert_eq!(psm_update(), PSM_RESULT_ERROR);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = std::ffi::CString::new(listener.local_addr().unwrap().port().to_string()).unwrap();
        drop(listener);
        let host = std::ffi::CString::new("127.0.0.1").unwrap();
        assert_eq!(
            unsafe { psm_initialize(host.as_ptr(), port.as_ptr()) },
            PSM_RESULT_ERROR
        );
        assert_eq!(unsafe { psm_initialize(std::ptr::null(), port.as_ptr()) }, PSM_RESULT_ERROR);

        // The failed attempt left its event behind.
        let size = std::mem::size_of::<PsmMessage>();
        assert_eq!(unsafe { psm_poll_next_message(&mut msg, size) }, PSM_RESULT_SUCCESS);
        assert_eq!(msg.payload_type, 0);
        assert_eq!(msg.event_type, EventType::FailedToConnectToService as c_int);
        assert_eq!(unsafe { psm_poll_next_message(&mut msg, size) }, PSM_RESULT_ERROR);
        assert!(psm_last_error().is_null());

        // Retrying is allowed while nothing is connected.
        assert_eq!(
            unsafe { psm_initialize(host.as_ptr(), port.as_ptr()) },
            PSM_RESULT_ERROR
        );
        let error = unsafe { CStr::from_ptr(psm_last_error()) }.to_string_lossy().into_owned();
        assert!(!error.contains("already"), "{}", error);

        assert_eq!(psm_shutdown(), PSM_RESULT_SUCCESS);
        assert!(psm_last_error().is_null());
    }
}
