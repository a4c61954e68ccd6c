//! Binary framing and payload codecs.
//!
//! Every frame is `[u32 LE body_len][body]`; the first body byte is the
//! frame kind. All multi-byte values are little-endian. Request and
//! response bodies travel as [`OpaquePayload`]s (discriminant + bytes);
//! the typed codecs below are an optional layer on top of them.

use crate::types::*;
use crate::{ClientError, Result};

// -- Frame geometry --
pub const FRAME_HEADER_LEN: usize = 4;

// -- Frame kinds --
pub const KIND_REQUEST: u8 = 0x01;
pub const KIND_RESPONSE: u8 = 0x02;
pub const KIND_EVENT: u8 = 0x03;
pub const KIND_CONTROLLER_DATA: u8 = 0x04;
pub const KIND_TRACKER_DATA: u8 = 0x05;

// -- Service event tags --
pub const EVENT_CONTROLLER_LIST_UPDATED: u8 = 0x01;
pub const EVENT_TRACKER_LIST_UPDATED: u8 = 0x02;

// -- Tracking projection shapes --
const SHAPE_INVALID: u8 = 0;
const SHAPE_ELLIPSE: u8 = 1;
const SHAPE_QUAD: u8 = 2;

/// A discriminant tag and the bytes it describes, always kept together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpaquePayload {
    pub tag: u8,
    pub bytes: Vec<u8>,
}

impl OpaquePayload {
    pub fn new(tag: u8, bytes: Vec<u8>) -> Self {
        Self { tag, bytes }
    }

    pub fn empty(tag: u8) -> Self {
        Self {
            tag,
            bytes: Vec::new(),
        }
    }
}

/// Request discriminants understood by the service.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    GetControllerList = 0x00,
    StartControllerDataStream = 0x01,
    StopControllerDataStream = 0x02,
    ResetPose = 0x03,
    SetLedTrackingColor = 0x04,
    SetControllerOutput = 0x05,
    GetTrackerList = 0x10,
    StartTrackerDataStream = 0x11,
    StopTrackerDataStream = 0x12,
    GetTrackerSettings = 0x13,
    SetTrackerExposure = 0x14,
    GetHmdTrackingSpaceSettings = 0x20,
}

impl RequestType {
    pub fn from_tag(tag: u8) -> Option<RequestType> {
        Some(match tag {
            0x00 => RequestType::GetControllerList,
            0x01 => RequestType::StartControllerDataStream,
            0x02 => RequestType::StopControllerDataStream,
            0x03 => RequestType::ResetPose,
            0x04 => RequestType::SetLedTrackingColor,
            0x05 => RequestType::SetControllerOutput,
            0x10 => RequestType::GetTrackerList,
            0x11 => RequestType::StartTrackerDataStream,
            0x12 => RequestType::StopTrackerDataStream,
            0x13 => RequestType::GetTrackerSettings,
            0x14 => RequestType::SetTrackerExposure,
            0x20 => RequestType::GetHmdTrackingSpaceSettings,
            _ => return None,
        })
    }
}

/// Typed requests this client knows how to build.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetControllerList,
    StartControllerDataStream {
        controller_id: i32,
        flags: DataStreamFlags,
    },
    StopControllerDataStream {
        controller_id: i32,
    },
    ResetPose {
        controller_id: i32,
    },
    SetLedTrackingColor {
        controller_id: i32,
        color: TrackingColorType,
    },
    SetControllerOutput {
        controller_id: i32,
        sequence_num: i32,
        rumble: u8,
        led: [u8; 3],
    },
    GetTrackerList,
    StartTrackerDataStream {
        tracker_id: i32,
    },
    StopTrackerDataStream {
        tracker_id: i32,
    },
    GetTrackerSettings {
        tracker_id: i32,
    },
    SetTrackerExposure {
        tracker_id: i32,
        exposure: f64,
    },
    GetHmdTrackingSpaceSettings,
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::GetControllerList => RequestType::GetControllerList,
            Request::StartControllerDataStream { .. } => RequestType::StartControllerDataStream,
            Request::StopControllerDataStream { .. } => RequestType::StopControllerDataStream,
            Request::ResetPose { .. } => RequestType::ResetPose,
            Request::SetLedTrackingColor { .. } => RequestType::SetLedTrackingColor,
            Request::SetControllerOutput { .. } => RequestType::SetControllerOutput,
            Request::GetTrackerList => RequestType::GetTrackerList,
            Request::StartTrackerDataStream { .. } => RequestType::StartTrackerDataStream,
            Request::StopTrackerDataStream { .. } => RequestType::StopTrackerDataStream,
            Request::GetTrackerSettings { .. } => RequestType::GetTrackerSettings,
            Request::SetTrackerExposure { .. } => RequestType::SetTrackerExposure,
            Request::GetHmdTrackingSpaceSettings => RequestType::GetHmdTrackingSpaceSettings,
        }
    }

    pub fn to_payload(&self) -> OpaquePayload {
        let mut w = ByteWriter::default();
        match self {
            Request::GetControllerList
            | Request::GetTrackerList
            | Request::GetHmdTrackingSpaceSettings => {}
            Request::StartControllerDataStream {
                controller_id,
                flags,
            } => {
                w.put_i32(*controller_id);
                w.put_u32(flags.bits());
            }
            Request::StopControllerDataStream { controller_id }
            | Request::ResetPose { controller_id } => w.put_i32(*controller_id),
            Request::SetLedTrackingColor {
                controller_id,
                color,
            } => {
                w.put_i32(*controller_id);
                w.put_u8(*color as u8);
            }
            Request::SetControllerOutput {
                controller_id,
                sequence_num,
                rumble,
                led,
            } => {
                w.put_i32(*controller_id);
                w.put_i32(*sequence_num);
                w.put_u8(*rumble);
                w.put_bytes(led);
            }
            Request::StartTrackerDataStream { tracker_id }
            | Request::StopTrackerDataStream { tracker_id }
            | Request::GetTrackerSettings { tracker_id } => w.put_i32(*tracker_id),
            Request::SetTrackerExposure {
                tracker_id,
                exposure,
            } => {
                w.put_i32(*tracker_id);
                w.put_f64(*exposure);
            }
        }
        OpaquePayload::new(self.request_type() as u8, w.into_inner())
    }

    pub fn from_payload(payload: &OpaquePayload) -> Result<Request> {
        let kind = RequestType::from_tag(payload.tag)
            .ok_or_else(|| ClientError::Protocol(format!("unknown request tag 0x{:02x}", payload.tag)))?;
        let mut r = ByteReader::new(&payload.bytes);
        let request = match kind {
            RequestType::GetControllerList => Request::GetControllerList,
            RequestType::StartControllerDataStream => Request::StartControllerDataStream {
                controller_id: r.i32()?,
                flags: DataStreamFlags::from_bits_truncate(r.u32()?),
            },
            RequestType::StopControllerDataStream => Request::StopControllerDataStream {
                controller_id: r.i32()?,
            },
            RequestType::ResetPose => Request::ResetPose {
                controller_id: r.i32()?,
            },
            RequestType::SetLedTrackingColor => {
                let controller_id = r.i32()?;
                let raw = r.u8()?;
                let color = TrackingColorType::from_wire(raw)
                    .ok_or_else(|| ClientError::Protocol(format!("bad tracking color {}", raw)))?;
                Request::SetLedTrackingColor {
                    controller_id,
                    color,
                }
            }
            RequestType::SetControllerOutput => Request::SetControllerOutput {
                controller_id: r.i32()?,
                sequence_num: r.i32()?,
                rumble: r.u8()?,
                led: [r.u8()?, r.u8()?, r.u8()?],
            },
            RequestType::GetTrackerList => Request::GetTrackerList,
            RequestType::StartTrackerDataStream => Request::StartTrackerDataStream {
                tracker_id: r.i32()?,
            },
            RequestType::StopTrackerDataStream => Request::StopTrackerDataStream {
                tracker_id: r.i32()?,
            },
            RequestType::GetTrackerSettings => Request::GetTrackerSettings {
                tracker_id: r.i32()?,
            },
            RequestType::SetTrackerExposure => Request::SetTrackerExposure {
                tracker_id: r.i32()?,
                exposure: r.f64()?,
            },
            RequestType::GetHmdTrackingSpaceSettings => Request::GetHmdTrackingSpaceSettings,
        };
        Ok(request)
    }
}

/// Response payload discriminants.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Empty = 0,
    ControllerList = 1,
    TrackerList = 2,
    TrackerSettings = 3,
    HmdTrackingSpace = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerListEntry {
    pub controller_id: i32,
    pub controller_type: ControllerType,
    pub device_path: String,
    pub device_serial: String,
}

/// Controllers known to the service, at most [`MAX_CONTROLLER_COUNT`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerList {
    pub controllers: Vec<ControllerListEntry>,
}

impl ControllerList {
    pub fn get(&self, controller_id: i32) -> Option<&ControllerListEntry> {
        self.controllers
            .iter()
            .find(|c| c.controller_id == controller_id)
    }
}

/// Static description of a tracker camera.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackerInfo {
    pub tracker_id: i32,
    pub tracker_type: TrackerType,
    pub tracker_driver: TrackerDriver,
    pub device_path: String,
    /// Name of the shared memory segment carrying video frames.
    pub shared_memory_name: String,
    /// Focal lengths in pixels.
    pub focal_lengths: Vector2f,
    pub principal_point: Vector2f,
    pub screen_dimensions: Vector2f,
    /// Degrees.
    pub hfov: f32,
    pub vfov: f32,
    /// Centimeters.
    pub znear: f32,
    pub zfar: f32,
    pub pose: Posef,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackerList {
    pub trackers: Vec<TrackerInfo>,
}

impl TrackerList {
    pub fn get(&self, tracker_id: i32) -> Option<&TrackerInfo> {
        self.trackers.iter().find(|t| t.tracker_id == tracker_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackerSettings {
    pub tracker_id: i32,
    pub exposure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HmdTrackingSpace {
    pub origin_pose: Posef,
}

/// Typed view of a response body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponsePayload {
    #[default]
    Empty,
    ControllerList(ControllerList),
    TrackerList(TrackerList),
    TrackerSettings(TrackerSettings),
    HmdTrackingSpace(HmdTrackingSpace),
}

impl ResponsePayload {
    pub fn response_type(&self) -> ResponseType {
        match self {
            ResponsePayload::Empty => ResponseType::Empty,
            ResponsePayload::ControllerList(_) => ResponseType::ControllerList,
            ResponsePayload::TrackerList(_) => ResponseType::TrackerList,
            ResponsePayload::TrackerSettings(_) => ResponseType::TrackerSettings,
            ResponsePayload::HmdTrackingSpace(_) => ResponseType::HmdTrackingSpace,
        }
    }

    pub fn to_payload(&self) -> OpaquePayload {
        let mut w = ByteWriter::default();
        match self {
            ResponsePayload::Empty => {}
            ResponsePayload::ControllerList(list) => {
                let count = list.controllers.len().min(MAX_CONTROLLER_COUNT);
                w.put_u8(count as u8);
                for entry in &list.controllers[..count] {
                    w.put_i32(entry.controller_id);
                    w.put_i8(entry.controller_type.to_wire());
                    w.put_str(&entry.device_path);
                    w.put_str(&entry.device_serial);
                }
            }
            ResponsePayload::TrackerList(list) => {
                let count = list.trackers.len().min(MAX_TRACKER_COUNT);
                w.put_u8(count as u8);
                for info in &list.trackers[..count] {
                    w.put_tracker_info(info);
                }
            }
            ResponsePayload::TrackerSettings(settings) => {
                w.put_i32(settings.tracker_id);
                w.put_f64(settings.exposure);
            }
            ResponsePayload::HmdTrackingSpace(space) => w.put_pose(&space.origin_pose),
        }
        OpaquePayload::new(self.response_type() as u8, w.into_inner())
    }

    /// Decode a response body. Unknown tags decode as `Empty` so that newer
    /// services remain usable through the opaque bytes.
    pub fn decode(payload: &OpaquePayload) -> Result<ResponsePayload> {
        let mut r = ByteReader::new(&payload.bytes);
        let decoded = match payload.tag {
            t if t == ResponseType::ControllerList as u8 => {
                let count = r.u8()? as usize;
                let mut controllers = Vec::with_capacity(count.min(MAX_CONTROLLER_COUNT));
                for _ in 0..count {
                    let entry = ControllerListEntry {
                        controller_id: r.i32()?,
                        controller_type: ControllerType::from_wire(r.i8()?),
                        device_path: r.string()?,
                        device_serial: r.string()?,
                    };
                    if controllers.len() < MAX_CONTROLLER_COUNT {
                        controllers.push(entry);
                    }
                }
                ResponsePayload::ControllerList(ControllerList { controllers })
            }
            t if t == ResponseType::TrackerList as u8 => {
                let count = r.u8()? as usize;
                let mut trackers = Vec::with_capacity(count.min(MAX_TRACKER_COUNT));
                for _ in 0..count {
                    let info = r.tracker_info()?;
                    if trackers.len() < MAX_TRACKER_COUNT {
                        trackers.push(info);
                    }
                }
                ResponsePayload::TrackerList(TrackerList { trackers })
            }
            t if t == ResponseType::TrackerSettings as u8 => {
                ResponsePayload::TrackerSettings(TrackerSettings {
                    tracker_id: r.i32()?,
                    exposure: r.f64()?,
                })
            }
            t if t == ResponseType::HmdTrackingSpace as u8 => {
                ResponsePayload::HmdTrackingSpace(HmdTrackingSpace {
                    origin_pose: r.pose()?,
                })
            }
            _ => ResponsePayload::Empty,
        };
        Ok(decoded)
    }
}

/// One streamed PSMove sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PsMoveDataFrame {
    pub has_valid_hardware_calibration: bool,
    pub is_tracking_enabled: bool,
    pub is_currently_tracking: bool,
    pub tracking_color: TrackingColorType,
    pub pose: Posef,
    /// Level bitmask, one bit per [`PsMoveButton`](crate::controller::PsMoveButton).
    pub buttons: u32,
    pub trigger: u8,
    /// Segments present in this frame.
    pub segments: DataStreamFlags,
    pub physics: Option<PhysicsData>,
    pub raw_sensor: Option<RawSensorData>,
    pub raw_tracker: Option<RawTrackerData>,
}

/// One streamed PSNavi sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PsNaviDataFrame {
    /// Level bitmask, one bit per [`PsNaviButton`](crate::controller::PsNaviButton).
    pub buttons: u32,
    pub trigger: u8,
    pub stick_x: u8,
    pub stick_y: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerDataBody {
    PsMove(PsMoveDataFrame),
    PsNavi(PsNaviDataFrame),
}

impl ControllerDataBody {
    pub fn controller_type(&self) -> ControllerType {
        match self {
            ControllerDataBody::PsMove(_) => ControllerType::PsMove,
            ControllerDataBody::PsNavi(_) => ControllerType::PsNavi,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerDataFrame {
    pub controller_id: i32,
    pub sequence_num: i32,
    pub is_connected: bool,
    pub body: ControllerDataBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerDataFrame {
    pub tracker_id: i32,
    pub sequence_num: i32,
    pub is_connected: bool,
}

/// A decoded frame of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        request_id: RequestId,
        payload: OpaquePayload,
    },
    Response {
        request_id: RequestId,
        result: ResultCode,
        payload: OpaquePayload,
    },
    /// Unsolicited service event; the tag is the event type.
    Event(OpaquePayload),
    ControllerData(ControllerDataFrame),
    TrackerData(TrackerDataFrame),
}

impl Frame {
    /// Encode the frame including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::default();
        w.put_u32(0); // length, patched below
        match self {
            Frame::Request {
                request_id,
                payload,
            } => {
                w.put_u8(KIND_REQUEST);
                w.put_i32(request_id.0);
                w.put_u8(payload.tag);
                w.put_bytes(&payload.bytes);
            }
            Frame::Response {
                request_id,
                result,
                payload,
            } => {
                w.put_u8(KIND_RESPONSE);
                w.put_i32(request_id.0);
                w.put_i8(result.to_wire());
                w.put_u8(payload.tag);
                w.put_bytes(&payload.bytes);
            }
            Frame::Event(payload) => {
                w.put_u8(KIND_EVENT);
                w.put_u8(payload.tag);
                w.put_bytes(&payload.bytes);
            }
            Frame::ControllerData(frame) => {
                w.put_u8(KIND_CONTROLLER_DATA);
                w.put_controller_frame(frame);
            }
            Frame::TrackerData(frame) => {
                w.put_u8(KIND_TRACKER_DATA);
                w.put_i32(frame.tracker_id);
                w.put_i32(frame.sequence_num);
                w.put_bool(frame.is_connected);
            }
        }
        let mut buf = w.into_inner();
        let body_len = (buf.len() - FRAME_HEADER_LEN) as u32;
        buf[..FRAME_HEADER_LEN].copy_from_slice(&body_len.to_le_bytes());
        buf
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Frame> {
        let mut r = ByteReader::new(body);
        let kind = r.u8()?;
        let frame = match kind {
            KIND_REQUEST => {
                let request_id = RequestId(r.i32()?);
                let tag = r.u8()?;
                Frame::Request {
                    request_id,
                    payload: OpaquePayload::new(tag, r.rest().to_vec()),
                }
            }
            KIND_RESPONSE => {
                let request_id = RequestId(r.i32()?);
                let raw = r.i8()?;
                let result = ResultCode::from_wire(raw)
                    .ok_or_else(|| ClientError::Protocol(format!("bad result code {}", raw)))?;
                let tag = r.u8()?;
                Frame::Response {
                    request_id,
                    result,
                    payload: OpaquePayload::new(tag, r.rest().to_vec()),
                }
            }
            KIND_EVENT => {
                let tag = r.u8()?;
                Frame::Event(OpaquePayload::new(tag, r.rest().to_vec()))
            }
            KIND_CONTROLLER_DATA => Frame::ControllerData(r.controller_frame()?),
            KIND_TRACKER_DATA => Frame::TrackerData(TrackerDataFrame {
                tracker_id: r.i32()?,
                sequence_num: r.i32()?,
                is_connected: r.bool()?,
            }),
            other => {
                return Err(ClientError::Protocol(format!(
                    "unknown frame kind 0x{:02x}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

/// Reassembles frames from a byte stream that may split them arbitrarily.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let body_len =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if body_len == 0 || body_len > self.max_frame_len {
            return Err(ClientError::Protocol(format!(
                "frame length {} outside 1..={}",
                body_len, self.max_frame_len
            )));
        }
        let total = FRAME_HEADER_LEN + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame = Frame::decode(&self.buf[FRAME_HEADER_LEN..total]);
        self.buf.drain(..total);
        frame.map(Some)
    }
}

// -- Byte helpers --

#[derive(Default)]
struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.put_bytes(&v.to_le_bytes());
    }

    /// u16 length followed by UTF-8 bytes, truncated to `u16::MAX`.
    fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.put_bytes(&(len as u16).to_le_bytes());
        self.put_bytes(&bytes[..len]);
    }

    fn put_vec2(&mut self, v: &Vector2f) {
        self.put_f32(v.x);
        self.put_f32(v.y);
    }

    fn put_vec3(&mut self, v: &Vector3f) {
        self.put_f32(v.x);
        self.put_f32(v.y);
        self.put_f32(v.z);
    }

    fn put_pose(&mut self, pose: &Posef) {
        self.put_vec3(&pose.position);
        let q = &pose.orientation;
        self.put_f32(q.x);
        self.put_f32(q.y);
        self.put_f32(q.z);
        self.put_f32(q.w);
    }

    fn put_tracker_info(&mut self, info: &TrackerInfo) {
        self.put_i32(info.tracker_id);
        self.put_u8(info.tracker_type as u8);
        self.put_u8(info.tracker_driver as u8);
        self.put_str(&info.device_path);
        self.put_str(&info.shared_memory_name);
        self.put_vec2(&info.focal_lengths);
        self.put_vec2(&info.principal_point);
        self.put_vec2(&info.screen_dimensions);
        self.put_f32(info.hfov);
        self.put_f32(info.vfov);
        self.put_f32(info.znear);
        self.put_f32(info.zfar);
        self.put_pose(&info.pose);
    }

    fn put_projection(&mut self, projection: &TrackingProjection) {
        match projection {
            TrackingProjection::Invalid => self.put_u8(SHAPE_INVALID),
            TrackingProjection::Ellipse {
                center,
                half_x_extent,
                half_y_extent,
                angle,
            } => {
                self.put_u8(SHAPE_ELLIPSE);
                self.put_vec2(center);
                self.put_f32(*half_x_extent);
                self.put_f32(*half_y_extent);
                self.put_f32(*angle);
            }
            TrackingProjection::Quad { corners } => {
                self.put_u8(SHAPE_QUAD);
                for corner in corners {
                    self.put_vec2(corner);
                }
            }
        }
    }

    fn put_controller_frame(&mut self, frame: &ControllerDataFrame) {
        self.put_i32(frame.controller_id);
        self.put_i32(frame.sequence_num);
        self.put_bool(frame.is_connected);
        self.put_i8(frame.body.controller_type().to_wire());
        match &frame.body {
            ControllerDataBody::PsMove(m) => {
                let mut segments = m.segments
                    & !(DataStreamFlags::INCLUDE_PHYSICS
                        | DataStreamFlags::INCLUDE_RAW_SENSOR
                        | DataStreamFlags::INCLUDE_RAW_TRACKER);
                segments.set(DataStreamFlags::INCLUDE_PHYSICS, m.physics.is_some());
                segments.set(DataStreamFlags::INCLUDE_RAW_SENSOR, m.raw_sensor.is_some());
                segments.set(DataStreamFlags::INCLUDE_RAW_TRACKER, m.raw_tracker.is_some());
                self.put_bool(m.has_valid_hardware_calibration);
                self.put_bool(m.is_tracking_enabled);
                self.put_bool(m.is_currently_tracking);
                self.put_u8(m.tracking_color as u8);
                self.put_pose(&m.pose);
                self.put_u32(m.buttons);
                self.put_u8(m.trigger);
                self.put_u8(segments.bits() as u8);
                if let Some(p) = &m.physics {
                    self.put_vec3(&p.linear_velocity);
                    self.put_vec3(&p.linear_acceleration);
                    self.put_vec3(&p.angular_velocity);
                    self.put_vec3(&p.angular_acceleration);
                    self.put_f64(p.time_in_seconds);
                }
                if let Some(s) = &m.raw_sensor {
                    self.put_i32(s.magnetometer.x);
                    self.put_i32(s.magnetometer.y);
                    self.put_i32(s.magnetometer.z);
                    self.put_vec3(&s.accelerometer);
                    self.put_vec3(&s.gyroscope);
                    self.put_f64(s.time_in_seconds);
                }
                if let Some(t) = &m.raw_tracker {
                    self.put_u8(t.valid_tracker_locations() as u8);
                    for sample in t.iter() {
                        self.put_i32(sample.tracker_id);
                        self.put_vec2(&sample.screen_location);
                        self.put_vec3(&sample.relative_position);
                        self.put_projection(&sample.projection);
                    }
                }
            }
            ControllerDataBody::PsNavi(n) => {
                self.put_u32(n.buttons);
                self.put_u8(n.trigger);
                self.put_u8(n.stick_x);
                self.put_u8(n.stick_y);
            }
        }
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(ClientError::Protocol(format!(
                "truncated payload: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn vec2(&mut self) -> Result<Vector2f> {
        Ok(Vector2f {
            x: self.f32()?,
            y: self.f32()?,
        })
    }

    fn vec3(&mut self) -> Result<Vector3f> {
        Ok(Vector3f {
            x: self.f32()?,
            y: self.f32()?,
            z: self.f32()?,
        })
    }

    fn pose(&mut self) -> Result<Posef> {
        Ok(Posef {
            position: self.vec3()?,
            orientation: Quatf {
                x: self.f32()?,
                y: self.f32()?,
                z: self.f32()?,
                w: self.f32()?,
            },
        })
    }

    fn tracker_info(&mut self) -> Result<TrackerInfo> {
        Ok(TrackerInfo {
            tracker_id: self.i32()?,
            tracker_type: TrackerType::from_wire(self.u8()?),
            tracker_driver: TrackerDriver::from_wire(self.u8()?),
            device_path: self.string()?,
            shared_memory_name: self.string()?,
            focal_lengths: self.vec2()?,
            principal_point: self.vec2()?,
            screen_dimensions: self.vec2()?,
            hfov: self.f32()?,
            vfov: self.f32()?,
            znear: self.f32()?,
            zfar: self.f32()?,
            pose: self.pose()?,
        })
    }

    fn projection(&mut self) -> Result<TrackingProjection> {
        Ok(match self.u8()? {
            SHAPE_ELLIPSE => TrackingProjection::Ellipse {
                center: self.vec2()?,
                half_x_extent: self.f32()?,
                half_y_extent: self.f32()?,
                angle: self.f32()?,
            },
            SHAPE_QUAD => TrackingProjection::Quad {
                corners: [self.vec2()?, self.vec2()?, self.vec2()?, self.vec2()?],
            },
            _ => TrackingProjection::Invalid,
        })
    }

    fn controller_frame(&mut self) -> Result<ControllerDataFrame> {
        let controller_id = self.i32()?;
        let sequence_num = self.i32()?;
        let is_connected = self.bool()?;
        let body = match ControllerType::from_wire(self.i8()?) {
            ControllerType::PsMove => {
                let mut m = PsMoveDataFrame {
                    has_valid_hardware_calibration: self.bool()?,
                    is_tracking_enabled: self.bool()?,
                    is_currently_tracking: self.bool()?,
                    tracking_color: TrackingColorType::from_wire(self.u8()?).unwrap_or_default(),
                    pose: self.pose()?,
                    buttons: self.u32()?,
                    trigger: self.u8()?,
                    ..Default::default()
                };
                m.segments = DataStreamFlags::from_bits_truncate(self.u8()? as u32);
                if m.segments.contains(DataStreamFlags::INCLUDE_PHYSICS) {
                    m.physics = Some(PhysicsData {
                        linear_velocity: self.vec3()?,
                        linear_acceleration: self.vec3()?,
                        angular_velocity: self.vec3()?,
                        angular_acceleration: self.vec3()?,
                        time_in_seconds: self.f64()?,
                    });
                }
                if m.segments.contains(DataStreamFlags::INCLUDE_RAW_SENSOR) {
                    m.raw_sensor = Some(RawSensorData {
                        magnetometer: Vector3i {
                            x: self.i32()?,
                            y: self.i32()?,
                            z: self.i32()?,
                        },
                        accelerometer: self.vec3()?,
                        gyroscope: self.vec3()?,
                        time_in_seconds: self.f64()?,
                    });
                }
                if m.segments.contains(DataStreamFlags::INCLUDE_RAW_TRACKER) {
                    let count = self.u8()? as usize;
                    let mut data = RawTrackerData::default();
                    for _ in 0..count {
                        let sample = TrackerSample {
                            tracker_id: self.i32()?,
                            screen_location: self.vec2()?,
                            relative_position: self.vec3()?,
                            projection: self.projection()?,
                        };
                        // Observations past the bound are dropped.
                        data.push(sample);
                    }
                    m.raw_tracker = Some(data);
                }
                ControllerDataBody::PsMove(m)
            }
            ControllerType::PsNavi => ControllerDataBody::PsNavi(PsNaviDataFrame {
                buttons: self.u32()?,
                trigger: self.u8()?,
                stick_x: self.u8()?,
                stick_y: self.u8()?,
            }),
            ControllerType::None => {
                return Err(ClientError::Protocol(format!(
                    "data frame for controller {} has no controller type",
                    controller_id
                )))
            }
        };
        Ok(ControllerDataFrame {
            controller_id,
            sequence_num,
            is_connected,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psmove_frame() -> ControllerDataFrame {
        let mut raw_tracker = RawTrackerData::default();
        raw_tracker.push(TrackerSample {
            tracker_id: 2,
            screen_location: Vector2f { x: 320.0, y: 240.0 },
            relative_position: Vector3f {
                x: 1.0,
                y: 2.0,
                z: 50.0,
            },
            projection: TrackingProjection::Ellipse {
                center: Vector2f { x: 320.0, y: 240.0 },
                half_x_extent: 4.0,
                half_y_extent: 3.5,
                angle: 0.25,
            },
        });
        ControllerDataFrame {
            controller_id: 1,
            sequence_num: 42,
            is_connected: true,
            body: ControllerDataBody::PsMove(PsMoveDataFrame {
                is_tracking_enabled: true,
                is_currently_tracking: true,
                tracking_color: TrackingColorType::Cyan,
                pose: Posef {
                    position: Vector3f {
                        x: 1.5,
                        y: -2.0,
                        z: 30.0,
                    },
                    orientation: Quatf::default(),
                },
                buttons: 0b1_0000_0001,
                trigger: 200,
                segments: DataStreamFlags::INCLUDE_POSITION,
                raw_sensor: Some(RawSensorData {
                    magnetometer: Vector3i { x: 1, y: -2, z: 3 },
                    time_in_seconds: 0.5,
                    ..Default::default()
                }),
                raw_tracker: Some(raw_tracker),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_frame_layout_of_request() {
        let frame = Frame::Request {
            request_id: RequestId(7),
            payload: Request::ResetPose { controller_id: 3 }.to_payload(),
        };
        let bytes = frame.encode();
        // [len=10][kind][id][tag][controller id]
        assert_eq!(&bytes[..4], &10u32.to_le_bytes());
        assert_eq!(bytes[4], KIND_REQUEST);
        assert_eq!(&bytes[5..9], &7i32.to_le_bytes());
        assert_eq!(bytes[9], RequestType::ResetPose as u8);
        assert_eq!(&bytes[10..14], &3i32.to_le_bytes());
        assert_eq!(Frame::decode(&bytes[4..]).unwrap(), frame);
    }

    #[test]
    fn test_controller_frame_segments_follow_options() {
        let frame = psmove_frame();
        let bytes = Frame::ControllerData(frame.clone()).encode();
        let decoded = Frame::decode(&bytes[4..]).unwrap();
        let Frame::ControllerData(decoded) = decoded else {
            panic!("expected controller data");
        };
        let ControllerDataBody::PsMove(m) = &decoded.body else {
            panic!("expected psmove body");
        };
        assert!(m.physics.is_none());
        assert!(m.segments.contains(DataStreamFlags::INCLUDE_POSITION));
        assert!(m.segments.contains(DataStreamFlags::INCLUDE_RAW_SENSOR));
        assert!(m.segments.contains(DataStreamFlags::INCLUDE_RAW_TRACKER));
        assert_eq!(decoded, frame_with_segments(frame));
    }

    fn frame_with_segments(mut frame: ControllerDataFrame) -> ControllerDataFrame {
        if let ControllerDataBody::PsMove(m) = &mut frame.body {
            m.segments |= DataStreamFlags::INCLUDE_RAW_SENSOR | DataStreamFlags::INCLUDE_RAW_TRACKER;
        }
        frame
    }

    #[test]
    fn test_controller_list_saturates_at_max() {
        let list = ControllerList {
            controllers: (0..MAX_CONTROLLER_COUNT as i32 + 3)
                .map(|id| ControllerListEntry {
                    controller_id: id,
                    controller_type: ControllerType::PsMove,
                    device_path: format!("/dev/hidraw{}", id),
                    device_serial: format!("00:06:f7:00:00:{:02x}", id),
                })
                .collect(),
        };
        let payload = ResponsePayload::ControllerList(list).to_payload();
        let ResponsePayload::ControllerList(decoded) = ResponsePayload::decode(&payload).unwrap()
        else {
            panic!("expected controller list");
        };
        assert_eq!(decoded.controllers.len(), MAX_CONTROLLER_COUNT);
        assert_eq!(decoded.get(2).unwrap().device_path, "/dev/hidraw2");
    }

    #[test]
    fn test_tracker_list_payload() {
        let info = TrackerInfo {
            tracker_id: 0,
            tracker_driver: TrackerDriver::GenericWebcam,
            device_path: "usb:1:2".into(),
            shared_memory_name: "tracker_0_video".into(),
            hfov: 60.0,
            zfar: 200.0,
            ..Default::default()
        };
        let payload = ResponsePayload::TrackerList(TrackerList {
            trackers: vec![info.clone()],
        })
        .to_payload();
        assert_eq!(payload.tag, ResponseType::TrackerList as u8);
        let decoded = ResponsePayload::decode(&payload).unwrap();
        assert_eq!(
            decoded,
            ResponsePayload::TrackerList(TrackerList {
                trackers: vec![info]
            })
        );
    }

    #[test]
    fn test_truncated_payload_is_protocol_error() {
        let payload = OpaquePayload::new(ResponseType::TrackerSettings as u8, vec![1, 0]);
        match ResponsePayload::decode(&payload) {
            Err(ClientError::Protocol(msg)) => assert!(msg.contains("truncated"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_response_tag_is_empty() {
        let payload = OpaquePayload::new(0x7F, vec![1, 2, 3]);
        assert_eq!(ResponsePayload::decode(&payload).unwrap(), ResponsePayload::Empty);
    }

    #[test]
    fn test_request_payload_decodes() {
        let request = Request::SetTrackerExposure {
            tracker_id: 1,
            exposure: 32.0,
        };
        assert_eq!(Request::from_payload(&request.to_payload()).unwrap(), request);
        assert!(Request::from_payload(&OpaquePayload::empty(0xEE)).is_err());
    }

    #[test]
    fn test_frame_buffer_handles_split_frames() {
        let a = Frame::Event(OpaquePayload::empty(EVENT_CONTROLLER_LIST_UPDATED)).encode();
        let b = Frame::TrackerData(TrackerDataFrame {
            tracker_id: 1,
            sequence_num: 9,
            is_connected: true,
        })
        .encode();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut fb = FrameBuffer::new(1024);
        fb.extend(&stream[..3]);
        assert!(fb.next_frame().unwrap().is_none());
        fb.extend(&stream[3..a.len() + 2]);
        assert_eq!(
            fb.next_frame().unwrap(),
            Some(Frame::Event(OpaquePayload::empty(EVENT_CONTROLLER_LIST_UPDATED)))
        );
        assert!(fb.next_frame().unwrap().is_none());
        fb.extend(&stream[a.len() + 2..]);
        assert!(matches!(fb.next_frame().unwrap(), Some(Frame::TrackerData(_))));
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_frame() {
        let mut fb = FrameBuffer::new(16);
        fb.extend(&100u32.to_le_bytes());
        assert!(fb.next_frame().is_err());
    }
}
