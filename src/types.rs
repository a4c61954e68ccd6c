use std::fmt;

/// Maximum number of controllers the service reports at once.
pub const MAX_CONTROLLER_COUNT: usize = 5;
/// Maximum number of trackers the service reports at once.
pub const MAX_TRACKER_COUNT: usize = 4;

/// Handle of a request sent to the service.
///
/// Identifiers are allocated by the client, strictly increasing and never
/// reused for the lifetime of the process.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub i32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result code carried by responses and returned by the C API.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Error = -1,
    Success = 0,
    Timeout = 1,
    RequestSent = 2,
    Canceled = 3,
}

impl ResultCode {
    pub fn from_wire(value: i8) -> Option<ResultCode> {
        match value {
            -1 => Some(ResultCode::Error),
            0 => Some(ResultCode::Success),
            1 => Some(ResultCode::Timeout),
            2 => Some(ResultCode::RequestSent),
            3 => Some(ResultCode::Canceled),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i8 {
        self as i32 as i8
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Bluetooth = 0,
    Usb = 1,
}

/// Two-bit button state.
///
/// Bit 0 is the current level (down), bit 1 is the level of the previous
/// frame. `Pressed` and `Released` therefore only last a single frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonState {
    #[default]
    Up = 0b00,
    Pressed = 0b01,
    Released = 0b10,
    Down = 0b11,
}

impl ButtonState {
    pub fn from_bits(bits: u8) -> ButtonState {
        match bits & 0b11 {
            0b00 => ButtonState::Up,
            0b01 => ButtonState::Pressed,
            0b10 => ButtonState::Released,
            _ => ButtonState::Down,
        }
    }

    /// Advance the state by one frame given the new button level.
    pub fn next(self, is_down: bool) -> ButtonState {
        let previous = (self as u8 & 0b01) << 1;
        ButtonState::from_bits(previous | is_down as u8)
    }

    pub fn is_down(self) -> bool {
        self as u8 & 0b01 != 0
    }

    /// True on the frame the level changed.
    pub fn is_edge(self) -> bool {
        matches!(self, ButtonState::Pressed | ButtonState::Released)
    }
}

/// Tracking bulb color palette.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingColorType {
    #[default]
    Magenta = 0,
    Cyan = 1,
    Yellow = 2,
    Red = 3,
    Green = 4,
    Blue = 5,
}

impl TrackingColorType {
    pub fn from_wire(value: u8) -> Option<TrackingColorType> {
        match value {
            0 => Some(TrackingColorType::Magenta),
            1 => Some(TrackingColorType::Cyan),
            2 => Some(TrackingColorType::Yellow),
            3 => Some(TrackingColorType::Red),
            4 => Some(TrackingColorType::Green),
            5 => Some(TrackingColorType::Blue),
            _ => None,
        }
    }

    /// Bulb color as [r, g, b].
    pub fn rgb(self) -> [u8; 3] {
        match self {
            TrackingColorType::Magenta => [0xFF, 0x00, 0xFF],
            TrackingColorType::Cyan => [0x00, 0xFF, 0xFF],
            TrackingColorType::Yellow => [0xFF, 0xFF, 0x00],
            TrackingColorType::Red => [0xFF, 0x00, 0x00],
            TrackingColorType::Green => [0x00, 0xFF, 0x00],
            TrackingColorType::Blue => [0x00, 0x00, 0xFF],
        }
    }
}

bitflags::bitflags! {
    /// Optional segments included in a controller data stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct DataStreamFlags: u32 {
        const INCLUDE_POSITION    = 1 << 0;
        const INCLUDE_PHYSICS     = 1 << 1;
        const INCLUDE_RAW_SENSOR  = 1 << 2;
        const INCLUDE_RAW_TRACKER = 1 << 3;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerType {
    #[default]
    None = -1,
    PsMove = 0,
    PsNavi = 1,
}

impl ControllerType {
    pub fn from_wire(value: i8) -> ControllerType {
        match value {
            0 => ControllerType::PsMove,
            1 => ControllerType::PsNavi,
            _ => ControllerType::None,
        }
    }

    pub fn to_wire(self) -> i8 {
        self as i8
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerType {
    #[default]
    Ps3Eye = 0,
}

impl TrackerType {
    /// PS3Eye is the only camera the service reports.
    pub fn from_wire(_value: u8) -> TrackerType {
        TrackerType::Ps3Eye
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerDriver {
    #[default]
    Libusb = 0,
    ClEye = 1,
    ClEyeMulticam = 2,
    GenericWebcam = 3,
}

impl TrackerDriver {
    pub fn from_wire(value: u8) -> TrackerDriver {
        match value {
            1 => TrackerDriver::ClEye,
            2 => TrackerDriver::ClEyeMulticam,
            3 => TrackerDriver::GenericWebcam,
            _ => TrackerDriver::Libusb,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2f {
    pub x: f32,
    pub y: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vector3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Quaternion rotation [x, y, z, w].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quatf {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quatf {
    fn default() -> Self {
        Quatf {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// Position (cm) and orientation together.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Posef {
    pub position: Vector3f,
    pub orientation: Quatf,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicsData {
    pub linear_velocity: Vector3f,
    pub linear_acceleration: Vector3f,
    pub angular_velocity: Vector3f,
    pub angular_acceleration: Vector3f,
    pub time_in_seconds: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawSensorData {
    pub magnetometer: Vector3i,
    pub accelerometer: Vector3f,
    pub gyroscope: Vector3f,
    pub time_in_seconds: f64,
}

/// Shape of the tracking bulb projected onto a tracker's image plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TrackingProjection {
    #[default]
    Invalid,
    Ellipse {
        center: Vector2f,
        half_x_extent: f32,
        half_y_extent: f32,
        angle: f32,
    },
    Quad {
        corners: [Vector2f; 4],
    },
}

/// One tracker's view of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackerSample {
    pub tracker_id: i32,
    pub screen_location: Vector2f,
    pub relative_position: Vector3f,
    pub projection: TrackingProjection,
}

/// Per-tracker observations of a controller, bounded by [`MAX_TRACKER_COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawTrackerData {
    samples: [TrackerSample; MAX_TRACKER_COUNT],
    len: usize,
}

impl RawTrackerData {
    /// Append an observation. Returns false once the bound is reached.
    pub fn push(&mut self, sample: TrackerSample) -> bool {
        if self.len >= MAX_TRACKER_COUNT {
            return false;
        }
        self.samples[self.len] = sample;
        self.len += 1;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn valid_tracker_locations(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> Option<&TrackerSample> {
        self.samples[..self.len].get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackerSample> {
        self.samples[..self.len].iter()
    }

    /// Observation from a specific tracker, if any.
    pub fn for_tracker(&self, tracker_id: i32) -> Option<&TrackerSample> {
        self.iter().find(|s| s.tracker_id == tracker_id)
    }
}
