//! Local mirror of a controller's streamed state.

use crate::protocol::{
    ControllerDataBody, ControllerDataFrame, ControllerListEntry, PsMoveDataFrame,
    PsNaviDataFrame, Request,
};
use crate::types::*;
use std::time::Instant;

/// PSMove buttons, in the bit order of the data frame's button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsMoveButton {
    Triangle = 0,
    Circle = 1,
    Cross = 2,
    Square = 3,
    Select = 4,
    Start = 5,
    Ps = 6,
    Move = 7,
    Trigger = 8,
}

pub const PSMOVE_BUTTON_COUNT: usize = 9;

impl PsMoveButton {
    pub const ALL: [PsMoveButton; PSMOVE_BUTTON_COUNT] = [
        PsMoveButton::Triangle,
        PsMoveButton::Circle,
        PsMoveButton::Cross,
        PsMoveButton::Square,
        PsMoveButton::Select,
        PsMoveButton::Start,
        PsMoveButton::Ps,
        PsMoveButton::Move,
        PsMoveButton::Trigger,
    ];
}

/// PSNavi buttons, in the bit order of the data frame's button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsNaviButton {
    L1 = 0,
    L2 = 1,
    L3 = 2,
    Circle = 3,
    Cross = 4,
    Ps = 5,
    Trigger = 6,
    DPadUp = 7,
    DPadRight = 8,
    DPadDown = 9,
    DPadLeft = 10,
}

pub const PSNAVI_BUTTON_COUNT: usize = 11;

fn advance_buttons<const N: usize>(buttons: &mut [ButtonState; N], mask: u32) {
    for (bit, state) in buttons.iter_mut().enumerate() {
        *state = state.next(mask & (1 << bit) != 0);
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PsMoveState {
    pub has_valid_hardware_calibration: bool,
    pub is_tracking_enabled: bool,
    pub is_currently_tracking: bool,
    /// Output state changed locally and not yet pushed to the service.
    pub has_unpublished_state: bool,
    pub tracking_color: TrackingColorType,
    pub pose: Posef,
    pub physics: PhysicsData,
    pub raw_sensor: RawSensorData,
    pub raw_tracker: RawTrackerData,
    buttons: [ButtonState; PSMOVE_BUTTON_COUNT],
    pub trigger_value: u8,
    rumble: u8,
    led: [u8; 3],
}

impl PsMoveState {
    pub fn button(&self, button: PsMoveButton) -> ButtonState {
        self.buttons[button as usize]
    }

    pub fn rumble(&self) -> u8 {
        self.rumble
    }

    /// LED override as [r, g, b].
    pub fn led(&self) -> [u8; 3] {
        self.led
    }

    pub fn set_rumble(&mut self, rumble: u8) {
        if self.rumble != rumble {
            self.rumble = rumble;
            self.has_unpublished_state = true;
        }
    }

    pub fn set_led(&mut self, rgb: [u8; 3]) {
        if self.led != rgb {
            self.led = rgb;
            self.has_unpublished_state = true;
        }
    }

    fn apply(&mut self, frame: &PsMoveDataFrame, flags: DataStreamFlags) {
        self.has_valid_hardware_calibration = frame.has_valid_hardware_calibration;
        self.is_tracking_enabled = frame.is_tracking_enabled;
        self.is_currently_tracking = frame.is_currently_tracking;
        self.tracking_color = frame.tracking_color;

        self.pose.orientation = frame.pose.orientation;
        if flags.contains(DataStreamFlags::INCLUDE_POSITION)
            && frame.segments.contains(DataStreamFlags::INCLUDE_POSITION)
        {
            self.pose.position = frame.pose.position;
        }

        // Optional segments are only taken when the stream asked for them.
        if flags.contains(DataStreamFlags::INCLUDE_PHYSICS) {
            if let Some(physics) = &frame.physics {
                self.physics = *physics;
            }
        }
        if flags.contains(DataStreamFlags::INCLUDE_RAW_SENSOR) {
            if let Some(raw_sensor) = &frame.raw_sensor {
                self.raw_sensor = *raw_sensor;
            }
        }
        if flags.contains(DataStreamFlags::INCLUDE_RAW_TRACKER) {
            if let Some(raw_tracker) = &frame.raw_tracker {
                self.raw_tracker = *raw_tracker;
            }
        }

        advance_buttons(&mut self.buttons, frame.buttons);
        self.trigger_value = frame.trigger;
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PsNaviState {
    buttons: [ButtonState; PSNAVI_BUTTON_COUNT],
    pub trigger_value: u8,
    pub stick_x_axis: u8,
    pub stick_y_axis: u8,
}

impl PsNaviState {
    pub fn button(&self, button: PsNaviButton) -> ButtonState {
        self.buttons[button as usize]
    }

    fn apply(&mut self, frame: &PsNaviDataFrame) {
        advance_buttons(&mut self.buttons, frame.buttons);
        self.trigger_value = frame.trigger;
        self.stick_x_axis = frame.stick_x;
        self.stick_y_axis = frame.stick_y;
    }
}

/// Device-specific state; the variant is the controller type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ControllerState {
    #[default]
    None,
    PsMove(PsMoveState),
    PsNavi(PsNaviState),
}

impl ControllerState {
    fn for_type(controller_type: ControllerType) -> ControllerState {
        match controller_type {
            ControllerType::None => ControllerState::None,
            ControllerType::PsMove => ControllerState::PsMove(PsMoveState::default()),
            ControllerType::PsNavi => ControllerState::PsNavi(PsNaviState::default()),
        }
    }

    pub fn controller_type(&self) -> ControllerType {
        match self {
            ControllerState::None => ControllerType::None,
            ControllerState::PsMove(_) => ControllerType::PsMove,
            ControllerState::PsNavi(_) => ControllerType::PsNavi,
        }
    }
}

/// Whether a registered listener is receiving data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    #[default]
    Idle,
    Streaming(DataStreamFlags),
}

/// Arrival bookkeeping shared by controller and tracker mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct DataFrameTiming {
    pub last_received: Option<Instant>,
    pub average_fps: f32,
}

impl DataFrameTiming {
    /// Exponential moving average of the inter-arrival rate, seeded by the
    /// first interval.
    pub fn record(&mut self, received_at: Instant) {
        if let Some(last) = self.last_received {
            let dt = received_at.saturating_duration_since(last).as_secs_f32();
            if dt > 0.0 {
                let fps = 1.0 / dt;
                self.average_fps = if self.average_fps > 0.0 {
                    0.9 * self.average_fps + 0.1 * fps
                } else {
                    fps
                };
            }
        }
        self.last_received = Some(received_at);
    }
}

/// Cached controller state, refreshed by `pump` as data frames arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct Controller {
    controller_id: i32,
    state: ControllerState,
    pub device_path: String,
    pub device_serial: String,
    is_valid: bool,
    is_connected: bool,
    input_sequence_num: i32,
    output_sequence_num: i32,
    last_frame_sequence: Option<i32>,
    timing: DataFrameTiming,
    listener: ListenerState,
}

impl Controller {
    pub(crate) fn new(controller_id: i32, entry: Option<&ControllerListEntry>) -> Self {
        let mut controller = Controller {
            controller_id,
            state: ControllerState::None,
            device_path: String::new(),
            device_serial: String::new(),
            is_valid: false,
            is_connected: false,
            input_sequence_num: 0,
            output_sequence_num: 0,
            last_frame_sequence: None,
            timing: DataFrameTiming::default(),
            listener: ListenerState::Idle,
        };
        if let Some(entry) = entry {
            controller.apply_list_entry(entry);
        }
        controller
    }

    pub fn controller_id(&self) -> i32 {
        self.controller_id
    }

    pub fn controller_type(&self) -> ControllerType {
        self.state.controller_type()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn psmove(&self) -> Option<&PsMoveState> {
        match &self.state {
            ControllerState::PsMove(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable PSMove state, for setting rumble and LED output.
    pub fn psmove_mut(&mut self) -> Option<&mut PsMoveState> {
        match &mut self.state {
            ControllerState::PsMove(s) => Some(s),
            _ => None,
        }
    }

    pub fn psnavi(&self) -> Option<&PsNaviState> {
        match &self.state {
            ControllerState::PsNavi(s) => Some(s),
            _ => None,
        }
    }

    /// True once at least one data frame has been applied.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Number of data frames applied to this mirror.
    pub fn input_sequence_num(&self) -> i32 {
        self.input_sequence_num
    }

    pub fn output_sequence_num(&self) -> i32 {
        self.output_sequence_num
    }

    pub fn data_frame_last_received(&self) -> Option<Instant> {
        self.timing.last_received
    }

    pub fn data_frame_average_fps(&self) -> f32 {
        self.timing.average_fps
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.listener, ListenerState::Streaming(_))
    }

    pub(crate) fn apply_list_entry(&mut self, entry: &ControllerListEntry) {
        self.device_path = entry.device_path.clone();
        self.device_serial = entry.device_serial.clone();
        if self.state.controller_type() != entry.controller_type {
            self.state = ControllerState::for_type(entry.controller_type);
        }
    }

    pub(crate) fn set_listener(&mut self, listener: ListenerState) {
        log::debug!(
            "Controller {} listener {:?} -> {:?}",
            self.controller_id,
            self.listener,
            listener
        );
        // A new stream may restart its sequence numbers.
        if matches!(listener, ListenerState::Streaming(_)) {
            self.last_frame_sequence = None;
        }
        self.listener = listener;
    }

    /// Apply a streamed frame. Returns false when it was ignored (not
    /// streaming, or older than the last applied frame).
    pub(crate) fn apply_data_frame(
        &mut self,
        frame: &ControllerDataFrame,
        received_at: Instant,
    ) -> bool {
        let ListenerState::Streaming(flags) = self.listener else {
            log::trace!(
                "Controller {} not streaming, ignoring frame {}",
                self.controller_id,
                frame.sequence_num
            );
            return false;
        };
        if let Some(last) = self.last_frame_sequence {
            if frame.sequence_num <= last {
                log::trace!(
                    "Controller {} stale frame {} <= {}",
                    self.controller_id,
                    frame.sequence_num,
                    last
                );
                return false;
            }
        }

        let frame_type = frame.body.controller_type();
        if self.state.controller_type() != frame_type {
            self.state = ControllerState::for_type(frame_type);
        }
        match (&mut self.state, &frame.body) {
            (ControllerState::PsMove(state), ControllerDataBody::PsMove(body)) => {
                state.apply(body, flags)
            }
            (ControllerState::PsNavi(state), ControllerDataBody::PsNavi(body)) => state.apply(body),
            _ => {}
        }

        self.is_valid = true;
        self.is_connected = frame.is_connected;
        self.last_frame_sequence = Some(frame.sequence_num);
        self.input_sequence_num += 1;
        self.timing.record(received_at);
        true
    }

    /// Build the output request if rumble or LED changed since the last push.
    pub(crate) fn take_output_request(&mut self) -> Option<Request> {
        let controller_id = self.controller_id;
        let ControllerState::PsMove(state) = &mut self.state else {
            return None;
        };
        if !state.has_unpublished_state {
            return None;
        }
        state.has_unpublished_state = false;
        self.output_sequence_num += 1;
        Some(Request::SetControllerOutput {
            controller_id,
            sequence_num: self.output_sequence_num,
            rumble: state.rumble,
            led: state.led,
        })
    }

    /// Undo `take_output_request` after the request could not be sent.
    pub(crate) fn restore_output_request(&mut self) {
        if let ControllerState::PsMove(state) = &mut self.state {
            state.has_unpublished_state = true;
            self.output_sequence_num -= 1;
        }
    }

    /// Connection to the service is gone; keep the registration, stop streaming.
    pub(crate) fn mark_disconnected(&mut self) {
        self.is_connected = false;
        self.listener = ListenerState::Idle;
    }
}
