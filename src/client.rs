//! Connection manager: one session with PSMoveService and the state mirrored
//! from it.
//!
//! Nothing happens in the background on the client side. Inbound frames sit
//! in the transport until [`Client::pump`] drains them; that is when
//! responses are routed, callbacks run and device mirrors change.

use crate::callback::Delivery;
use crate::config::ClientConfig;
use crate::controller::{Controller, ListenerState};
use crate::message::{EventMessage, EventType, Message, MessageQueue, ResponseMessage};
use crate::protocol::{
    ControllerList, Frame, HmdTrackingSpace, OpaquePayload, Request, ResponsePayload,
    TrackerInfo, TrackerList, TrackerSettings,
};
use crate::request::RequestDispatcher;
use crate::tracker::{default_accessor_factory, Tracker, VideoAccessorFactory};
use crate::transport::{InboundFrame, TcpTransport, Transport, TransportEvent};
use crate::types::{
    DataStreamFlags, RequestId, ResultCode, TrackingColorType, MAX_CONTROLLER_COUNT,
    MAX_TRACKER_COUNT,
};
use crate::{ClientError, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `initialize` has not succeeded yet.
    Uninitialized,
    Connected,
    /// The service went away. Mirrors are kept but no longer update.
    Disconnected,
    /// `shutdown` ran. The client cannot be initialized again.
    ShutDown,
}

/// A client session with PSMoveService.
pub struct Client {
    config: ClientConfig,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    dispatcher: RequestDispatcher,
    queue: MessageQueue,
    /// Resolutions of `Delivery::Wait` requests, picked up by blocking calls.
    completed: HashMap<RequestId, ResponseMessage>,
    controllers: BTreeMap<i32, Controller>,
    trackers: BTreeMap<i32, Tracker>,
    controller_list: Option<ControllerList>,
    tracker_list: Option<TrackerList>,
    accessor_factory: VideoAccessorFactory,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            state: SessionState::Uninitialized,
            transport: None,
            dispatcher: RequestDispatcher::new(),
            queue: MessageQueue::new(),
            completed: HashMap::new(),
            controllers: BTreeMap::new(),
            trackers: BTreeMap::new(),
            controller_list: None,
            tracker_list: None,
            accessor_factory: default_accessor_factory(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace how tracker video segments are opened.
    pub fn set_video_accessor_factory(&mut self, factory: VideoAccessorFactory) {
        self.accessor_factory = factory;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
            && self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    // ---- Session lifecycle ----

    /// Connect over TCP.
    ///
    /// Queues `ConnectedToService` on success and `FailedToConnectToService`
    /// when the endpoint cannot be reached.
    pub fn initialize(&mut self, host: &str, port: &str) -> Result<()> {
        self.check_can_initialize()?;
        match TcpTransport::connect(host, port, &self.config) {
            Ok(transport) => {
                self.config.host = host.to_string();
                self.config.port = port.to_string();
                log::info!("Connected to PSMoveService at {}:{}", host, port);
                self.attach(Box::new(transport));
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to connect to PSMoveService at {}:{}: {}", host, port, e);
                self.push_event(EventType::FailedToConnectToService);
                Err(e)
            }
        }
    }

    /// Connect to the endpoint in this client's config.
    pub fn initialize_from_config(&mut self) -> Result<()> {
        let host = self.config.host.clone();
        let port = self.config.port.clone();
        self.initialize(&host, &port)
    }

    /// Start a session over an already established transport.
    pub fn initialize_with_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.check_can_initialize()?;
        if !transport.is_connected() {
            self.push_event(EventType::FailedToConnectToService);
            return Err(ClientError::Connection("transport is not connected".into()));
        }
        self.attach(transport);
        Ok(())
    }

    fn check_can_initialize(&self) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => Ok(()),
            SessionState::Connected | SessionState::Disconnected => {
                Err(ClientError::Connection("client already initialized".into()))
            }
            SessionState::ShutDown => {
                Err(ClientError::Connection("client has been shut down".into()))
            }
        }
    }

    fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.state = SessionState::Connected;
        self.push_event(EventType::ConnectedToService);
    }

    /// End the session. Every pending request resolves as `Canceled`,
    /// device mirrors are dropped, and `DisconnectedFromService` is queued if
    /// the session was still live. Calling it again does nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == SessionState::ShutDown {
            return Ok(());
        }
        let was_connected = self.state == SessionState::Connected;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if was_connected {
            self.push_event(EventType::DisconnectedFromService);
        }
        self.cancel_all_pending();

        self.controllers.clear();
        self.trackers.clear();
        self.completed.clear();
        self.state = SessionState::ShutDown;
        log::info!("Client shut down");
        Ok(())
    }

    // ---- Pump ----

    /// Drain everything the transport has received so far: queue events and
    /// responses, run callbacks, and apply data frames to the mirrors.
    pub fn pump(&mut self) -> Result<()> {
        match self.state {
            SessionState::Uninitialized | SessionState::ShutDown => {
                return Err(ClientError::NotConnected)
            }
            SessionState::Disconnected => return Ok(()),
            SessionState::Connected => {}
        }

        let mut inbound = Vec::new();
        if let Some(transport) = self.transport.as_mut() {
            while let Some(event) = transport.try_recv() {
                inbound.push(event);
            }
        }

        for event in inbound {
            match event {
                TransportEvent::Frame(frame) => self.handle_frame(frame),
                TransportEvent::Closed(reason) => self.handle_disconnect(&reason),
            }
        }
        Ok(())
    }

    /// Same as [`pump`](Self::pump).
    pub fn update(&mut self) -> Result<()> {
        self.pump()
    }

    fn handle_frame(&mut self, inbound: InboundFrame) {
        let InboundFrame { frame, received_at } = inbound;
        match frame {
            Frame::Response {
                request_id,
                result,
                payload,
            } => self.handle_response(request_id, result, payload),
            Frame::Event(payload) => {
                let event_type = EventType::from_service_tag(payload.tag);
                log::debug!("Service event {:?} (tag {})", event_type, payload.tag);
                self.queue.push(Message::Event(EventMessage {
                    event_type,
                    event_data: payload,
                }));
                self.refresh_list(event_type);
            }
            Frame::ControllerData(frame) => match self.controllers.get_mut(&frame.controller_id) {
                Some(controller) => {
                    controller.apply_data_frame(&frame, received_at);
                }
                None => log::trace!(
                    "Data frame for unregistered controller {}",
                    frame.controller_id
                ),
            },
            Frame::TrackerData(frame) => match self.trackers.get_mut(&frame.tracker_id) {
                Some(tracker) => {
                    tracker.apply_data_frame(&frame, received_at);
                }
                None => log::trace!("Data frame for unregistered tracker {}", frame.tracker_id),
            },
            Frame::Request { request_id, .. } => {
                log::warn!("Ignoring request frame {} sent by the service", request_id)
            }
        }
    }

    /// Drop the cached list a list-changed event invalidates and fetch it
    /// again; `apply_response` pushes the new list into the mirrors.
    fn refresh_list(&mut self, event_type: EventType) {
        let request = match event_type {
            EventType::ControllerListUpdated => {
                self.controller_list = None;
                Request::GetControllerList
            }
            EventType::TrackerListUpdated => {
                self.tracker_list = None;
                Request::GetTrackerList
            }
            _ => return,
        };
        if let Err(e) = self.send_with_delivery(request.to_payload(), Delivery::Eat) {
            log::warn!("Failed to refresh after {:?}: {}", event_type, e);
        }
    }

    fn handle_response(&mut self, request_id: RequestId, result: ResultCode, body: OpaquePayload) {
        let Some(pending) = self.dispatcher.resolve(request_id) else {
            log::debug!("Dropping response for unknown request {}", request_id);
            return;
        };
        log::debug!(
            "Request {} resolved {:?} after {:?}",
            request_id,
            result,
            pending.created_at.elapsed()
        );

        let payload = ResponsePayload::decode(&body).unwrap_or_else(|e| {
            log::warn!("Undecodable response body for request {}: {}", request_id, e);
            ResponsePayload::Empty
        });
        let response = ResponseMessage {
            request_id,
            result_code: result,
            request: pending.request,
            response: body,
            payload,
        };
        self.apply_response(&response);

        if let Some(held) = pending.delivery.deliver(response, &self.queue) {
            self.completed.insert(request_id, held);
        }
    }

    /// Side effects of a response on the cached lists and the mirrors.
    fn apply_response(&mut self, response: &ResponseMessage) {
        if response.is_success() {
            match &response.payload {
                ResponsePayload::ControllerList(list) => {
                    for (id, controller) in self.controllers.iter_mut() {
                        if let Some(entry) = list.get(*id) {
                            controller.apply_list_entry(entry);
                        }
                    }
                    self.controller_list = Some(list.clone());
                }
                ResponsePayload::TrackerList(list) => {
                    for (id, tracker) in self.trackers.iter_mut() {
                        if let Some(info) = list.get(*id) {
                            tracker.set_info(info.clone());
                        }
                    }
                    self.tracker_list = Some(list.clone());
                }
                _ => {}
            }
            return;
        }

        // A refused stream start undoes the optimistic state set at send time.
        match Request::from_payload(&response.request) {
            Ok(Request::StartControllerDataStream {
                controller_id,
                flags,
            }) => {
                if let Some(controller) = self.controllers.get_mut(&controller_id) {
                    if controller.listener_state() == ListenerState::Streaming(flags) {
                        controller.set_listener(ListenerState::Idle);
                    }
                }
            }
            Ok(Request::StartTrackerDataStream { tracker_id }) => {
                if let Some(tracker) = self.trackers.get_mut(&tracker_id) {
                    tracker.release_stream();
                }
            }
            _ => {}
        }
    }

    fn handle_disconnect(&mut self, reason: &str) {
        if self.state != SessionState::Connected {
            return;
        }
        log::warn!("Disconnected from PSMoveService: {}", reason);
        self.state = SessionState::Disconnected;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.push_event(EventType::DisconnectedFromService);
        self.cancel_all_pending();

        for controller in self.controllers.values_mut() {
            controller.mark_disconnected();
        }
        for tracker in self.trackers.values_mut() {
            tracker.mark_disconnected();
        }
    }

    fn cancel_all_pending(&mut self) {
        for (request_id, pending) in self.dispatcher.drain() {
            log::debug!("Force-canceling request {}", request_id);
            let response = ResponseMessage::canceled(request_id, pending.request);
            if let Some(held) = pending.delivery.deliver(response, &self.queue) {
                self.completed.insert(request_id, held);
            }
        }
    }

    fn push_event(&self, event_type: EventType) {
        self.queue.push(Message::Event(EventMessage::client(event_type)));
    }

    // ---- Messages and request routing ----

    /// Oldest message not yet taken, events and responses in arrival order.
    pub fn poll_next_message(&mut self) -> Option<Message> {
        self.queue.pop()
    }

    /// Number of messages waiting to be polled.
    pub fn pending_message_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_request_pending(&self, request_id: RequestId) -> bool {
        self.dispatcher.is_pending(request_id)
    }

    /// Send a typed request; its response is queued for polling.
    pub fn send_request(&mut self, request: Request) -> Result<RequestId> {
        self.send_with_delivery(request.to_payload(), Delivery::Poll)
    }

    /// Send a request body this client does not model.
    pub fn send_opaque_request(&mut self, request: OpaquePayload) -> Result<RequestId> {
        self.send_with_delivery(request, Delivery::Poll)
    }

    fn send_with_delivery(&mut self, request: OpaquePayload, delivery: Delivery) -> Result<RequestId> {
        if self.state != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(ClientError::NotConnected)?;
        self.dispatcher.send(transport, request, delivery)
    }

    /// Send and wait for the response, pumping meanwhile.
    ///
    /// Only `Success` comes back as `Ok`. Running out of time cancels the
    /// request, so a late response is dropped.
    pub fn send_blocking(&mut self, request: OpaquePayload, timeout: Duration) -> Result<ResponseMessage> {
        let request_id = self.send_with_delivery(request, Delivery::Wait)?;
        self.wait_for(request_id, timeout)
    }

    fn request_blocking(&mut self, request: Request) -> Result<ResponseMessage> {
        let timeout = self.config.request_timeout;
        self.send_blocking(request.to_payload(), timeout)
    }

    fn wait_for(&mut self, request_id: RequestId, timeout: Duration) -> Result<ResponseMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            // A disconnect resolves the request as canceled, so the
            // state check below still finds it.
            if let Err(e) = self.pump() {
                self.dispatcher.cancel(request_id);
                return Err(e);
            }
            if let Some(response) = self.completed.remove(&request_id) {
                return match response.result_code {
                    ResultCode::Success => Ok(response),
                    ResultCode::Canceled => Err(ClientError::Canceled),
                    ResultCode::Timeout => Err(ClientError::Timeout),
                    ResultCode::Error | ResultCode::RequestSent => {
                        Err(ClientError::ServiceError(request_id))
                    }
                };
            }
            if Instant::now() >= deadline {
                self.dispatcher.cancel(request_id);
                log::warn!("Request {} timed out after {:?}", request_id, timeout);
                return Err(ClientError::Timeout);
            }
            std::thread::sleep(self.config.pump_interval);
        }
    }

    /// Route the response to `request_id` to `callback` instead of the queue.
    /// The callback runs once, from inside `pump` or `shutdown`.
    pub fn register_callback<F>(&mut self, request_id: RequestId, callback: F) -> Result<()>
    where
        F: FnMut(&ResponseMessage) + Send + 'static,
    {
        self.dispatcher
            .set_delivery(request_id, Delivery::Callback(Box::new(callback)))
    }

    /// Forget a request. Its response, if one still arrives, is dropped and
    /// no callback runs. Unknown ids are ignored.
    pub fn cancel_callback(&mut self, request_id: RequestId) -> Result<()> {
        if !self.dispatcher.cancel(request_id) {
            log::debug!("Cancel of request {} which is not pending", request_id);
        }
        Ok(())
    }

    /// Same as [`cancel_callback`](Self::cancel_callback).
    pub fn cancel(&mut self, request_id: RequestId) -> Result<()> {
        self.cancel_callback(request_id)
    }

    /// Let the response to `request_id` be discarded when it arrives.
    pub fn eat_response(&mut self, request_id: RequestId) -> Result<()> {
        self.dispatcher.set_delivery(request_id, Delivery::Eat)
    }

    // ---- Controllers ----

    pub fn cached_controller_list(&self) -> Option<&ControllerList> {
        self.controller_list.as_ref()
    }

    pub fn get_controller_list_async(&mut self) -> Result<RequestId> {
        self.send_request(Request::GetControllerList)
    }

    pub fn get_controller_list(&mut self) -> Result<ControllerList> {
        match self.request_blocking(Request::GetControllerList)?.payload {
            ResponsePayload::ControllerList(list) => Ok(list),
            other => Err(unexpected_payload("controller list", &other)),
        }
    }

    /// Start mirroring a controller. Its static fields are taken from the
    /// cached controller list when one has been fetched.
    pub fn register_as_controller_listener(&mut self, controller_id: i32) -> Result<()> {
        if !(0..MAX_CONTROLLER_COUNT as i32).contains(&controller_id) {
            return Err(ClientError::unknown_controller(controller_id));
        }
        if self.controllers.contains_key(&controller_id) {
            return Ok(());
        }
        let entry = self
            .controller_list
            .as_ref()
            .and_then(|list| list.get(controller_id));
        self.controllers
            .insert(controller_id, Controller::new(controller_id, entry));
        log::debug!("Registered controller listener {}", controller_id);
        Ok(())
    }

    /// Drop a controller mirror. A stream still running is stopped with a
    /// fire-and-forget request; requests already in flight are left alone.
    pub fn deregister_as_controller_listener(&mut self, controller_id: i32) -> Result<()> {
        let controller = self
            .controllers
            .remove(&controller_id)
            .ok_or(ClientError::unknown_controller(controller_id))?;
        if controller.is_streaming() && self.is_connected() {
            let stop = Request::StopControllerDataStream { controller_id };
            if let Err(e) = self.send_with_delivery(stop.to_payload(), Delivery::Eat) {
                log::warn!("Failed to stop stream of controller {}: {}", controller_id, e);
            }
        }
        log::debug!("Deregistered controller listener {}", controller_id);
        Ok(())
    }

    pub fn controller(&self, controller_id: i32) -> Option<&Controller> {
        self.controllers.get(&controller_id)
    }

    pub fn controller_mut(&mut self, controller_id: i32) -> Option<&mut Controller> {
        self.controllers.get_mut(&controller_id)
    }

    fn registered_controller(&self, controller_id: i32) -> Result<()> {
        if self.controllers.contains_key(&controller_id) {
            Ok(())
        } else {
            Err(ClientError::unknown_controller(controller_id))
        }
    }

    fn set_controller_listener(&mut self, controller_id: i32, listener: ListenerState) {
        if let Some(controller) = self.controllers.get_mut(&controller_id) {
            controller.set_listener(listener);
        }
    }

    /// Ask for data frames. The mirror counts as streaming from now on and
    /// falls back to idle if the service refuses.
    pub fn start_controller_data_stream_async(
        &mut self,
        controller_id: i32,
        flags: DataStreamFlags,
    ) -> Result<RequestId> {
        self.registered_controller(controller_id)?;
        let request_id = self.send_request(Request::StartControllerDataStream {
            controller_id,
            flags,
        })?;
        self.set_controller_listener(controller_id, ListenerState::Streaming(flags));
        Ok(request_id)
    }

    pub fn start_controller_data_stream(
        &mut self,
        controller_id: i32,
        flags: DataStreamFlags,
    ) -> Result<()> {
        self.registered_controller(controller_id)?;
        let request = Request::StartControllerDataStream {
            controller_id,
            flags,
        };
        let request_id = self.send_with_delivery(request.to_payload(), Delivery::Wait)?;
        self.set_controller_listener(controller_id, ListenerState::Streaming(flags));

        let timeout = self.config.request_timeout;
        match self.wait_for(request_id, timeout) {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Some(controller) = self.controllers.get_mut(&controller_id) {
                    if controller.listener_state() == ListenerState::Streaming(flags) {
                        controller.set_listener(ListenerState::Idle);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn stop_controller_data_stream_async(&mut self, controller_id: i32) -> Result<RequestId> {
        self.registered_controller(controller_id)?;
        let request_id = self.send_request(Request::StopControllerDataStream { controller_id })?;
        self.set_controller_listener(controller_id, ListenerState::Idle);
        Ok(request_id)
    }

    pub fn stop_controller_data_stream(&mut self, controller_id: i32) -> Result<()> {
        self.registered_controller(controller_id)?;
        let request = Request::StopControllerDataStream { controller_id };
        let request_id = self.send_with_delivery(request.to_payload(), Delivery::Wait)?;
        self.set_controller_listener(controller_id, ListenerState::Idle);
        let timeout = self.config.request_timeout;
        self.wait_for(request_id, timeout).map(|_| ())
    }

    pub fn set_controller_led_color_async(
        &mut self,
        controller_id: i32,
        color: TrackingColorType,
    ) -> Result<RequestId> {
        self.registered_controller(controller_id)?;
        self.send_request(Request::SetLedTrackingColor {
            controller_id,
            color,
        })
    }

    pub fn set_controller_led_color(
        &mut self,
        controller_id: i32,
        color: TrackingColorType,
    ) -> Result<()> {
        self.registered_controller(controller_id)?;
        self.request_blocking(Request::SetLedTrackingColor {
            controller_id,
            color,
        })
        .map(|_| ())
    }

    pub fn reset_controller_pose_async(&mut self, controller_id: i32) -> Result<RequestId> {
        self.registered_controller(controller_id)?;
        self.send_request(Request::ResetPose { controller_id })
    }

    pub fn reset_controller_pose(&mut self, controller_id: i32) -> Result<()> {
        self.registered_controller(controller_id)?;
        self.request_blocking(Request::ResetPose { controller_id })
            .map(|_| ())
    }

    /// Push locally changed rumble and LED state. Returns `None` when there
    /// was nothing to publish. The response is discarded.
    pub fn update_controller(&mut self, controller_id: i32) -> Result<Option<RequestId>> {
        let controller = self
            .controllers
            .get_mut(&controller_id)
            .ok_or(ClientError::unknown_controller(controller_id))?;
        let Some(request) = controller.take_output_request() else {
            return Ok(None);
        };
        match self.send_with_delivery(request.to_payload(), Delivery::Eat) {
            Ok(request_id) => Ok(Some(request_id)),
            Err(e) => {
                // Keep the change around for the next attempt.
                if let Some(controller) = self.controllers.get_mut(&controller_id) {
                    controller.restore_output_request();
                }
                Err(e)
            }
        }
    }

    // ---- Trackers ----

    pub fn cached_tracker_list(&self) -> Option<&TrackerList> {
        self.tracker_list.as_ref()
    }

    pub fn get_tracker_list_async(&mut self) -> Result<RequestId> {
        self.send_request(Request::GetTrackerList)
    }

    pub fn get_tracker_list(&mut self) -> Result<TrackerList> {
        match self.request_blocking(Request::GetTrackerList)?.payload {
            ResponsePayload::TrackerList(list) => Ok(list),
            other => Err(unexpected_payload("tracker list", &other)),
        }
    }

    /// Start mirroring a tracker. Camera info comes from the cached tracker
    /// list when one has been fetched.
    pub fn register_as_tracker_listener(&mut self, tracker_id: i32) -> Result<()> {
        if !(0..MAX_TRACKER_COUNT as i32).contains(&tracker_id) {
            return Err(ClientError::unknown_tracker(tracker_id));
        }
        if self.trackers.contains_key(&tracker_id) {
            return Ok(());
        }
        let info = self
            .tracker_list
            .as_ref()
            .and_then(|list| list.get(tracker_id))
            .cloned()
            .unwrap_or_else(|| TrackerInfo {
                tracker_id,
                ..Default::default()
            });
        self.trackers.insert(tracker_id, Tracker::new(info));
        log::debug!("Registered tracker listener {}", tracker_id);
        Ok(())
    }

    pub fn deregister_as_tracker_listener(&mut self, tracker_id: i32) -> Result<()> {
        let tracker = self
            .trackers
            .remove(&tracker_id)
            .ok_or(ClientError::unknown_tracker(tracker_id))?;
        if tracker.listener_count() > 0 && self.is_connected() {
            let stop = Request::StopTrackerDataStream { tracker_id };
            if let Err(e) = self.send_with_delivery(stop.to_payload(), Delivery::Eat) {
                log::warn!("Failed to stop stream of tracker {}: {}", tracker_id, e);
            }
        }
        log::debug!("Deregistered tracker listener {}", tracker_id);
        Ok(())
    }

    pub fn tracker(&self, tracker_id: i32) -> Option<&Tracker> {
        self.trackers.get(&tracker_id)
    }

    fn registered_tracker(&self, tracker_id: i32) -> Result<()> {
        if self.trackers.contains_key(&tracker_id) {
            Ok(())
        } else {
            Err(ClientError::unknown_tracker(tracker_id))
        }
    }

    fn acquire_tracker_stream(&mut self, tracker_id: i32) {
        if let Some(tracker) = self.trackers.get_mut(&tracker_id) {
            tracker.acquire_stream(&self.accessor_factory);
        }
    }

    fn release_tracker_stream(&mut self, tracker_id: i32) {
        if let Some(tracker) = self.trackers.get_mut(&tracker_id) {
            tracker.release_stream();
        }
    }

    /// Ask for tracker frames; the first stream opens the video accessor.
    pub fn start_tracker_data_stream_async(&mut self, tracker_id: i32) -> Result<RequestId> {
        self.registered_tracker(tracker_id)?;
        let request_id = self.send_request(Request::StartTrackerDataStream { tracker_id })?;
        self.acquire_tracker_stream(tracker_id);
        Ok(request_id)
    }

    pub fn start_tracker_data_stream(&mut self, tracker_id: i32) -> Result<()> {
        self.registered_tracker(tracker_id)?;
        let request = Request::StartTrackerDataStream { tracker_id };
        let request_id = self.send_with_delivery(request.to_payload(), Delivery::Wait)?;
        self.acquire_tracker_stream(tracker_id);

        let timeout = self.config.request_timeout;
        match self.wait_for(request_id, timeout) {
            Ok(_) => Ok(()),
            Err(ClientError::ServiceError(id)) => {
                // Already released when the refusal was applied.
                Err(ClientError::ServiceError(id))
            }
            Err(e) => {
                self.release_tracker_stream(tracker_id);
                Err(e)
            }
        }
    }

    pub fn stop_tracker_data_stream_async(&mut self, tracker_id: i32) -> Result<RequestId> {
        self.registered_tracker(tracker_id)?;
        let request_id = self.send_request(Request::StopTrackerDataStream { tracker_id })?;
        self.release_tracker_stream(tracker_id);
        Ok(request_id)
    }

    pub fn stop_tracker_data_stream(&mut self, tracker_id: i32) -> Result<()> {
        self.registered_tracker(tracker_id)?;
        let request = Request::StopTrackerDataStream { tracker_id };
        let request_id = self.send_with_delivery(request.to_payload(), Delivery::Wait)?;
        self.release_tracker_stream(tracker_id);
        let timeout = self.config.request_timeout;
        self.wait_for(request_id, timeout).map(|_| ())
    }

    pub fn get_tracker_settings_async(&mut self, tracker_id: i32) -> Result<RequestId> {
        self.send_request(Request::GetTrackerSettings { tracker_id })
    }

    pub fn get_tracker_settings(&mut self, tracker_id: i32) -> Result<TrackerSettings> {
        match self
            .request_blocking(Request::GetTrackerSettings { tracker_id })?
            .payload
        {
            ResponsePayload::TrackerSettings(settings) => Ok(settings),
            other => Err(unexpected_payload("tracker settings", &other)),
        }
    }

    pub fn set_tracker_exposure_async(&mut self, tracker_id: i32, exposure: f64) -> Result<RequestId> {
        self.send_request(Request::SetTrackerExposure {
            tracker_id,
            exposure,
        })
    }

    /// Set the exposure and return the settings the service applied.
    pub fn set_tracker_exposure(&mut self, tracker_id: i32, exposure: f64) -> Result<TrackerSettings> {
        let response = self.request_blocking(Request::SetTrackerExposure {
            tracker_id,
            exposure,
        })?;
        match response.payload {
            ResponsePayload::TrackerSettings(settings) => Ok(settings),
            ResponsePayload::Empty => Ok(TrackerSettings {
                tracker_id,
                exposure,
            }),
            other => Err(unexpected_payload("tracker settings", &other)),
        }
    }

    // ---- HMD ----

    pub fn get_hmd_tracking_space_settings_async(&mut self) -> Result<RequestId> {
        self.send_request(Request::GetHmdTrackingSpaceSettings)
    }

    pub fn get_hmd_tracking_space_settings(&mut self) -> Result<HmdTrackingSpace> {
        match self
            .request_blocking(Request::GetHmdTrackingSpaceSettings)?
            .payload
        {
            ResponsePayload::HmdTrackingSpace(space) => Ok(space),
            other => Err(unexpected_payload("HMD tracking space", &other)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

fn unexpected_payload(expected: &str, got: &ResponsePayload) -> ClientError {
    ClientError::Protocol(format!(
        "expected {} response, got {:?}",
        expected,
        got.response_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{self, LoopbackService};
    use crate::protocol::{
        ControllerDataBody, ControllerDataFrame, ControllerListEntry, PsMoveDataFrame,
        TrackerDataFrame,
    };
    use crate::types::{ControllerType, RawSensorData, Vector3i};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn connected_with(config: ClientConfig) -> (Client, LoopbackService) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (transport, service) = loopback::pair();
        let mut client = Client::with_config(config);
        client.initialize_with_transport(Box::new(transport)).unwrap();
        match client.poll_next_message() {
            Some(Message::Event(e)) => assert_eq!(e.event_type, EventType::ConnectedToService),
            other => panic!("expected connect event, got {:?}", other),
        }
        (client, service)
    }

    fn connected() -> (Client, LoopbackService) {
        connected_with(ClientConfig::default())
    }

    fn psmove_frame(controller_id: i32, seq: i32) -> ControllerDataFrame {
        ControllerDataFrame {
            controller_id,
            sequence_num: seq,
            is_connected: true,
            body: ControllerDataBody::PsMove(PsMoveDataFrame {
                raw_sensor: Some(RawSensorData {
                    accelerometer: crate::types::Vector3f {
                        x: 0.0,
                        y: 1.0,
                        z: 0.0,
                    },
                    magnetometer: Vector3i { x: 4, y: 5, z: 6 },
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn response_ids(client: &mut Client) -> Vec<(RequestId, ResultCode)> {
        std::iter::from_fn(|| client.poll_next_message())
            .filter_map(|m| m.as_response().map(|r| (r.request_id, r.result_code)))
            .collect()
    }

    #[test]
    fn test_requires_initialize() {
        let mut client = Client::new();
        assert_eq!(client.state(), SessionState::Uninitialized);
        assert!(matches!(client.pump(), Err(ClientError::NotConnected)));
        assert!(matches!(
            client.send_request(Request::GetControllerList),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_initialize_twice_fails() {
        let (mut client, _service) = connected();
        let (transport, _other) = loopback::pair();
        assert!(matches!(
            client.initialize_with_transport(Box::new(transport)),
            Err(ClientError::Connection(_))
        ));
        assert!(client.is_connected());
    }

    #[test]
    fn test_unreachable_service_queues_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let mut client = Client::new();
        assert!(client.initialize("127.0.0.1", &port).is_err());
        match client.poll_next_message() {
            Some(Message::Event(e)) => {
                assert_eq!(e.event_type, EventType::FailedToConnectToService)
            }
            other => panic!("expected failure event, got {:?}", other),
        }
        assert_eq!(client.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_messages_keep_arrival_order() {
        let (mut client, service) = connected();
        let a = client.get_controller_list_async().unwrap();
        let b = client.get_tracker_list_async().unwrap();

        service.push_event(1, vec![]);
        service.respond(b, ResultCode::Success, &ResponsePayload::TrackerList(TrackerList::default()));
        service.respond(a, ResultCode::Success, &ResponsePayload::ControllerList(ControllerList::default()));
        client.pump().unwrap();

        let first = client.poll_next_message().unwrap();
        assert_eq!(
            first.as_event().map(|e| e.event_type),
            Some(EventType::ControllerListUpdated)
        );
        assert_eq!(
            response_ids(&mut client),
            vec![(b, ResultCode::Success), (a, ResultCode::Success)]
        );
        assert!(client.cached_controller_list().is_some());
        assert!(client.cached_tracker_list().is_some());
    }

    #[test]
    fn test_canceled_request_ignores_late_response() {
        let (mut client, service) = connected();
        let id = client.get_controller_list_async().unwrap();
        client.cancel_callback(id).unwrap();
        assert!(!client.is_request_pending(id));

        service.respond(id, ResultCode::Success, &ResponsePayload::ControllerList(ControllerList::default()));
        client.pump().unwrap();
        assert!(client.poll_next_message().is_none());
        assert!(client.cached_controller_list().is_none());

        // Canceling again is harmless.
        client.cancel_callback(id).unwrap();
    }

    #[test]
    fn test_callback_replaces_polling() {
        let (mut client, service) = connected();
        let id = client.get_tracker_list_async().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client
            .register_callback(id, move |r: &ResponseMessage| {
                sink.lock().unwrap().push((r.request_id, r.result_code))
            })
            .unwrap();

        service.respond(id, ResultCode::Success, &ResponsePayload::Empty);
        client.pump().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(id, ResultCode::Success)]);
        assert!(client.poll_next_message().is_none());

        // The request is resolved; it can no longer be routed.
        assert!(matches!(
            client.register_callback(id, |_: &ResponseMessage| {}),
            Err(ClientError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_eaten_response_disappears() {
        let (mut client, service) = connected();
        assert!(matches!(
            client.reset_controller_pose_async(0),
            Err(ClientError::UnknownId { .. })
        ));

        client.register_as_controller_listener(0).unwrap();
        let id = client.reset_controller_pose_async(0).unwrap();
        client.eat_response(id).unwrap();
        service.respond(id, ResultCode::Success, &ResponsePayload::Empty);
        client.pump().unwrap();
        assert!(client.poll_next_message().is_none());
        assert!(!client.is_request_pending(id));
    }

    #[test]
    fn test_shutdown_cancels_pending_once() {
        let (mut client, _service) = connected();
        let calls = Arc::new(AtomicUsize::new(0));
        let codes = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let id = client.get_controller_list_async().unwrap();
            let calls = calls.clone();
            let codes = codes.clone();
            client
                .register_callback(id, move |r: &ResponseMessage| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    codes.lock().unwrap().push(r.result_code);
                })
                .unwrap();
        }

        client.shutdown().unwrap();
        client.shutdown().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *codes.lock().unwrap(),
            vec![ResultCode::Canceled, ResultCode::Canceled]
        );
        assert_eq!(client.state(), SessionState::ShutDown);

        let events: Vec<_> = std::iter::from_fn(|| client.poll_next_message())
            .filter_map(|m| m.as_event().map(|e| e.event_type))
            .collect();
        assert_eq!(events, vec![EventType::DisconnectedFromService]);
        assert!(matches!(
            client.initialize_from_config(),
            Err(ClientError::Connection(_))
        ));
    }

    #[test]
    fn test_shutdown_queues_canceled_poll_responses() {
        let (mut client, _service) = connected();
        let id = client.get_hmd_tracking_space_settings_async().unwrap();
        client.shutdown().unwrap();
        assert_eq!(client.poll_next_message().unwrap().as_event().map(|e| e.event_type), Some(EventType::DisconnectedFromService));
        assert_eq!(response_ids(&mut client), vec![(id, ResultCode::Canceled)]);
    }

    #[test]
    fn test_controller_stream_frame_rate() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        let id = client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        let (sent, payload) = service.next_request().unwrap();
        assert_eq!(sent, id);
        assert_eq!(
            Request::from_payload(&payload).unwrap(),
            Request::StartControllerDataStream {
                controller_id: 0,
                flags: DataStreamFlags::empty()
            }
        );
        service.respond(id, ResultCode::Success, &ResponsePayload::Empty);

        let t0 = Instant::now();
        for i in 0..3 {
            service.push_controller_data_at(psmove_frame(0, i + 1), t0 + Duration::from_millis(16 * i as u64));
        }
        // Frames for controllers nobody listens to are ignored.
        service.push_controller_data(psmove_frame(3, 1));
        client.pump().unwrap();

        let controller = client.controller(0).unwrap();
        assert_eq!(controller.input_sequence_num(), 3);
        assert!((controller.data_frame_average_fps() - 62.5).abs() < 0.5);
        assert_eq!(controller.controller_type(), ControllerType::PsMove);
        assert!(client.controller(3).is_none());
        assert_eq!(response_ids(&mut client), vec![(id, ResultCode::Success)]);
    }

    #[test]
    fn test_raw_sensor_needs_flag() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        client.register_as_controller_listener(1).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::INCLUDE_POSITION)
            .unwrap();
        client
            .start_controller_data_stream_async(1, DataStreamFlags::INCLUDE_RAW_SENSOR)
            .unwrap();
        service.push_controller_data(psmove_frame(0, 1));
        service.push_controller_data(psmove_frame(1, 1));
        client.pump().unwrap();

        let without = client.controller(0).unwrap().psmove().unwrap();
        assert_eq!(without.raw_sensor, RawSensorData::default());
        let with = client.controller(1).unwrap().psmove().unwrap();
        assert_eq!(with.raw_sensor.magnetometer, Vector3i { x: 4, y: 5, z: 6 });
    }

    #[test]
    fn test_refused_stream_reverts_listener() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(2).unwrap();
        let id = client
            .start_controller_data_stream_async(2, DataStreamFlags::INCLUDE_PHYSICS)
            .unwrap();
        assert!(client.controller(2).unwrap().is_streaming());

        service.respond(id, ResultCode::Error, &ResponsePayload::Empty);
        client.pump().unwrap();
        assert!(!client.controller(2).unwrap().is_streaming());
        assert_eq!(response_ids(&mut client), vec![(id, ResultCode::Error)]);
    }

    #[test]
    fn test_listener_bounds_and_static_snapshot() {
        let (mut client, service) = connected();
        assert!(matches!(
            client.register_as_controller_listener(MAX_CONTROLLER_COUNT as i32),
            Err(ClientError::UnknownId { .. })
        ));
        assert!(matches!(
            client.deregister_as_controller_listener(1),
            Err(ClientError::UnknownId { .. })
        ));

        let id = client.get_controller_list_async().unwrap();
        let list = ControllerList {
            controllers: vec![ControllerListEntry {
                controller_id: 1,
                controller_type: ControllerType::PsNavi,
                device_path: "/dev/hidraw5".into(),
                device_serial: "00:06:f7:00:00:01".into(),
            }],
        };
        service.respond(id, ResultCode::Success, &ResponsePayload::ControllerList(list));
        client.pump().unwrap();

        client.register_as_controller_listener(1).unwrap();
        let controller = client.controller(1).unwrap();
        assert_eq!(controller.controller_type(), ControllerType::PsNavi);
        assert_eq!(controller.device_path, "/dev/hidraw5");
    }

    #[test]
    fn test_deregister_streaming_sends_stop() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        let start = client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        client.deregister_as_controller_listener(0).unwrap();
        assert!(client.controller(0).is_none());
        // The start request is still in flight.
        assert!(client.is_request_pending(start));

        let requests: Vec<_> = service
            .drain_requests()
            .into_iter()
            .map(|(id, p)| (id, Request::from_payload(&p).unwrap()))
            .collect();
        assert_eq!(requests.len(), 2);
        let (stop_id, stop) = &requests[1];
        assert_eq!(*stop, Request::StopControllerDataStream { controller_id: 0 });

        service.respond(*stop_id, ResultCode::Success, &ResponsePayload::Empty);
        client.pump().unwrap();
        assert!(client.poll_next_message().is_none());
    }

    #[test]
    fn test_update_controller_publishes_output() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        service.push_controller_data(psmove_frame(0, 1));
        client.pump().unwrap();
        service.drain_requests();

        assert_eq!(client.update_controller(0).unwrap(), None);
        let state = client.controller_mut(0).unwrap().psmove_mut().unwrap();
        state.set_rumble(200);
        state.set_led([255, 0, 0]);
        let id = client.update_controller(0).unwrap().unwrap();

        let (sent, payload) = service.next_request().unwrap();
        assert_eq!(sent, id);
        assert_eq!(
            Request::from_payload(&payload).unwrap(),
            Request::SetControllerOutput {
                controller_id: 0,
                sequence_num: 1,
                rumble: 200,
                led: [255, 0, 0]
            }
        );
        assert_eq!(client.controller(0).unwrap().output_sequence_num(), 1);
        assert_eq!(client.update_controller(0).unwrap(), None);
    }

    #[test]
    fn test_blocking_request_answered_by_service() {
        let (mut client, service) = connected();
        let list = ControllerList {
            controllers: vec![ControllerListEntry {
                controller_id: 0,
                controller_type: ControllerType::PsMove,
                device_path: "/dev/hidraw1".into(),
                device_serial: "00:06:f7:aa:bb:cc".into(),
            }],
        };
        let expected = list.clone();
        let handle = thread::spawn(move || {
            let (id, request) = service.wait_request(Duration::from_secs(2)).unwrap();
            assert_eq!(request, Request::GetControllerList);
            service.respond(id, ResultCode::Success, &ResponsePayload::ControllerList(list));
            service
        });

        let got = client.get_controller_list().unwrap();
        let _service = handle.join().unwrap();
        assert_eq!(got, expected);
        assert_eq!(client.cached_controller_list(), Some(&expected));
        // Blocking responses never reach the queue.
        assert!(client.poll_next_message().is_none());
    }

    #[test]
    fn test_blocking_request_times_out() {
        let config = ClientConfig::default().with_request_timeout(Duration::from_millis(30));
        let (mut client, service) = connected_with(config);
        assert!(matches!(
            client.get_tracker_settings(0),
            Err(ClientError::Timeout)
        ));

        let (late, _) = service.next_request().unwrap();
        assert!(!client.is_request_pending(late));
        service.respond(late, ResultCode::Success, &ResponsePayload::Empty);
        client.pump().unwrap();
        assert!(client.poll_next_message().is_none());
    }

    #[test]
    fn test_blocking_service_error() {
        let (mut client, service) = connected();
        let handle = thread::spawn(move || {
            let (id, _) = service.wait_request(Duration::from_secs(2)).unwrap();
            service.respond(id, ResultCode::Error, &ResponsePayload::Empty);
            service
        });
        let result = client.get_hmd_tracking_space_settings();
        let _service = handle.join().unwrap();
        assert!(matches!(result, Err(ClientError::ServiceError(_))));
    }

    #[test]
    fn test_service_disconnect() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        let pending = client.get_tracker_list_async().unwrap();

        service.disconnect("service stopped");
        client.pump().unwrap();
        client.pump().unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(!client.is_connected());

        let events: Vec<_> = std::iter::from_fn(|| client.poll_next_message()).collect();
        let disconnects = events
            .iter()
            .filter(|m| {
                m.as_event().map(|e| e.event_type) == Some(EventType::DisconnectedFromService)
            })
            .count();
        assert_eq!(disconnects, 1);
        assert!(events.iter().any(|m| m
            .as_response()
            .is_some_and(|r| r.request_id == pending && r.result_code == ResultCode::Canceled)));

        assert!(!client.controller(0).unwrap().is_streaming());
        assert!(matches!(
            client.get_controller_list_async(),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.get_controller_list(),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_tracker_stream_owns_video_accessor() {
        let (mut client, service) = connected();
        let id = client.get_tracker_list_async().unwrap();
        let list = TrackerList {
            trackers: vec![TrackerInfo {
                tracker_id: 0,
                shared_memory_name: "psmove_tracker_0".into(),
                ..Default::default()
            }],
        };
        service.respond(id, ResultCode::Success, &ResponsePayload::TrackerList(list));
        client.pump().unwrap();

        client.register_as_tracker_listener(0).unwrap();
        assert!(client.start_tracker_data_stream_async(9).is_err());
        let start = client.start_tracker_data_stream_async(0).unwrap();
        let tracker = client.tracker(0).unwrap();
        assert_eq!(tracker.listener_count(), 1);
        assert_eq!(
            tracker.video_accessor().map(|a| a.segment_name()),
            Some("psmove_tracker_0")
        );

        service.respond(start, ResultCode::Success, &ResponsePayload::Empty);
        service.push_tracker_data(TrackerDataFrame {
            tracker_id: 0,
            sequence_num: 1,
            is_connected: true,
        });
        client.pump().unwrap();
        assert_eq!(client.tracker(0).unwrap().sequence_num(), 1);

        client.stop_tracker_data_stream_async(0).unwrap();
        let tracker = client.tracker(0).unwrap();
        assert_eq!(tracker.listener_count(), 0);
        assert!(tracker.video_accessor().is_none());
    }

    #[test]
    fn test_opaque_request_round_trip() {
        let (mut client, service) = connected();
        let id = client
            .send_opaque_request(OpaquePayload::new(0x7e, vec![1, 2, 3]))
            .unwrap();
        let (sent, payload) = service.next_request().unwrap();
        assert_eq!(sent, id);
        assert_eq!(payload, OpaquePayload::new(0x7e, vec![1, 2, 3]));

        service.respond_opaque(id, ResultCode::Success, OpaquePayload::new(0xee, vec![9]));
        client.pump().unwrap();
        let message = client.poll_next_message().unwrap();
        let response = message.as_response().unwrap();
        assert_eq!(response.request.tag, 0x7e);
        assert_eq!(response.response.bytes, vec![9]);
        assert_eq!(response.payload, ResponsePayload::Empty);
    }

    #[test]
    fn test_cancel_drops_registered_callback() {
        let (mut client, service) = connected();
        let id = client.get_controller_list_async().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client
            .register_callback(id, move |_: &ResponseMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        client.cancel(id).unwrap();

        service.respond(id, ResultCode::Success, &ResponsePayload::ControllerList(ControllerList::default()));
        client.pump().unwrap();
        client.shutdown().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_list_updated_event_refreshes_mirrors() {
        let (mut client, service) = connected();
        let entry = |device_path: &str| ControllerListEntry {
            controller_id: 1,
            controller_type: ControllerType::PsMove,
            device_path: device_path.into(),
            device_serial: "00:06:f7:00:00:01".into(),
        };
        let id = client.get_controller_list_async().unwrap();
        service.respond(
            id,
            ResultCode::Success,
            &ResponsePayload::ControllerList(ControllerList { controllers: vec![entry("/dev/hidraw2")] }),
        );
        client.pump().unwrap();
        response_ids(&mut client);
        service.drain_requests();
        client.register_as_controller_listener(1).unwrap();
        assert_eq!(client.controller(1).unwrap().device_path, "/dev/hidraw2");

        service.push_event(1, vec![]);
        client.pump().unwrap();
        assert_eq!(
            client.poll_next_message().unwrap().as_event().map(|e| e.event_type),
            Some(EventType::ControllerListUpdated)
        );
        assert!(client.cached_controller_list().is_none());

        let (refresh, payload) = service.next_request().unwrap();
        assert_eq!(Request::from_payload(&payload).unwrap(), Request::GetControllerList);
        let updated = ControllerList { controllers: vec![entry("/dev/hidraw8")] };
        service.respond(refresh, ResultCode::Success, &ResponsePayload::ControllerList(updated.clone()));
        client.pump().unwrap();
        assert_eq!(client.controller(1).unwrap().device_path, "/dev/hidraw8");
        assert_eq!(client.cached_controller_list(), Some(&updated));
        // The refresh response is not handed to the application.
        assert!(client.poll_next_message().is_none());

        service.push_event(2, vec![]);
        client.pump().unwrap();
        assert!(client.cached_tracker_list().is_none());
        let (_, payload) = service.next_request().unwrap();
        assert_eq!(Request::from_payload(&payload).unwrap(), Request::GetTrackerList);
    }

    #[test]
    fn test_restarted_controller_stream_accepts_low_sequence() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        for seq in 1..=5 {
            service.push_controller_data(psmove_frame(0, seq));
        }
        client.pump().unwrap();
        assert_eq!(client.controller(0).unwrap().input_sequence_num(), 5);

        client.stop_controller_data_stream_async(0).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        for seq in 1..=3 {
            service.push_controller_data(psmove_frame(0, seq));
        }
        client.pump().unwrap();
        assert_eq!(client.controller(0).unwrap().input_sequence_num(), 8);
    }

    #[test]
    fn test_failed_output_send_keeps_sequence() {
        let (mut client, service) = connected();
        client.register_as_controller_listener(0).unwrap();
        client
            .start_controller_data_stream_async(0, DataStreamFlags::empty())
            .unwrap();
        service.push_controller_data(psmove_frame(0, 1));
        client.pump().unwrap();

        service.disconnect("service stopped");
        client.pump().unwrap();
        client.controller_mut(0).unwrap().psmove_mut().unwrap().set_rumble(90);
        assert!(matches!(
            client.update_controller(0),
            Err(ClientError::NotConnected)
        ));
        let controller = client.controller(0).unwrap();
        assert_eq!(controller.output_sequence_num(), 0);
        assert!(controller.psmove().unwrap().has_unpublished_state);
    }
}
