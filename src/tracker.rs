//! Local mirror of a tracker camera and its video accessor lifetime.

use crate::controller::DataFrameTiming;
use crate::protocol::{TrackerDataFrame, TrackerInfo};
use crate::Result;
use std::time::Instant;

/// Read-only view onto a tracker's shared-memory video segment.
///
/// Frame decoding is up to the implementation; the client only owns its
/// lifetime.
pub trait VideoFrameAccessor: Send {
    fn segment_name(&self) -> &str;
}

/// Opens an accessor for a shared-memory segment name.
pub type VideoAccessorFactory = Box<dyn Fn(&str) -> Result<Box<dyn VideoFrameAccessor>> + Send>;

/// Accessor that only remembers which segment it was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSegmentHandle {
    name: String,
}

impl VideoFrameAccessor for SharedSegmentHandle {
    fn segment_name(&self) -> &str {
        &self.name
    }
}

pub fn default_accessor_factory() -> VideoAccessorFactory {
    Box::new(|name: &str| {
        Ok(Box::new(SharedSegmentHandle {
            name: name.to_string(),
        }) as Box<dyn VideoFrameAccessor>)
    })
}

pub struct Tracker {
    info: TrackerInfo,
    listener_count: u32,
    is_connected: bool,
    sequence_num: i32,
    last_frame_sequence: Option<i32>,
    timing: DataFrameTiming,
    accessor: Option<Box<dyn VideoFrameAccessor>>,
}

impl Tracker {
    pub(crate) fn new(info: TrackerInfo) -> Self {
        Self {
            info,
            listener_count: 0,
            is_connected: false,
            sequence_num: 0,
            last_frame_sequence: None,
            timing: DataFrameTiming::default(),
            accessor: None,
        }
    }

    pub fn tracker_id(&self) -> i32 {
        self.info.tracker_id
    }

    pub fn info(&self) -> &TrackerInfo {
        &self.info
    }

    /// Active data streams on this tracker.
    pub fn listener_count(&self) -> u32 {
        self.listener_count
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn sequence_num(&self) -> i32 {
        self.sequence_num
    }

    pub fn data_frame_last_received(&self) -> Option<Instant> {
        self.timing.last_received
    }

    pub fn data_frame_average_fps(&self) -> f32 {
        self.timing.average_fps
    }

    pub fn video_accessor(&self) -> Option<&dyn VideoFrameAccessor> {
        self.accessor.as_deref()
    }

    pub(crate) fn set_info(&mut self, info: TrackerInfo) {
        self.info = info;
    }

    /// One more stream; the first one opens the video accessor.
    pub(crate) fn acquire_stream(&mut self, factory: &VideoAccessorFactory) {
        self.listener_count += 1;
        if self.listener_count == 1 {
            self.last_frame_sequence = None;
        }
        if self.listener_count == 1 && self.accessor.is_none() {
            let name = &self.info.shared_memory_name;
            if name.is_empty() {
                log::warn!(
                    "Tracker {} has no shared memory segment; video unavailable",
                    self.info.tracker_id
                );
                return;
            }
            match factory(name) {
                Ok(accessor) => {
                    log::debug!("Tracker {} opened video segment {}", self.info.tracker_id, name);
                    self.accessor = Some(accessor);
                }
                Err(e) => log::warn!(
                    "Tracker {} failed to open video segment {}: {}",
                    self.info.tracker_id,
                    name,
                    e
                ),
            }
        }
    }

    /// One stream fewer; the accessor goes away with the last one.
    pub(crate) fn release_stream(&mut self) {
        if self.listener_count == 0 {
            return;
        }
        self.listener_count -= 1;
        if self.listener_count == 0 && self.accessor.take().is_some() {
            log::debug!("Tracker {} released video segment", self.info.tracker_id);
        }
    }

    pub(crate) fn release_all_streams(&mut self) {
        self.listener_count = 0;
        self.accessor = None;
    }

    pub(crate) fn apply_data_frame(&mut self, frame: &TrackerDataFrame, received_at: Instant) -> bool {
        if self.listener_count == 0 {
            return false;
        }
        if let Some(last) = self.last_frame_sequence {
            if frame.sequence_num <= last {
                log::trace!(
                    "Tracker {} stale frame {} <= {}",
                    self.info.tracker_id,
                    frame.sequence_num,
                    last
                );
                return false;
            }
        }
        self.last_frame_sequence = Some(frame.sequence_num);
        self.sequence_num = frame.sequence_num;
        self.is_connected = frame.is_connected;
        self.timing.record(received_at);
        true
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.is_connected = false;
        self.release_all_streams();
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("tracker_id", &self.info.tracker_id)
            .field("listener_count", &self.listener_count)
            .field("is_connected", &self.is_connected)
            .field("sequence_num", &self.sequence_num)
            .field("video", &self.accessor.as_ref().map(|a| a.segment_name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn info() -> TrackerInfo {
        TrackerInfo {
            tracker_id: 1,
            shared_memory_name: "psmove_tracker_1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_accessor_follows_listener_count() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let factory: VideoAccessorFactory = Box::new(move |name: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SharedSegmentHandle {
                name: name.to_string(),
            }) as Box<dyn VideoFrameAccessor>)
        });

        let mut tracker = Tracker::new(info());
        tracker.acquire_stream(&factory);
        tracker.acquire_stream(&factory);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.video_accessor().unwrap().segment_name(), "psmove_tracker_1");

        tracker.release_stream();
        assert!(tracker.video_accessor().is_some());
        tracker.release_stream();
        assert!(tracker.video_accessor().is_none());
        assert_eq!(tracker.listener_count(), 0);

        tracker.release_stream();
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn test_failed_open_keeps_stream() {
        let factory: VideoAccessorFactory =
            Box::new(|_name: &str| Err(ClientError::Connection("no segment".into())));
        let mut tracker = Tracker::new(info());
        tracker.acquire_stream(&factory);
        assert_eq!(tracker.listener_count(), 1);
        assert!(tracker.video_accessor().is_none());
    }

    #[test]
    fn test_data_frames_only_while_streaming() {
        let mut tracker = Tracker::new(info());
        let t0 = Instant::now();
        let frame = TrackerDataFrame {
            tracker_id: 1,
            sequence_num: 1,
            is_connected: true,
        };
        assert!(!tracker.apply_data_frame(&frame, t0));

        tracker.acquire_stream(&default_accessor_factory());
        assert!(tracker.apply_data_frame(&frame, t0));
        assert!(!tracker.apply_data_frame(&frame, t0));
        let next = TrackerDataFrame {
            sequence_num: 2,
            ..frame
        };
        assert!(tracker.apply_data_frame(&next, t0 + Duration::from_millis(33)));
        assert!(tracker.is_connected());
        assert!((tracker.data_frame_average_fps() - 30.3).abs() < 0.5);

        tracker.mark_disconnected();
        assert!(!tracker.is_connected());
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn test_restarted_stream_accepts_low_sequence() {
        let factory = default_accessor_factory();
        let mut tracker = Tracker::new(info());
        let t0 = Instant::now();
        let frame = |sequence_num| TrackerDataFrame {
            tracker_id: 1,
            sequence_num,
            is_connected: true,
        };

        tracker.acquire_stream(&factory);
        assert!(tracker.apply_data_frame(&frame(0), t0));
        for seq in 1..=5 {
            assert!(tracker.apply_data_frame(&frame(seq), t0));
        }
        tracker.release_stream();

        tracker.acquire_stream(&factory);
        assert!(tracker.apply_data_frame(&frame(1), t0));
        assert_eq!(tracker.sequence_num(), 1);
        assert!(!tracker.apply_data_frame(&frame(1), t0));
    }
}
