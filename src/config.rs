use crate::domain::{CreateFlags, Device, EventId};
use std::time::Duration;

/// Settings applied when a stream is created.
///
/// ```rust
/// use fsevents_core::config::StreamOptions;
/// use fsevents_core::domain::EventId;
/// use std::time::Duration;
///
/// let options = StreamOptions {
///     since: EventId::SINCE_ALL,
///     latency: Duration::from_millis(100),
///     ..Default::default()
/// };
/// assert_eq!(options.channel_capacity, 1);
/// ```
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Cursor the stream starts from.
    ///
    /// Defaults to [`EventId::SINCE_NOW`].
    pub since: EventId,

    /// How long the host may hold related changes back to deliver them as
    /// one batch.
    ///
    /// Defaults to 50ms.
    pub latency: Duration,

    /// Behaviour flags, passed through to the host.
    ///
    /// Defaults to `NO_DEFER | FILE_EVENTS`.
    pub flags: CreateFlags,

    /// When set, paths are interpreted relative to this device's mount point
    /// and the stream is scoped to that device.
    ///
    /// Defaults to `None`.
    pub device: Option<Device>,

    /// Number of batches the delivery channel holds before the host's loop
    /// thread blocks on the consumer.
    ///
    /// Values below 1 are raised to 1. Defaults to 1.
    pub channel_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            since: EventId::SINCE_NOW,
            latency: Duration::from_millis(50),
            flags: CreateFlags::default(),
            device: None,
            channel_capacity: 1,
        }
    }
}

impl StreamOptions {
    pub(crate) fn capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
