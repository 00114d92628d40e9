//! The host change-notification facility, seen through the narrow contract the
//! rest of the crate needs.
//!
//! Two implementations ship with the crate:
//!
//! - [`fsevents::FsEvents`] (macOS only) talks to CoreServices' FSEvents API.
//! - [`memory::MemoryFacility`] simulates the same contract in-process, with
//!   explicitly injected changes. It runs on every platform and drives the
//!   lifecycle tests.
//!
//! # Safety
//!
//! Every method that takes a handle is `unsafe`: the handle must have been
//! returned by [`Facility::create`] on the same facility and must not have been
//! passed to [`Facility::release`]. [`Stream`](crate::watcher::stream::Stream)
//! is the only caller inside this crate and enforces this with its state
//! machine.

#[cfg(target_os = "macos")]
pub mod fsevents;
pub mod memory;

use crate::domain::{CreateFlags, Device, EventId};
use crate::watcher::registry::Registry;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Arguments of a native create call.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// `Some` selects the relative-to-device variant.
    pub device: Option<Device>,
    pub paths: Vec<PathBuf>,
    pub since: EventId,
    pub latency: Duration,
    pub flags: CreateFlags,
}

impl CreateRequest {
    /// Latency in the host's unit (fractional seconds).
    pub fn latency_secs(&self) -> f64 {
        self.latency.as_secs_f64()
    }
}

pub trait Facility: Send + Sync + Sized + 'static {
    /// Native stream handle. Compared and hashed by identity.
    type Handle: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// The event loop a handle gets scheduled on.
    type RunLoop: Copy + Debug + Send + Sync + 'static;

    /// Allocates a native stream. Batches for it will be handed to
    /// [`bridge::deliver`](crate::watcher::bridge::deliver) together with
    /// `registry`. Returns `None` when the host refuses the request.
    fn create(
        &self,
        request: &CreateRequest,
        registry: Arc<Registry<Self>>,
    ) -> Option<Self::Handle>;

    /// The loop belonging to the calling thread.
    fn current_loop(&self) -> Self::RunLoop;

    /// Pumps the calling thread's loop until [`Facility::stop_loop`] is called
    /// on it, or until nothing is scheduled on it any more.
    fn run_loop(&self);

    /// Asks a loop to return from [`Facility::run_loop`]. May be called from any
    /// thread, and is a no-op for a loop that is not running.
    fn stop_loop(&self, run_loop: Self::RunLoop);

    unsafe fn schedule(&self, handle: Self::Handle, run_loop: Self::RunLoop);

    unsafe fn unschedule(&self, handle: Self::Handle, run_loop: Self::RunLoop);

    unsafe fn start(&self, handle: Self::Handle) -> bool;

    unsafe fn stop(&self, handle: Self::Handle);

    unsafe fn invalidate(&self, handle: Self::Handle);

    /// Frees the handle. Calling it twice for one handle is undefined
    /// behaviour in FSEvents.
    unsafe fn release(&self, handle: Self::Handle);

    /// Blocks until every buffered event has been handed to the callback.
    unsafe fn flush_sync(&self, handle: Self::Handle);

    unsafe fn flush_async(&self, handle: Self::Handle) -> EventId;

    unsafe fn latest_event_id(&self, handle: Self::Handle) -> EventId;

    unsafe fn copy_watched_paths(&self, handle: Self::Handle) -> Vec<PathBuf>;

    unsafe fn device_of(&self, handle: Self::Handle) -> Device;

    /// The host's global event counter right now.
    fn current_event_id(&self) -> EventId;

    /// Highest recorded id on `device` at or before `time`, or
    /// [`EventId::SINCE_ALL`] when the device has nothing recorded.
    fn last_event_id_before(&self, device: Device, time: SystemTime) -> EventId;
}
