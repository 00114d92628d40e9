//! Darwin's FSEvents API behind the [`Facility`] contract.
//!
//! Each stream carries a boxed context holding the registry it reports to. The
//! box is owned by the native stream and freed by FSEvents through
//! [`release_context`] when the stream is released.
//!
//! Paths are handed to the host verbatim. Callers that compare delivered paths
//! against their roots should pass canonical paths (`/private/var/...` rather
//! than `/var/...`), since FSEvents reports resolved ones.
//!
//! For more information see the [FSEvents API reference][ref].
//!
//! [ref]: https://developer.apple.com/documentation/coreservices/file_system_events

use crate::domain::{Device, EventId};
use crate::facility::{CreateRequest, Facility};
use crate::watcher::bridge::{self, RawBatch};
use crate::watcher::registry::Registry;
use crate::watcher::service::WatcherService;
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use std::collections::HashSet;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// Seconds between the Unix epoch and the CoreFoundation reference date
/// (2001-01-01T00:00:00Z).
const CF_ABSOLUTE_TIME_OFFSET: f64 = 978_307_200.0;

const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

type CFAbsoluteTime = f64;

unsafe extern "C" {
    fn FSEventStreamUnscheduleFromRunLoop(
        stream: fs::FSEventStreamRef,
        run_loop: cf::CFRunLoopRef,
        mode: cf::CFStringRef,
    );
    fn FSEventStreamCopyPathsBeingWatched(stream: fs::FSEventStreamRef) -> cf::CFRef;
    fn FSEventStreamGetDeviceBeingWatched(stream: fs::FSEventStreamRef) -> libc::dev_t;
    safe fn FSEventsGetLastEventIdForDeviceBeforeTime(
        device: libc::dev_t,
        time: CFAbsoluteTime,
    ) -> fs::FSEventStreamEventId;

    fn CFStringCreateWithCString(
        allocator: cf::CFRef,
        c_str: *const libc::c_char,
        encoding: u32,
    ) -> cf::CFRef;
    fn CFStringGetLength(string: cf::CFRef) -> cf::CFIndex;
    fn CFStringGetMaximumSizeForEncoding(length: cf::CFIndex, encoding: u32) -> cf::CFIndex;
    fn CFStringGetCString(
        string: cf::CFRef,
        buffer: *mut libc::c_char,
        buffer_size: cf::CFIndex,
        encoding: u32,
    ) -> cf::Boolean;
}

/// A native stream reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef(fs::FSEventStreamRef);

// SAFETY: FSEvents stream references may be used from any thread; the
// `Facility` contract serialises every call that mutates one.
unsafe impl Send for StreamRef {}
unsafe impl Sync for StreamRef {}

/// A CoreFoundation run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunLoopRef(cf::CFRunLoopRef);

// SAFETY: `CFRunLoopStop` is documented as callable from any thread, and the
// reference is only dereferenced while its thread is inside `run_loop`.
unsafe impl Send for RunLoopRef {}
unsafe impl Sync for RunLoopRef {}

/// Owned by the native stream, freed by [`release_context`].
struct StreamContext {
    registry: Arc<Registry<FsEvents>>,
}

extern "C" fn release_context(info: *const libc::c_void) {
    // SAFETY: FSEvents calls `release` exactly once, when the stream is
    // deallocated, with the pointer produced by `Box::into_raw` in `create`.
    unsafe {
        drop(Box::from_raw(info as *mut StreamContext));
    }
}

/// The FSEvents facility.
#[derive(Default)]
pub struct FsEvents {
    /// Handles currently scheduled on a loop. FSEvents asserts when a stream
    /// that is on no loop gets invalidated.
    scheduled: Mutex<HashSet<StreamRef>>,
    /// Loops whose thread is inside `run_loop`. Only these are safe to stop.
    running: Mutex<HashSet<RunLoopRef>>,
}

impl FsEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn scheduled(&self) -> MutexGuard<'_, HashSet<StreamRef>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> MutexGuard<'_, HashSet<RunLoopRef>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WatcherService<FsEvents> {
    pub fn new() -> Self {
        Self::with_facility(FsEvents::new())
    }
}

impl Default for WatcherService<FsEvents> {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide event counter.
pub fn current() -> EventId {
    // SAFETY: takes no arguments and touches no caller state.
    EventId(unsafe { fs::FSEventsGetCurrentEventId() })
}

/// Highest id recorded on `device` at or before `time`.
pub fn last_event_before(device: Device, time: SystemTime) -> EventId {
    EventId(FSEventsGetLastEventIdForDeviceBeforeTime(
        device.0 as libc::dev_t,
        absolute_time(time),
    ))
}

/// Converts to CoreFoundation's clock, which counts from 2001 rather than
/// 1970. Times before 1970 come out negative.
pub fn absolute_time(time: SystemTime) -> CFAbsoluteTime {
    let unix = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    };
    unix - CF_ABSOLUTE_TIME_OFFSET
}

/// Builds the CFArray of CFStrings FSEvents expects. The caller owns the
/// returned array.
unsafe fn path_array(paths: &[PathBuf]) -> Option<cf::CFMutableArrayRef> {
    let array = unsafe {
        cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks)
    };

    for path in paths {
        let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
            warn!(path = %path.display(), "path contains a NUL byte");
            unsafe { cf::CFRelease(array as cf::CFRef) };
            return None;
        };

        unsafe {
            let string = CFStringCreateWithCString(
                cf::kCFAllocatorDefault as cf::CFRef,
                c_path.as_ptr(),
                K_CF_STRING_ENCODING_UTF8,
            );
            if string.is_null() {
                cf::CFRelease(array as cf::CFRef);
                return None;
            }
            cf::CFArrayAppendValue(array, string as _);
            cf::CFRelease(string);
        }
    }

    Some(array)
}

/// Copies a CFString out as a path. The buffer is sized for the string's
/// worst-case UTF-8 length, so only a string CoreFoundation cannot measure
/// comes back as `None`.
unsafe fn string_to_path(string: cf::CFRef) -> Option<PathBuf> {
    let length = unsafe { CFStringGetLength(string) };
    let max_size = unsafe { CFStringGetMaximumSizeForEncoding(length, K_CF_STRING_ENCODING_UTF8) };
    if max_size < 0 {
        return None;
    }

    let mut buffer = vec![0 as libc::c_char; max_size as usize + 1];
    let copied = unsafe {
        CFStringGetCString(
            string,
            buffer.as_mut_ptr(),
            buffer.len() as cf::CFIndex,
            K_CF_STRING_ENCODING_UTF8,
        )
    };
    if copied == 0 {
        return None;
    }

    let c_path = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    Some(PathBuf::from(OsStr::from_bytes(c_path.to_bytes())))
}

impl Facility for FsEvents {
    type Handle = StreamRef;
    type RunLoop = RunLoopRef;

    fn create(&self, request: &CreateRequest, registry: Arc<Registry<Self>>) -> Option<StreamRef> {
        // SAFETY: the array is released below; FSEvents keeps its own copy.
        let paths = unsafe { path_array(&request.paths)? };

        let info = Box::into_raw(Box::new(StreamContext { registry }));
        let context = fs::FSEventStreamContext {
            version: 0,
            info: info as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copy_description: None,
        };

        // SAFETY: every pointer handed over is valid for the duration of the
        // call; `context` is copied by FSEvents.
        let stream = unsafe {
            match request.device {
                Some(device) => fs::FSEventStreamCreateRelativeToDevice(
                    cf::kCFAllocatorDefault,
                    callback,
                    &context,
                    device.0 as libc::dev_t,
                    paths,
                    request.since.0,
                    request.latency_secs(),
                    request.flags.native_bits(),
                ),
                None => fs::FSEventStreamCreate(
                    cf::kCFAllocatorDefault,
                    callback,
                    &context,
                    paths,
                    request.since.0,
                    request.latency_secs(),
                    request.flags.native_bits(),
                ),
            }
        };

        unsafe { cf::CFRelease(paths as cf::CFRef) };

        if stream.is_null() {
            // No stream took ownership of the context.
            // SAFETY: `info` came from `Box::into_raw` above and was not freed.
            unsafe { drop(Box::from_raw(info)) };
            return None;
        }

        Some(StreamRef(stream))
    }

    fn current_loop(&self) -> RunLoopRef {
        // SAFETY: returns the calling thread's loop, creating it if needed.
        RunLoopRef(unsafe { cf::CFRunLoopGetCurrent() })
    }

    fn run_loop(&self) {
        let run_loop = self.current_loop();
        self.running().insert(run_loop);

        // Returns on CFRunLoopStop, or on its own once nothing is scheduled.
        unsafe { cf::CFRunLoopRun() };

        self.running().remove(&run_loop);
    }

    fn stop_loop(&self, run_loop: RunLoopRef) {
        let running = self.running();
        if running.contains(&run_loop) {
            // SAFETY: the owning thread is inside `run_loop`, which cannot
            // return past the `running` lock held here.
            unsafe { cf::CFRunLoopStop(run_loop.0) };
        }
    }

    unsafe fn schedule(&self, handle: StreamRef, run_loop: RunLoopRef) {
        unsafe {
            fs::FSEventStreamScheduleWithRunLoop(handle.0, run_loop.0, cf::kCFRunLoopDefaultMode)
        };
        self.scheduled().insert(handle);
    }

    unsafe fn unschedule(&self, handle: StreamRef, run_loop: RunLoopRef) {
        if self.scheduled().remove(&handle) {
            unsafe {
                FSEventStreamUnscheduleFromRunLoop(
                    handle.0,
                    run_loop.0,
                    cf::kCFRunLoopDefaultMode,
                )
            };
        }
    }

    unsafe fn start(&self, handle: StreamRef) -> bool {
        unsafe { fs::FSEventStreamStart(handle.0) != 0 }
    }

    unsafe fn stop(&self, handle: StreamRef) {
        unsafe { fs::FSEventStreamStop(handle.0) };
    }

    unsafe fn invalidate(&self, handle: StreamRef) {
        if self.scheduled().remove(&handle) {
            unsafe { fs::FSEventStreamInvalidate(handle.0) };
        }
    }

    unsafe fn release(&self, handle: StreamRef) {
        self.scheduled().remove(&handle);
        unsafe { fs::FSEventStreamRelease(handle.0) };
    }

    unsafe fn flush_sync(&self, handle: StreamRef) {
        unsafe { fs::FSEventStreamFlushSync(handle.0) };
    }

    unsafe fn flush_async(&self, handle: StreamRef) -> EventId {
        EventId(unsafe { fs::FSEventStreamFlushAsync(handle.0) })
    }

    unsafe fn latest_event_id(&self, handle: StreamRef) -> EventId {
        EventId(unsafe { fs::FSEventStreamGetLatestEventId(handle.0) })
    }

    unsafe fn copy_watched_paths(&self, handle: StreamRef) -> Vec<PathBuf> {
        let array = unsafe { FSEventStreamCopyPathsBeingWatched(handle.0) };
        if array.is_null() {
            return Vec::new();
        }

        let count = unsafe { cf::CFArrayGetCount(array as _) };
        let mut paths = Vec::with_capacity(count.max(0) as usize);

        for index in 0..count {
            // Items are borrowed from the array ("Get" rule); only the array
            // itself is released.
            let item = unsafe { cf::CFArrayGetValueAtIndex(array as _, index) };
            match unsafe { string_to_path(item as cf::CFRef) } {
                Some(path) => paths.push(path),
                None => warn!(index, "watched path could not be converted"),
            }
        }

        unsafe { cf::CFRelease(array) };
        paths
    }

    unsafe fn device_of(&self, handle: StreamRef) -> Device {
        Device(unsafe { FSEventStreamGetDeviceBeingWatched(handle.0) } as u64)
    }

    fn current_event_id(&self) -> EventId {
        current()
    }

    fn last_event_id_before(&self, device: Device, time: SystemTime) -> EventId {
        last_event_before(device, time)
    }
}

extern "C" fn callback(
    stream_ref: fs::FSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,                        // size_t numEvents
    event_paths: *mut libc::c_void,                  // void *eventPaths
    event_flags: *const fs::FSEventStreamEventFlags, // const FSEventStreamEventFlags eventFlags[]
    event_ids: *const fs::FSEventStreamEventId,      // const FSEventStreamEventId eventIds[]
) {
    // Unwinding into FSEvents is undefined behaviour.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }));

    if outcome.is_err() {
        error!(?stream_ref, num_events, "panic while delivering batch; batch dropped");
    }
}

/// # Safety
///
/// Must only be called by FSEvents, with `info` pointing at the stream's live
/// [`StreamContext`] and every array holding `num_events` entries.
unsafe fn callback_impl(
    stream_ref: fs::FSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: *mut libc::c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    if info.is_null() || num_events == 0 || event_paths.is_null() || event_flags.is_null() {
        return;
    }

    let context = unsafe { &*(info as *const StreamContext) };
    let raw_paths =
        unsafe { slice::from_raw_parts(event_paths as *const *const libc::c_char, num_events) };

    let paths: Vec<&OsStr> = raw_paths
        .iter()
        .map(|path| {
            if path.is_null() {
                OsStr::new("")
            } else {
                OsStr::from_bytes(unsafe { CStr::from_ptr(*path) }.to_bytes())
            }
        })
        .collect();
    let flags = unsafe { slice::from_raw_parts(event_flags, num_events) };
    let ids = if event_ids.is_null() {
        None
    } else {
        Some(unsafe { slice::from_raw_parts(event_ids, num_events) })
    };

    bridge::deliver(
        &context.registry,
        StreamRef(stream_ref),
        &RawBatch {
            paths: &paths,
            flags,
            ids,
        },
    );
}
