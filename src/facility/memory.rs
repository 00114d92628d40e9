//! An in-process stand-in for the host facility.
//!
//! Changes are injected with [`MemoryFacility::emit`] instead of being detected
//! on disk. Every other part of the contract behaves like FSEvents: batches
//! arrive on the loop thread a handle is scheduled on, history is replayed for
//! cursors other than `SINCE_NOW` and closed with a `HISTORY_DONE` marker, and
//! flushes round-trip through the loop.
//!
//! Breaking the handle contract (using or releasing a handle after it has been
//! released) panics, so tests catch it instead of the process crashing later.

use crate::domain::{Device, EventFlags, EventId};
use crate::facility::{CreateRequest, Facility};
use crate::watcher::bridge::{self, RawBatch};
use crate::watcher::registry::Registry;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryLoop(u64);

static NEXT_LOOP: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<(MemoryLoop, Receiver<LoopMessage>)>> =
        const { RefCell::new(None) };
}

type Change = (PathBuf, u32, u64);

enum LoopMessage {
    Deliver {
        handle: MemoryHandle,
        changes: Vec<Change>,
    },
    Flush {
        done: Option<Sender<()>>,
    },
    Stop,
}

struct LoopSlot {
    sender: Sender<LoopMessage>,
    stopping: bool,
}

struct Record {
    id: u64,
    path: PathBuf,
    flags: u32,
    at: SystemTime,
}

struct MemoryStream {
    request: CreateRequest,
    registry: Arc<Registry<MemoryFacility>>,
    run_loop: Option<MemoryLoop>,
    started: bool,
    /// Highest id handed to the loop for this stream.
    queued: u64,
    /// Highest id the loop has passed to the bridge.
    latest: EventId,
}

impl MemoryStream {
    fn watches(&self, path: &Path) -> bool {
        self.request.paths.iter().any(|root| path.starts_with(root))
    }
}

#[derive(Default)]
struct State {
    next_handle: u64,
    current: u64,
    streams: HashMap<MemoryHandle, MemoryStream>,
    released: HashSet<MemoryHandle>,
    loops: HashMap<MemoryLoop, LoopSlot>,
    history: Vec<Record>,
}

impl State {
    fn stream(&mut self, handle: MemoryHandle) -> &mut MemoryStream {
        if self.released.contains(&handle) {
            panic!("memory facility: {handle:?} used after release");
        }
        match self.streams.get_mut(&handle) {
            Some(stream) => stream,
            None => panic!("memory facility: unknown handle {handle:?}"),
        }
    }

    fn send(&self, run_loop: MemoryLoop, message: LoopMessage) -> bool {
        match self.loops.get(&run_loop) {
            Some(slot) => slot.sender.send(message).is_ok(),
            None => false,
        }
    }
}

/// Simulated facility for a single device.
pub struct MemoryFacility {
    device: Device,
    refuse_start: AtomicBool,
    state: Mutex<State>,
}

impl Default for MemoryFacility {
    fn default() -> Self {
        Self::with_device(Device(1))
    }
}

impl MemoryFacility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: Device) -> Self {
        MemoryFacility {
            device,
            refuse_start: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// The device every emitted change is recorded on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Makes the next `start` call fail.
    pub fn refuse_next_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    /// Makes every running loop return as if the host had ended it.
    pub fn end_loops(&self) {
        let mut state = self.state();
        for slot in state.loops.values_mut() {
            if !slot.stopping {
                slot.stopping = true;
                let _ = slot.sender.send(LoopMessage::Stop);
            }
        }
    }

    /// Handles created and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state().streams.len()
    }

    pub fn released_handles(&self) -> usize {
        self.state().released.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one change and hands it to every started stream watching it,
    /// as a batch of its own.
    pub fn emit(&self, path: impl AsRef<Path>, flags: EventFlags) -> EventId {
        self.emit_batch(&[(path.as_ref(), flags)])
    }

    /// Records several changes at once. Each started stream receives the
    /// ones under its roots as a single batch, in the given order. Returns
    /// the id of the last change.
    pub fn emit_batch<P: AsRef<Path>>(&self, changes: &[(P, EventFlags)]) -> EventId {
        let mut state = self.state();
        let now = SystemTime::now();

        let mut recorded = Vec::with_capacity(changes.len());
        for (path, flags) in changes {
            state.current += 1;
            let record = Record {
                id: state.current,
                path: path.as_ref().to_path_buf(),
                flags: flags.bits(),
                at: now,
            };
            recorded.push((record.path.clone(), record.flags, record.id));
            state.history.push(record);
        }

        let mut outgoing = Vec::new();
        for (handle, stream) in state.streams.iter_mut() {
            let Some(run_loop) = stream.run_loop.filter(|_| stream.started) else {
                continue;
            };

            let matching: Vec<Change> = recorded
                .iter()
                .filter(|(path, _, _)| stream.watches(path))
                .cloned()
                .collect();

            if let Some((_, _, last)) = matching.last() {
                stream.queued = *last;
                outgoing.push((run_loop, *handle, matching));
            }
        }

        for (run_loop, handle, changes) in outgoing {
            state.send(run_loop, LoopMessage::Deliver { handle, changes });
        }

        EventId(state.current)
    }

    /// Replays recorded history newer than the stream's cursor, followed by
    /// the `HISTORY_DONE` marker.
    fn replay(state: &mut State, handle: MemoryHandle) {
        let current = state.current;
        let stream = state.stream(handle);
        if stream.request.since.is_since_now() {
            return;
        }

        let since = stream.request.since.0;
        let mut changes: Vec<Change> = state
            .history
            .iter()
            .filter(|record| record.id > since)
            .map(|record| (record.path.clone(), record.flags, record.id))
            .collect();

        let stream = state.stream(handle);
        changes.retain(|(path, _, _)| stream.watches(path));
        let root = stream.request.paths[0].clone();
        changes.push((root, EventFlags::HISTORY_DONE.bits(), current));
        stream.queued = current;

        if let Some(run_loop) = stream.run_loop {
            state.send(run_loop, LoopMessage::Deliver { handle, changes });
        }
    }

    fn dispatch(&self, handle: MemoryHandle, changes: Vec<Change>) {
        let registry = {
            let mut state = self.state();
            let Some(stream) = state.streams.get_mut(&handle) else {
                return;
            };
            if let Some((_, _, last)) = changes.last() {
                stream.latest = stream.latest.max(EventId(*last));
            }
            stream.registry.clone()
        };

        let paths: Vec<&OsStr> = changes.iter().map(|(path, _, _)| path.as_os_str()).collect();
        let flags: Vec<u32> = changes.iter().map(|(_, flags, _)| *flags).collect();
        let ids: Vec<u64> = changes.iter().map(|(_, _, id)| *id).collect();

        bridge::deliver(
            &registry,
            handle,
            &RawBatch {
                paths: &paths,
                flags: &flags,
                ids: Some(&ids),
            },
        );
    }
}

impl Facility for MemoryFacility {
    type Handle = MemoryHandle;
    type RunLoop = MemoryLoop;

    fn create(
        &self,
        request: &CreateRequest,
        registry: Arc<Registry<Self>>,
    ) -> Option<MemoryHandle> {
        if request.paths.is_empty() {
            return None;
        }
        if request.device.is_some_and(|device| device != self.device) {
            return None;
        }

        let mut state = self.state();
        state.next_handle += 1;
        let handle = MemoryHandle(state.next_handle);
        let latest = if request.since.is_since_now() {
            EventId(state.current)
        } else {
            request.since
        };

        state.streams.insert(
            handle,
            MemoryStream {
                request: request.clone(),
                registry,
                run_loop: None,
                started: false,
                queued: 0,
                latest,
            },
        );
        Some(handle)
    }

    fn current_loop(&self) -> MemoryLoop {
        let mut state = self.state();
        CURRENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some((run_loop, _)) = slot.as_ref() {
                if state.loops.contains_key(run_loop) {
                    return *run_loop;
                }
            }

            let run_loop = MemoryLoop(NEXT_LOOP.fetch_add(1, Ordering::Relaxed));
            let (sender, receiver) = mpsc::channel();
            state.loops.insert(
                run_loop,
                LoopSlot {
                    sender,
                    stopping: false,
                },
            );
            *slot = Some((run_loop, receiver));
            run_loop
        })
    }

    fn run_loop(&self) {
        let Some((run_loop, receiver)) = CURRENT_LOOP.with(|slot| slot.borrow_mut().take()) else {
            return;
        };

        while let Ok(message) = receiver.recv() {
            match message {
                LoopMessage::Deliver { handle, changes } => self.dispatch(handle, changes),
                LoopMessage::Flush { done } => {
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                LoopMessage::Stop => break,
            }
        }

        self.state().loops.remove(&run_loop);
    }

    fn stop_loop(&self, run_loop: MemoryLoop) {
        let mut state = self.state();
        if let Some(slot) = state.loops.get_mut(&run_loop) {
            if !slot.stopping {
                slot.stopping = true;
                let _ = slot.sender.send(LoopMessage::Stop);
            }
        }
    }

    unsafe fn schedule(&self, handle: MemoryHandle, run_loop: MemoryLoop) {
        self.state().stream(handle).run_loop = Some(run_loop);
    }

    unsafe fn unschedule(&self, handle: MemoryHandle, run_loop: MemoryLoop) {
        let mut state = self.state();
        let stream = state.stream(handle);
        if stream.run_loop == Some(run_loop) {
            stream.run_loop = None;
            stream.started = false;
        }
    }

    unsafe fn start(&self, handle: MemoryHandle) -> bool {
        if self.refuse_start.swap(false, Ordering::SeqCst) {
            return false;
        }

        let mut state = self.state();
        let stream = state.stream(handle);
        if stream.run_loop.is_none() || stream.started {
            return false;
        }
        stream.started = true;
        Self::replay(&mut state, handle);
        true
    }

    unsafe fn stop(&self, handle: MemoryHandle) {
        self.state().stream(handle).started = false;
    }

    unsafe fn invalidate(&self, handle: MemoryHandle) {
        let mut state = self.state();
        let stream = state.stream(handle);
        stream.run_loop = None;
        stream.started = false;
    }

    unsafe fn release(&self, handle: MemoryHandle) {
        let mut state = self.state();
        if !state.released.insert(handle) {
            panic!("memory facility: {handle:?} released twice");
        }
        state.streams.remove(&handle);
    }

    unsafe fn flush_sync(&self, handle: MemoryHandle) {
        let (done, finished) = mpsc::channel();
        {
            let mut state = self.state();
            let Some(run_loop) = state.stream(handle).run_loop else {
                return;
            };
            if !state.send(run_loop, LoopMessage::Flush { done: Some(done) }) {
                return;
            }
        }
        // Errors only when the loop exited first.
        let _ = finished.recv();
    }

    unsafe fn flush_async(&self, handle: MemoryHandle) -> EventId {
        let mut state = self.state();
        let stream = state.stream(handle);
        let queued = EventId(stream.queued);
        if let Some(run_loop) = stream.run_loop {
            state.send(run_loop, LoopMessage::Flush { done: None });
        }
        queued
    }

    unsafe fn latest_event_id(&self, handle: MemoryHandle) -> EventId {
        self.state().stream(handle).latest
    }

    unsafe fn copy_watched_paths(&self, handle: MemoryHandle) -> Vec<PathBuf> {
        self.state().stream(handle).request.paths.clone()
    }

    unsafe fn device_of(&self, handle: MemoryHandle) -> Device {
        self.state().stream(handle).request.device.unwrap_or_default()
    }

    fn current_event_id(&self) -> EventId {
        EventId(self.state().current)
    }

    fn last_event_id_before(&self, device: Device, time: SystemTime) -> EventId {
        if device != self.device {
            return EventId::SINCE_ALL;
        }

        self.state()
            .history
            .iter()
            .filter(|record| record.at <= time)
            .map(|record| EventId(record.id))
            .max()
            .unwrap_or(EventId::SINCE_ALL)
    }
}
