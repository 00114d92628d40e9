//! The public lifecycle object: one native handle, one delivery channel.
//!
//! ```text
//!             start            stop
//!   Created ─────────> Running ─────> Stopped
//!      │                 │  ^  start     │
//!      │                 │  └────────────┘
//!      │     close       │ close         │ close
//!      └───────────> Released <──────────┘
//! ```
//!
//! Every transition happens under one lock per stream. A blocking flush runs
//! outside that lock, holding a shared guard that every transition stopping or
//! freeing the handle takes exclusively, after detaching the loop runner so the
//! flush cannot wait on the consumer forever. `Released` is terminal:
//! the handle is freed exactly once on the way in, the channel's sending side
//! is dropped right after the loop thread has exited, and every later call is
//! a no-op or an [`FsEventsError::Released`].

use crate::domain::{Batch, Device, EventId};
use crate::error::{FsEventsError, FsEventsResult};
use crate::facility::{CreateRequest, Facility};
use crate::watcher::registry::Registry;
use crate::watcher::runner::{Binding, LoopRunner};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};
use uuid::Uuid;

/// A running stream whose host loop ended on its own reports `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Running,
    Stopped,
    Released,
}

enum Phase<F: Facility> {
    Created,
    Running(LoopRunner<F>),
    Stopped,
    Released,
}

struct Lifecycle<F: Facility> {
    phase: Phase<F>,
    invalidated: bool,
    /// Dropped on release, which closes the consumer's channel.
    sender: Option<mpsc::Sender<Batch>>,
}

pub(crate) struct StreamCore<F: Facility> {
    id: Uuid,
    facility: Arc<F>,
    registry: Arc<Registry<F>>,
    handle: F::Handle,
    lifecycle: Mutex<Lifecycle<F>>,
    /// Shared across native calls made without `lifecycle` held.
    in_use: RwLock<()>,
}

impl<F: Facility> StreamCore<F> {
    pub(crate) fn create(
        facility: Arc<F>,
        registry: Arc<Registry<F>>,
        request: &CreateRequest,
        capacity: usize,
    ) -> FsEventsResult<(Arc<Self>, EventReceiver)> {
        if request.paths.is_empty() {
            return Err(FsEventsError::NoPaths);
        }

        let handle = facility
            .create(request, registry.clone())
            .ok_or_else(|| FsEventsError::CreateFailed {
                paths: request.paths.clone(),
            })?;

        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(capacity);
        debug!(
            stream = %id,
            ?handle,
            paths = ?request.paths,
            since = %request.since,
            device = ?request.device,
            "stream created"
        );

        let core = Arc::new(StreamCore {
            id,
            facility,
            registry,
            handle,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Created,
                invalidated: false,
                sender: Some(sender),
            }),
            in_use: RwLock::new(()),
        });

        Ok((
            core,
            EventReceiver {
                channel: id,
                inner: receiver,
            },
        ))
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<F>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detaches a running loop runner, then waits for native calls made
    /// outside the lifecycle lock to return.
    fn exclusive(&self, life: &Lifecycle<F>) -> RwLockWriteGuard<'_, ()> {
        if let Phase::Running(runner) = &life.phase {
            runner.detach();
        }
        self.in_use.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> StreamState {
        match &self.lock().phase {
            Phase::Created => StreamState::Created,
            Phase::Running(runner) if runner.has_exited() => StreamState::Stopped,
            Phase::Running(_) => StreamState::Running,
            Phase::Stopped => StreamState::Stopped,
            Phase::Released => StreamState::Released,
        }
    }

    /// Runs `query` against the handle unless it has been released.
    fn query<T>(&self, query: impl FnOnce(&F, F::Handle) -> T) -> FsEventsResult<T> {
        let life = self.lock();
        if matches!(life.phase, Phase::Released) {
            return Err(FsEventsError::Released(self.id));
        }
        Ok(query(&*self.facility, self.handle))
    }

    fn start(self: &Arc<Self>) -> bool {
        let mut life = self.lock();
        if matches!(&life.phase, Phase::Running(runner) if runner.has_exited()) {
            let _exclusive = self.exclusive(&life);
            self.stop_locked(&mut life);
        }

        match life.phase {
            Phase::Running(_) => return true,
            Phase::Released => {
                warn!(stream = %self.id, "start refused: stream released");
                return false;
            }
            Phase::Created | Phase::Stopped => {}
        }

        if life.invalidated {
            warn!(stream = %self.id, "start refused: stream invalidated");
            return false;
        }

        let Some(sender) = life.sender.clone() else {
            return false;
        };

        let binding = Binding {
            facility: self.facility.clone(),
            registry: self.registry.clone(),
            handle: self.handle,
            channel: self.id,
            sender,
            owner: Arc::downgrade(self),
        };

        match LoopRunner::spawn(binding) {
            Ok(Some(runner)) => {
                life.phase = Phase::Running(runner);
                debug!(stream = %self.id, "stream started");
                true
            }
            Ok(None) => {
                warn!(stream = %self.id, "start refused: host did not accept the stream");
                false
            }
            Err(e) => {
                warn!(stream = %self.id, error = %e, "could not spawn loop runner");
                false
            }
        }
    }

    fn flush_sync(&self) -> FsEventsResult<()> {
        let in_use = {
            let life = self.lock();
            match &life.phase {
                Phase::Released => return Err(FsEventsError::Released(self.id)),
                Phase::Running(runner) if !runner.has_exited() => {
                    self.in_use.read().unwrap_or_else(PoisonError::into_inner)
                }
                _ => return Ok(()),
            }
        };

        // SAFETY: `in_use` keeps stop and release out until the call returns.
        unsafe { self.facility.flush_sync(self.handle) };
        drop(in_use);
        Ok(())
    }

    fn flush_async(&self) -> FsEventsResult<EventId> {
        let life = self.lock();
        if matches!(life.phase, Phase::Released) {
            return Err(FsEventsError::Released(self.id));
        }
        // SAFETY: not released.
        Ok(unsafe { self.facility.flush_async(self.handle) })
    }

    fn stop(&self) {
        let mut life = self.lock();
        let _exclusive = self.exclusive(&life);
        self.stop_locked(&mut life);
    }

    fn stop_locked(&self, life: &mut Lifecycle<F>) {
        let runner = match std::mem::replace(&mut life.phase, Phase::Stopped) {
            Phase::Running(runner) => runner,
            other => {
                life.phase = other;
                return;
            }
        };

        runner.detach();
        self.registry.remove(&self.handle);

        // SAFETY: the stream was running, so the handle is live.
        unsafe {
            self.facility.stop(self.handle);
            self.facility.unschedule(self.handle, runner.run_loop());
        }

        runner.join();
        debug!(stream = %self.id, "stream stopped");
    }

    fn invalidate(&self) {
        let mut life = self.lock();
        let _exclusive = self.exclusive(&life);
        self.invalidate_locked(&mut life);
    }

    fn invalidate_locked(&self, life: &mut Lifecycle<F>) {
        if life.invalidated || matches!(life.phase, Phase::Released) {
            return;
        }

        self.stop_locked(life);

        // SAFETY: not released.
        unsafe { self.facility.invalidate(self.handle) };
        life.invalidated = true;
        debug!(stream = %self.id, "stream invalidated");
    }

    fn release(&self) -> bool {
        let mut life = self.lock();
        let _exclusive = self.exclusive(&life);
        self.release_locked(&mut life)
    }

    fn release_locked(&self, life: &mut Lifecycle<F>) -> bool {
        if matches!(life.phase, Phase::Released) {
            return false;
        }

        self.invalidate_locked(life);

        // SAFETY: `Released` is set below under the same lock and never left,
        // so this is the only release of the handle.
        unsafe { self.facility.release(self.handle) };
        life.phase = Phase::Released;
        life.sender = None;
        debug!(stream = %self.id, "stream released");
        true
    }

    /// Flush (best effort), stop, invalidate, release, close the channel.
    pub(crate) fn close(&self) -> bool {
        let mut life = self.lock();
        // Detached from here on: batches that still fit in the channel go
        // out, a consumer that stopped draining cannot hold the flush up.
        let _exclusive = self.exclusive(&life);
        if matches!(&life.phase, Phase::Running(runner) if !runner.has_exited()) {
            // SAFETY: running, so not released.
            unsafe { self.facility.flush_sync(self.handle) };
        }
        self.release_locked(&mut life)
    }
}

/// Receiving side of a stream's delivery channel.
///
/// Yields batches in the order the host produced them and `None` once the
/// stream has been released and every buffered batch has been taken.
#[derive(Debug)]
pub struct EventReceiver {
    channel: Uuid,
    inner: mpsc::Receiver<Batch>,
}

impl EventReceiver {
    /// Identity of the channel, shared with the stream it belongs to.
    pub fn channel(&self) -> Uuid {
        self.channel
    }

    pub async fn recv(&mut self) -> Option<Batch> {
        self.inner.recv().await
    }

    /// Blocking variant of [`EventReceiver::recv`]. Panics when called from
    /// inside an async context, like [`mpsc::Receiver::blocking_recv`].
    pub fn blocking_recv(&mut self) -> Option<Batch> {
        self.inner.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Result<Batch, TryRecvError> {
        self.inner.try_recv()
    }
}

/// A watched set of roots bound to one native handle.
///
/// Created by [`WatcherService`](crate::watcher::service::WatcherService).
/// Dropping a stream releases it without flushing.
pub struct Stream<F: Facility> {
    core: Arc<StreamCore<F>>,
    receiver: Option<EventReceiver>,
}

impl<F: Facility> Stream<F> {
    pub(crate) fn new(core: Arc<StreamCore<F>>, receiver: EventReceiver) -> Self {
        Stream {
            core,
            receiver: Some(receiver),
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Binds the stream to a fresh loop thread and starts observation.
    ///
    /// Blocks until the host has accepted or refused the stream. Returns
    /// `false` when it refused, when the stream has been invalidated or
    /// released, or when no thread could be spawned. Starting a running
    /// stream returns `true` and changes nothing.
    pub fn start(&self) -> bool {
        self.core.start()
    }

    /// Asks the host to deliver buffered events without waiting for them, and
    /// returns the id of the last event queued for this stream. Valid in
    /// every state but `Released`.
    pub fn flush_async(&self) -> FsEventsResult<EventId> {
        self.core.flush_async()
    }

    /// Asks the host to deliver buffered events and blocks until it has.
    ///
    /// Delivery needs room in the channel, so this only returns once the
    /// consumer has taken enough batches, or once another thread stops or
    /// closes the stream. A stream that is not running has nothing to flush.
    pub fn flush(&self) -> FsEventsResult<()> {
        self.core.flush_sync()
    }

    /// Stops observation and lets the loop thread exit. The handle and the
    /// channel stay usable; the stream can be started again.
    pub fn stop(&self) {
        self.core.stop()
    }

    /// Detaches the handle from every loop, stopping it first if needed. The
    /// stream cannot be started afterwards.
    pub fn invalidate(&self) {
        self.core.invalidate()
    }

    /// Stops, invalidates and frees the handle, then closes the channel.
    /// Returns `false` if the stream had already been released.
    pub fn release(&self) -> bool {
        self.core.release()
    }

    /// Like [`Stream::release`], but first flushes whatever still fits in
    /// the channel.
    pub fn close(&self) -> bool {
        self.core.close()
    }

    /// Roots the handle is watching.
    pub fn paths(&self) -> FsEventsResult<Vec<PathBuf>> {
        // SAFETY: `query` checks the handle has not been released.
        self.core
            .query(|facility, handle| unsafe { facility.copy_watched_paths(handle) })
    }

    pub fn device(&self) -> FsEventsResult<Device> {
        // SAFETY: see `paths`.
        self.core
            .query(|facility, handle| unsafe { facility.device_of(handle) })
    }

    /// Id of the last event the host handed to this stream.
    pub fn latest_event_id(&self) -> FsEventsResult<EventId> {
        // SAFETY: see `paths`.
        self.core
            .query(|facility, handle| unsafe { facility.latest_event_id(handle) })
    }

    /// `None` once the receiver has been taken.
    pub fn receiver(&mut self) -> Option<&mut EventReceiver> {
        self.receiver.as_mut()
    }

    pub fn take_receiver(&mut self) -> Option<EventReceiver> {
        self.receiver.take()
    }

    /// Next batch, or `None` once the channel is closed or the receiver has
    /// been taken.
    pub async fn recv(&mut self) -> Option<Batch> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }
}

impl<F: Facility> fmt::Debug for Stream<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("handle", &self.core.handle)
            .field("state", &self.state())
            .finish()
    }
}

impl<F: Facility> Drop for Stream<F> {
    fn drop(&mut self) {
        self.core.release();
    }
}
