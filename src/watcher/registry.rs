use crate::domain::Batch;
use crate::facility::Facility;
use crate::watcher::stream::StreamCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Where batches for one running stream go.
pub struct Entry<F: Facility> {
    channel: Uuid,
    sender: mpsc::Sender<Batch>,
    run_loop: F::RunLoop,
    detached: watch::Receiver<bool>,
    runtime: Handle,
    owner: Weak<StreamCore<F>>,
}

impl<F: Facility> Entry<F> {
    /// `runtime` must not be entered by the thread the host calls back on;
    /// the bridge blocks on it to perform the send.
    pub fn new(
        channel: Uuid,
        sender: mpsc::Sender<Batch>,
        run_loop: F::RunLoop,
        detached: watch::Receiver<bool>,
        runtime: Handle,
    ) -> Self {
        Entry {
            channel,
            sender,
            run_loop,
            detached,
            runtime,
            owner: Weak::new(),
        }
    }

    pub(crate) fn owned_by(mut self, owner: Weak<StreamCore<F>>) -> Self {
        self.owner = owner;
        self
    }

    pub fn channel(&self) -> Uuid {
        self.channel
    }

    pub fn run_loop(&self) -> F::RunLoop {
        self.run_loop
    }

    fn route(&self) -> Route {
        Route {
            channel: self.channel,
            sender: self.sender.clone(),
            detached: self.detached.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

/// The part of an [`Entry`] the bridge needs, copied out so the send happens
/// without the registry lock held.
#[derive(Clone)]
pub struct Route {
    pub(crate) channel: Uuid,
    pub(crate) sender: mpsc::Sender<Batch>,
    pub(crate) detached: watch::Receiver<bool>,
    pub(crate) runtime: Handle,
}

/// Native handle -> delivery endpoint, for every running stream of one
/// [`WatcherService`](crate::watcher::service::WatcherService).
///
/// All access goes through one mutex, so a lookup from a loop thread and a
/// removal from the owning thread never interleave.
pub struct Registry<F: Facility> {
    entries: Mutex<HashMap<F::Handle, Entry<F>>>,
}

impl<F: Facility> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Facility> Registry<F> {
    pub fn new() -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<F::Handle, Entry<F>>> {
        // A panic elsewhere while holding the lock leaves the map itself intact.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry previously stored for `handle`, if any.
    pub fn insert(&self, handle: F::Handle, entry: Entry<F>) -> Option<Entry<F>> {
        self.entries().insert(handle, entry)
    }

    pub fn remove(&self, handle: &F::Handle) -> Option<Entry<F>> {
        self.entries().remove(handle)
    }

    pub fn lookup(&self, handle: &F::Handle) -> Option<Route> {
        self.entries().get(handle).map(Entry::route)
    }

    pub fn contains(&self, handle: &F::Handle) -> bool {
        self.entries().contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Linear scan for the entry delivering into `channel`.
    pub fn find_channel(&self, channel: Uuid) -> Option<F::Handle> {
        self.entries()
            .iter()
            .find(|(_, entry)| entry.channel == channel)
            .map(|(handle, _)| *handle)
    }

    pub(crate) fn owner_of(&self, channel: Uuid) -> Option<Weak<StreamCore<F>>> {
        self.entries()
            .values()
            .find(|entry| entry.channel == channel)
            .map(|entry| entry.owner.clone())
    }
}
