//! Turns one host callback into a typed [`Batch`] and hands it to the stream's
//! consumer.
//!
//! The bridge keeps nothing between calls. Each batch goes out in one send that
//! blocks the calling loop thread until the consumer has room, so a slow
//! consumer stalls its own stream instead of losing events. A batch is dropped
//! only when no registry entry matches its handle or when nobody can receive it
//! any more.

use crate::domain::{Batch, Event, EventFlags, EventId};
use crate::facility::Facility;
use crate::watcher::registry::{Registry, Route};
use std::ffi::OsStr;
use std::path::PathBuf;
use tracing::{trace, warn};

/// One callback's worth of events as parallel sequences. Index `i` of every
/// sequence describes the same event.
#[derive(Debug, Clone, Copy)]
pub struct RawBatch<'a> {
    pub paths: &'a [&'a OsStr],
    pub flags: &'a [u32],
    /// `None` when the host delivered no ids for this batch.
    pub ids: Option<&'a [u64]>,
}

impl RawBatch<'_> {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug)]
enum Outcome {
    Delivered,
    ReceiverGone,
    Detached,
}

/// Builds events in host order. Batches without ids get [`EventId::default`]
/// on every event.
pub fn translate(raw: &RawBatch<'_>) -> Batch {
    if raw.flags.len() != raw.paths.len() {
        warn!(
            paths = raw.paths.len(),
            flags = raw.flags.len(),
            "host batch has mismatched sequences; extra entries ignored"
        );
    }

    raw.paths
        .iter()
        .zip(raw.flags)
        .enumerate()
        .map(|(i, (path, flags))| Event {
            id: raw
                .ids
                .and_then(|ids| ids.get(i))
                .map_or_else(EventId::default, |id| EventId(*id)),
            path: PathBuf::from(*path),
            flags: EventFlags::from_native(*flags),
        })
        .collect()
}

/// Entry point for every host callback. Must be called on the loop thread of
/// the stream owning `handle`, never from inside a tokio runtime.
pub fn deliver<F: Facility>(registry: &Registry<F>, handle: F::Handle, raw: &RawBatch<'_>) {
    let Some(route) = registry.lookup(&handle) else {
        trace!(?handle, events = raw.len(), "no stream registered; batch dropped");
        return;
    };

    if raw.is_empty() {
        return;
    }

    send(route, translate(raw));
}

fn send(route: Route, batch: Batch) {
    let Route {
        channel,
        sender,
        mut detached,
        runtime,
    } = route;
    let events = batch.len();

    let outcome = runtime.block_on(async move {
        tokio::select! {
            biased;
            sent = sender.send(batch) => match sent {
                Ok(()) => Outcome::Delivered,
                Err(_) => Outcome::ReceiverGone,
            },
            _ = detached.wait_for(|detached| *detached) => Outcome::Detached,
        }
    });

    match outcome {
        Outcome::Delivered => trace!(stream = %channel, events, "batch delivered"),
        Outcome::ReceiverGone => {
            trace!(stream = %channel, events, "receiver dropped; batch discarded")
        }
        Outcome::Detached => {
            trace!(stream = %channel, events, "stream torn down mid-send; batch discarded")
        }
    }
}
