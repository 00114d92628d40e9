use crate::config::StreamOptions;
use crate::domain::{Device, EventId};
use crate::error::{FsEventsError, FsEventsResult};
use crate::facility::{CreateRequest, Facility};
use crate::watcher::registry::Registry;
use crate::watcher::stream::{EventReceiver, Stream, StreamCore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Owns the registry shared by every stream it creates, and the facility
/// those streams run on.
pub struct WatcherService<F: Facility> {
    facility: Arc<F>,
    registry: Arc<Registry<F>>,
}

impl<F: Facility> Clone for WatcherService<F> {
    fn clone(&self) -> Self {
        WatcherService {
            facility: self.facility.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<F: Facility> WatcherService<F> {
    pub fn with_facility(facility: F) -> Self {
        Self::with_shared_facility(Arc::new(facility))
    }

    pub fn with_shared_facility(facility: Arc<F>) -> Self {
        WatcherService {
            facility,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn facility(&self) -> &Arc<F> {
        &self.facility
    }

    pub fn registry(&self) -> &Arc<Registry<F>> {
        &self.registry
    }

    /// Creates a stream over `paths`. Nothing is observed until
    /// [`Stream::start`].
    ///
    /// When `options.device` is set the stream is created relative to that
    /// device, as with [`WatcherService::create_relative_to_device`].
    pub fn create<P: AsRef<Path>>(
        &self,
        paths: &[P],
        options: &StreamOptions,
    ) -> FsEventsResult<Stream<F>> {
        let request = CreateRequest {
            device: options.device,
            paths: collect_paths(paths)?,
            since: options.since,
            latency: options.latency,
            flags: options.flags,
        };

        let (core, receiver) = StreamCore::create(
            self.facility.clone(),
            self.registry.clone(),
            &request,
            options.capacity(),
        )?;

        Ok(Stream::new(core, receiver))
    }

    /// Creates a stream scoped to `device`. `paths` are relative to the
    /// device's mount point.
    pub fn create_relative_to_device<P: AsRef<Path>>(
        &self,
        device: Device,
        paths: &[P],
        options: &StreamOptions,
    ) -> FsEventsResult<Stream<F>> {
        let options = StreamOptions {
            device: Some(device),
            ..options.clone()
        };
        self.create(paths, &options)
    }

    /// Tears down the running stream that delivers into `receiver`'s
    /// channel: best-effort flush, stop, invalidate, release, close.
    ///
    /// Returns `false` when no running stream matches, including when the
    /// stream has already been stopped or closed.
    pub fn unwatch(&self, receiver: &EventReceiver) -> bool {
        let Some(owner) = self.registry.owner_of(receiver.channel()) else {
            return false;
        };

        match owner.upgrade() {
            Some(core) => {
                debug!(stream = %receiver.channel(), "unwatching");
                core.close()
            }
            None => false,
        }
    }

    /// Number of streams currently running.
    pub fn active_streams(&self) -> usize {
        self.registry.len()
    }

    /// The host's global event counter.
    pub fn current(&self) -> EventId {
        self.facility.current_event_id()
    }

    /// Highest id recorded on `device` at or before `time`, or
    /// [`EventId::SINCE_ALL`] when there is none.
    pub fn last_event_before(&self, device: Device, time: SystemTime) -> EventId {
        self.facility.last_event_id_before(device, time)
    }
}

fn collect_paths<P: AsRef<Path>>(paths: &[P]) -> FsEventsResult<Vec<PathBuf>> {
    if paths.is_empty() {
        return Err(FsEventsError::NoPaths);
    }

    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            match path.to_str() {
                Some(_) => Ok(path.to_path_buf()),
                None => Err(FsEventsError::NonUtf8Path(path.to_path_buf())),
            }
        })
        .collect()
}
