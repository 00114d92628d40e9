//! # fsevents_core
//!
//! Delivers host file-system change notifications as ordered batches on
//! channels, with an explicit lifecycle for every watched set of paths.
//!
//! ## Features
//!
//! - **Stream Lifecycle**: Create, start, stop, flush, invalidate and close streams with a
//!   state machine that frees every native handle exactly once
//! - **Ordered Delivery**: One batch per host callback, in host order, with backpressure
//!   instead of dropped events
//! - **History Replay**: Start from any event id, or from the last id recorded before a
//!   point in time
//! - **Device Scoping**: Watch paths relative to a specific device
//! - **Pluggable Facility**: FSEvents on macOS, an in-process simulation everywhere else
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fsevents_core::config::StreamOptions;
//! use fsevents_core::domain::EventFlags;
//! use fsevents_core::facility::memory::MemoryFacility;
//! use fsevents_core::watcher::service::WatcherService;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let watcher = WatcherService::with_facility(MemoryFacility::new());
//!
//! let mut stream = watcher.create(&["/notes"], &StreamOptions::default())?;
//! assert!(stream.start());
//!
//! watcher.facility().emit("/notes/todo.md", EventFlags::CREATED | EventFlags::IS_FILE);
//!
//! if let Some(batch) = stream.recv().await {
//!     for event in &batch {
//!         println!("{event}");
//!     }
//! }
//!
//! stream.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - **[`domain`]**: Event ids, devices, flag sets and the event record
//! - **[`config`]**: Options applied when a stream is created
//! - **[`facility`]**: The host notification facility and its implementations
//! - **[`watcher`]**: Streams, the registry and bridge routing host callbacks to them,
//!   and the loop threads those callbacks run on
//! - **[`error`]**: Unified error handling throughout the library
//!
//! ## Streams
//!
//! A stream owns one native handle and one delivery channel. Starting it spawns a
//! dedicated loop thread; the host calls back on that thread, and each callback
//! becomes one [`domain::Batch`] sent on the channel. A consumer that stops draining
//! stalls its own stream and nothing else.
//!
//! Closing a stream flushes what still fits in the channel, stops the loop thread,
//! frees the handle and closes the channel, so the consumer sees `None` after the
//! last buffered batch:
//!
//! ```rust,no_run
//! use fsevents_core::config::StreamOptions;
//! use fsevents_core::domain::EventId;
//! use fsevents_core::facility::memory::MemoryFacility;
//! use fsevents_core::watcher::service::WatcherService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let watcher = WatcherService::with_facility(MemoryFacility::new());
//! let options = StreamOptions {
//!     since: EventId::SINCE_ALL,
//!     ..Default::default()
//! };
//!
//! let mut stream = watcher.create(&["/projects"], &options)?;
//! let mut receiver = stream.take_receiver().expect("receiver not taken yet");
//!
//! stream.start();
//! while let Some(batch) = receiver.blocking_recv() {
//!     if batch.iter().any(|event| event.flags.contains(fsevents_core::domain::EventFlags::HISTORY_DONE)) {
//!         break;
//!     }
//! }
//! stream.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Fallible operations return [`FsEventsResult<T>`], which wraps [`FsEventsError`].
//! Lifecycle calls on a released stream are no-ops returning `false`; queries on a
//! released stream fail with [`FsEventsError::Released`].
//!
//! ```rust,no_run
//! use fsevents_core::{FsEventsError, FsEventsResult};
//! use fsevents_core::facility::memory::MemoryFacility;
//! use fsevents_core::watcher::service::WatcherService;
//!
//! fn watched_roots(watcher: &WatcherService<MemoryFacility>) -> FsEventsResult<usize> {
//!     let stream = watcher.create(&["/a", "/b"], &Default::default())?;
//!     stream.close();
//!     match stream.paths() {
//!         Err(FsEventsError::Released(_)) => Ok(0),
//!         other => other.map(|paths| paths.len()),
//!     }
//! }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod facility;
pub mod watcher;

/// Re-exports the most commonly used types for convenience.
pub use error::{FsEventsError, FsEventsResult};

#[cfg(target_os = "macos")]
pub use facility::fsevents::{FsEvents, current, last_event_before};
