use fsevents_core::FsEventsError;
use fsevents_core::config::StreamOptions;
use fsevents_core::domain::{Batch, Device, EventFlags, EventId};
use fsevents_core::facility::memory::MemoryFacility;
use fsevents_core::watcher::service::WatcherService;
use fsevents_core::watcher::stream::{EventReceiver, Stream, StreamState};
use std::path::PathBuf;
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

fn service() -> WatcherService<MemoryFacility> {
    WatcherService::with_facility(MemoryFacility::new())
}

async fn next_batch(receiver: &mut EventReceiver) -> Batch {
    timeout(WAIT, receiver.recv())
        .await
        .expect("batch within timeout")
        .expect("channel still open")
}

async fn assert_closed(receiver: &mut EventReceiver) {
    let next = timeout(WAIT, receiver.recv()).await.expect("channel closes");
    assert!(next.is_none(), "unexpected batch {next:?}");
}

fn started(
    watcher: &WatcherService<MemoryFacility>,
    root: &str,
    options: &StreamOptions,
) -> Result<(Stream<MemoryFacility>, EventReceiver), FsEventsError> {
    let mut stream = watcher.create(&[root], options)?;
    let receiver = stream.take_receiver().expect("fresh stream has a receiver");
    assert!(stream.start());
    Ok((stream, receiver))
}

#[test]
fn lifecycle_transitions() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/root"], &StreamOptions::default())?;
    assert_eq!(stream.state(), StreamState::Created);
    assert_eq!(watcher.active_streams(), 0);

    assert!(stream.start());
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(watcher.active_streams(), 1);

    // Starting a running stream changes nothing.
    assert!(stream.start());
    assert_eq!(watcher.active_streams(), 1);

    stream.stop();
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(watcher.active_streams(), 0);

    assert!(stream.start());
    assert_eq!(stream.state(), StreamState::Running);

    assert!(stream.close());
    assert_eq!(stream.state(), StreamState::Released);
    assert_eq!(watcher.active_streams(), 0);

    assert!(!stream.start());
    assert!(!stream.close());
    assert!(!stream.release());
    Ok(())
}

#[test]
#[traced_test]
fn refused_start_leaves_nothing_registered() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/root"], &StreamOptions::default())?;

    watcher.facility().refuse_next_start();
    assert!(!stream.start());
    assert_eq!(stream.state(), StreamState::Created);
    assert_eq!(watcher.active_streams(), 0);
    assert!(logs_contain("start refused: host did not accept the stream"));

    assert!(stream.start());
    assert_eq!(watcher.active_streams(), 1);
    stream.close();
    Ok(())
}

#[test]
fn create_rejects_bad_input() {
    let watcher = service();
    let none: [&str; 0] = [];

    assert!(matches!(
        watcher.create(&none, &StreamOptions::default()),
        Err(FsEventsError::NoPaths)
    ));

    let elsewhere = Device(watcher.facility().device().0 + 1);
    assert!(matches!(
        watcher.create_relative_to_device(elsewhere, &["data"], &StreamOptions::default()),
        Err(FsEventsError::CreateFailed { .. })
    ));
    assert_eq!(watcher.facility().live_handles(), 0);
}

#[tokio::test]
async fn batches_arrive_in_host_order() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;
    let facility = watcher.facility();

    let first = facility.emit("/root/one", EventFlags::CREATED | EventFlags::IS_FILE);
    let second = facility.emit("/root/two", EventFlags::MODIFIED | EventFlags::IS_FILE);
    let third = facility.emit("/root/one", EventFlags::REMOVED | EventFlags::IS_FILE);

    for (id, path) in [(first, "/root/one"), (second, "/root/two"), (third, "/root/one")] {
        let batch = next_batch(&mut receiver).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].path, PathBuf::from(path));
    }

    assert!(stream.close());
    assert_closed(&mut receiver).await;
    Ok(())
}

#[tokio::test]
async fn one_callback_is_one_batch() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    let changes: Vec<(PathBuf, EventFlags)> = (0..100)
        .map(|i| (PathBuf::from(format!("/root/file-{i}")), EventFlags::CREATED))
        .collect();
    watcher.facility().emit_batch(&changes);

    let batch = next_batch(&mut receiver).await;
    assert_eq!(batch.len(), 100);
    for (event, (path, _)) in batch.iter().zip(&changes) {
        assert_eq!(&event.path, path);
    }
    assert!(batch.windows(2).all(|pair| pair[0].id < pair[1].id));

    stream.close();
    Ok(())
}

#[tokio::test]
async fn only_watches_specified_paths() -> Result<(), FsEventsError> {
    let watcher = service();
    let (watched, mut watched_rx) = started(&watcher, "/watched", &StreamOptions::default())?;
    let (other, mut other_rx) = started(&watcher, "/other", &StreamOptions::default())?;

    watcher.facility().emit("/other/holla", EventFlags::CREATED);

    let batch = next_batch(&mut other_rx).await;
    assert_eq!(batch[0].path, PathBuf::from("/other/holla"));
    assert!(
        timeout(Duration::from_millis(200), watched_rx.recv())
            .await
            .is_err(),
        "disjoint stream must stay quiet"
    );

    watched.close();
    other.close();
    Ok(())
}

#[tokio::test]
async fn close_delivers_what_fits_then_closes() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    let id = watcher.facility().emit("/root/last", EventFlags::MODIFIED);
    assert!(stream.close());

    let batch = next_batch(&mut receiver).await;
    assert_eq!(batch[0].id, id);
    assert_closed(&mut receiver).await;
    Ok(())
}

#[tokio::test]
async fn close_does_not_wait_for_a_stalled_consumer() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    let first = watcher.facility().emit("/root/a", EventFlags::CREATED);
    watcher.facility().emit("/root/b", EventFlags::CREATED);
    watcher.facility().emit("/root/c", EventFlags::CREATED);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed = timeout(WAIT, tokio::task::spawn_blocking(move || stream.close()))
        .await
        .expect("close returns while the consumer is stalled")
        .expect("close task");
    assert!(closed);

    let batch = next_batch(&mut receiver).await;
    assert_eq!(batch[0].id, first);
    assert_closed(&mut receiver).await;
    Ok(())
}

#[tokio::test]
async fn stopped_stream_misses_events_until_restarted() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    stream.stop();
    watcher.facility().emit("/root/while-stopped", EventFlags::CREATED);

    assert!(stream.start());
    let id = watcher.facility().emit("/root/after", EventFlags::CREATED);

    let batch = next_batch(&mut receiver).await;
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].path, PathBuf::from("/root/after"));

    stream.close();
    Ok(())
}

#[tokio::test]
async fn history_is_replayed_before_live_events() -> Result<(), FsEventsError> {
    let watcher = service();
    let facility = watcher.facility();
    let first = facility.emit("/root/x", EventFlags::CREATED);
    let second = facility.emit("/root/y", EventFlags::CREATED);
    facility.emit("/elsewhere/z", EventFlags::CREATED);

    let options = StreamOptions {
        since: EventId::SINCE_ALL,
        ..Default::default()
    };
    let (all, mut all_rx) = started(&watcher, "/root", &options)?;
    let batch = next_batch(&mut all_rx).await;
    let ids: Vec<EventId> = batch.iter().map(|event| event.id).collect();
    assert_eq!(&ids[..2], &[first, second]);
    assert!(batch[2].flags.contains(EventFlags::HISTORY_DONE));
    assert!(batch[2].is_root(&PathBuf::from("/root")));

    let options = StreamOptions {
        since: first,
        ..Default::default()
    };
    let (after_first, mut after_rx) = started(&watcher, "/root", &options)?;
    let batch = next_batch(&mut after_rx).await;
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, second);
    assert!(batch[1].flags.contains(EventFlags::HISTORY_DONE));

    all.close();
    after_first.close();
    Ok(())
}

#[tokio::test]
async fn flush_and_latest_ids() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    let id = watcher.facility().emit("/root/file", EventFlags::MODIFIED);
    assert_eq!(stream.flush_async()?, id);

    next_batch(&mut receiver).await;
    stream.flush()?;
    assert_eq!(stream.latest_event_id()?, id);

    stream.stop();
    assert_eq!(stream.flush_async()?, id);
    stream.close();
    Ok(())
}

#[test]
fn flush_async_is_answered_before_start() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/root"], &StreamOptions::default())?;

    assert_eq!(stream.flush_async()?, EventId(0));
    assert_eq!(stream.state(), StreamState::Created);

    stream.close();
    assert!(matches!(
        stream.flush_async(),
        Err(FsEventsError::Released(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unwatch_closes_the_matching_stream() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    let mut idle = watcher.create(&["/idle"], &StreamOptions::default())?;
    let idle_rx = idle.take_receiver().expect("receiver");
    assert!(!watcher.unwatch(&idle_rx));

    assert!(watcher.unwatch(&receiver));
    assert_eq!(stream.state(), StreamState::Released);
    assert_eq!(watcher.active_streams(), 0);
    assert_closed(&mut receiver).await;

    assert!(!watcher.unwatch(&receiver));
    Ok(())
}

#[tokio::test]
async fn invalidated_stream_cannot_restart() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    stream.invalidate();
    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(!stream.start());
    assert_eq!(watcher.active_streams(), 0);

    assert!(stream.release());
    assert_closed(&mut receiver).await;
    Ok(())
}

#[tokio::test]
async fn dropping_a_stream_releases_it() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;
    assert_eq!(watcher.facility().live_handles(), 1);

    drop(stream);
    assert_eq!(watcher.facility().live_handles(), 0);
    assert_eq!(watcher.facility().released_handles(), 1);
    assert_eq!(watcher.active_streams(), 0);
    assert_closed(&mut receiver).await;
    Ok(())
}

#[test]
fn handle_is_released_exactly_once() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/root"], &StreamOptions::default())?;
    assert!(stream.start());

    assert!(stream.close());
    assert!(!stream.release());
    assert!(!stream.close());
    drop(stream);

    assert_eq!(watcher.facility().released_handles(), 1);
    Ok(())
}

#[test]
fn queries_fail_after_release() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/a", "/b"], &StreamOptions::default())?;
    assert_eq!(
        stream.paths()?,
        vec![PathBuf::from("/a"), PathBuf::from("/b")]
    );
    assert_eq!(stream.device()?, Device(0));

    let device = watcher.facility().device();
    let scoped = watcher.create_relative_to_device(device, &["data"], &StreamOptions::default())?;
    assert_eq!(scoped.device()?, device);

    stream.close();
    assert!(matches!(stream.paths(), Err(FsEventsError::Released(id)) if id == stream.id()));
    assert!(matches!(stream.device(), Err(FsEventsError::Released(_))));
    assert!(matches!(stream.latest_event_id(), Err(FsEventsError::Released(_))));
    assert!(matches!(stream.flush(), Err(FsEventsError::Released(_))));
    Ok(())
}

#[tokio::test]
async fn backpressure_keeps_every_batch() -> Result<(), FsEventsError> {
    let watcher = service();
    let options = StreamOptions {
        channel_capacity: 2,
        ..Default::default()
    };
    let (stream, mut receiver) = started(&watcher, "/root", &options)?;

    let ids: Vec<EventId> = (0..20)
        .map(|i| {
            watcher
                .facility()
                .emit(format!("/root/f{i}"), EventFlags::CREATED)
        })
        .collect();

    for id in ids {
        let batch = next_batch(&mut receiver).await;
        assert_eq!(batch[0].id, id);
    }

    stream.close();
    Ok(())
}

/// Starts a stream whose capacity-1 channel is full with a second batch
/// pending, then blocks a `flush` on it from another thread.
fn flush_blocked_on_a_full_channel(
    watcher: &WatcherService<MemoryFacility>,
) -> Result<
    (
        Arc<Stream<MemoryFacility>>,
        EventReceiver,
        thread::JoinHandle<Result<(), FsEventsError>>,
        EventId,
    ),
    FsEventsError,
> {
    let (stream, receiver) = started(watcher, "/root", &StreamOptions::default())?;
    let first = watcher.facility().emit("/root/a", EventFlags::CREATED);
    watcher.facility().emit("/root/b", EventFlags::CREATED);

    let stream = Arc::new(stream);
    let flushing = stream.clone();
    let flusher = thread::spawn(move || flushing.flush());

    thread::sleep(Duration::from_millis(50));
    assert!(!flusher.is_finished(), "flush returned with a batch pending");
    Ok((stream, receiver, flusher, first))
}

#[test]
fn close_is_not_held_up_by_a_pending_flush() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver, flusher, first) = flush_blocked_on_a_full_channel(&watcher)?;

    let (done, closed) = std_mpsc::channel();
    let closing = stream.clone();
    thread::spawn(move || {
        let _ = done.send(closing.close());
    });
    assert_eq!(closed.recv_timeout(WAIT), Ok(true));

    assert!(flusher.join().expect("flush thread").is_ok());
    assert_eq!(stream.state(), StreamState::Released);
    assert_eq!(watcher.facility().released_handles(), 1);

    let batch = receiver.blocking_recv().expect("batch that fit");
    assert_eq!(batch[0].id, first);
    assert!(receiver.blocking_recv().is_none());
    Ok(())
}

#[test]
fn queries_answer_while_a_flush_is_pending() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver, flusher, _) = flush_blocked_on_a_full_channel(&watcher)?;

    let (done, answered) = std_mpsc::channel();
    let querying = stream.clone();
    thread::spawn(move || {
        let _ = done.send(querying.paths().map_err(|err| err.to_string()));
    });
    assert_eq!(
        answered.recv_timeout(WAIT),
        Ok(Ok(vec![PathBuf::from("/root")]))
    );
    assert!(!flusher.is_finished());

    for _ in 0..2 {
        assert!(receiver.blocking_recv().is_some());
    }
    assert!(flusher.join().expect("flush thread").is_ok());

    assert!(stream.close());
    Ok(())
}

#[tokio::test]
async fn stream_notices_a_loop_that_ended_on_its_own() -> Result<(), FsEventsError> {
    let watcher = service();
    let (stream, mut receiver) = started(&watcher, "/root", &StreamOptions::default())?;

    watcher.facility().end_loops();
    let deadline = Instant::now() + WAIT;
    while watcher.active_streams() != 0 || stream.state() != StreamState::Stopped {
        assert!(Instant::now() < deadline, "loop exit went unnoticed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(stream.start());
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(watcher.active_streams(), 1);

    let id = watcher.facility().emit("/root/after", EventFlags::CREATED);
    assert_eq!(next_batch(&mut receiver).await[0].id, id);

    assert!(stream.close());
    assert_closed(&mut receiver).await;
    Ok(())
}

#[test]
fn start_stop_cycles_finish_promptly() -> Result<(), FsEventsError> {
    let watcher = service();
    let stream = watcher.create(&["/root"], &StreamOptions::default())?;

    let began = Instant::now();
    for _ in 0..20 {
        assert!(stream.start());
        stream.stop();
    }
    assert!(began.elapsed() < WAIT);
    assert_eq!(watcher.active_streams(), 0);

    assert!(stream.close());
    Ok(())
}
