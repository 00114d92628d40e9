use crate::domain::Batch;
use crate::facility::Facility;
use crate::watcher::registry::{Entry, Registry};
use crate::watcher::stream::StreamCore;
use std::io;
use std::sync::{Arc, Weak, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Pause between stop requests while waiting for a loop thread to exit.
const SHUTDOWN_POLL: Duration = Duration::from_millis(1);

/// What a loop thread needs to bind one stream.
pub(crate) struct Binding<F: Facility> {
    pub facility: Arc<F>,
    pub registry: Arc<Registry<F>>,
    pub handle: F::Handle,
    pub channel: Uuid,
    pub sender: mpsc::Sender<Batch>,
    pub owner: Weak<StreamCore<F>>,
}

/// The dedicated thread pumping the host loop of one running stream.
///
/// The thread schedules and starts the handle itself, since the host only
/// calls back on the thread whose loop the handle is scheduled on.
pub struct LoopRunner<F: Facility> {
    stream: Uuid,
    facility: Arc<F>,
    run_loop: F::RunLoop,
    detach: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl<F: Facility> LoopRunner<F> {
    /// Spawns the loop thread and waits until it has bound the handle to its
    /// loop or given up. `Ok(None)` means the host refused to start the
    /// stream; the thread has already exited in that case.
    pub(crate) fn spawn(binding: Binding<F>) -> io::Result<Option<Self>> {
        let stream = binding.channel;
        let facility = binding.facility.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (detach, detached) = watch::channel(false);

        let thread = thread::Builder::new()
            .name(format!("fsevents-loop-{}", stream.simple()))
            .spawn(move || run(binding, detached, ready_tx))?;

        match ready_rx.recv() {
            Ok(Some(run_loop)) => Ok(Some(LoopRunner {
                stream,
                facility,
                run_loop,
                detach,
                thread: Some(thread),
            })),
            _ => {
                let _ = thread.join();
                Ok(None)
            }
        }
    }

    pub fn run_loop(&self) -> F::RunLoop {
        self.run_loop
    }

    /// True once the loop thread has returned, whether asked to or not.
    pub(crate) fn has_exited(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Makes a send that is blocked on the consumer give up, and every later
    /// send from this runner fail fast.
    pub(crate) fn detach(&self) {
        self.detach.send_replace(true);
    }

    /// Stops the loop and waits for the thread to exit.
    pub(crate) fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.detach();

        // Stopping a loop that has not entered its run yet is a no-op, so
        // keep asking until the thread is gone.
        while !thread.is_finished() {
            self.facility.stop_loop(self.run_loop);
            thread::sleep(SHUTDOWN_POLL);
        }

        if thread.join().is_err() {
            warn!(stream = %self.stream, "loop runner panicked");
        }
    }
}

impl<F: Facility> Drop for LoopRunner<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F: Facility>(
    binding: Binding<F>,
    detached: watch::Receiver<bool>,
    ready: std_mpsc::Sender<Option<F::RunLoop>>,
) {
    let Binding {
        facility,
        registry,
        handle,
        channel,
        sender,
        owner,
    } = binding;

    // No IO or timer drivers: the bridge only blocks on channel operations.
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(stream = %channel, error = %e, "could not build delivery runtime");
            let _ = ready.send(None);
            return;
        }
    };

    let run_loop = facility.current_loop();

    // SAFETY: the stream keeps its lifecycle lock until `ready` is answered,
    // and releases the handle only after this thread has been joined.
    let started = unsafe {
        facility.schedule(handle, run_loop);
        let started = facility.start(handle);
        if !started {
            facility.unschedule(handle, run_loop);
        }
        started
    };

    if !started {
        debug!(stream = %channel, ?handle, "host refused to start stream");
        let _ = ready.send(None);
        return;
    }

    let stop_requested = detached.clone();
    registry.insert(
        handle,
        Entry::new(
            channel,
            sender,
            run_loop,
            detached,
            runtime.handle().clone(),
        )
        .owned_by(owner),
    );
    debug!(stream = %channel, ?run_loop, "stream bound to loop");

    let _ = ready.send(Some(run_loop));
    facility.run_loop();

    if *stop_requested.borrow() {
        debug!(stream = %channel, "loop runner exited");
    } else {
        registry.remove(&handle);
        warn!(stream = %channel, "host loop returned while the stream was running");
    }
}
