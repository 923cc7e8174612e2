//! Long-lived worker slot.
//!
//! A worker loops forever on its own OS thread: dequeue a task, mark BUSY, run
//! the body inside a recovery boundary, mark IDLE, publish the result. Its
//! state holder flips exactly twice per completed task and is never written by
//! anyone else.
//!
//! Bodies never run on the caller's runtime. A body stuck in blocking code
//! only ties up its own thread; the monitor and the registry keep running, and
//! [`WorkerProcess::terminate`] can retire the slot without waiting for it.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::state::{ProcessState, ProcessStateHolder};
use super::task::{Task, TaskResult, capture};

/// Receiving end of the bounded task queue, shared by every worker.
pub type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>;

type InFlight = Arc<Mutex<Option<oneshot::Sender<TaskResult>>>>;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Single-threaded runtime driving futures on a dedicated thread.
pub(crate) fn thread_runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Handle to one worker slot and its health record.
#[derive(Debug)]
pub struct WorkerProcess {
    slot: usize,
    state_holder: Arc<ProcessStateHolder>,
    queue: SharedQueue,
    in_flight: InFlight,
    retire_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Create an unstarted worker with a fresh state holder.
    pub fn new(slot: usize, queue: SharedQueue) -> Self {
        let (retire_tx, _) = watch::channel(false);
        Self {
            slot,
            state_holder: Arc::new(ProcessStateHolder::new()),
            queue,
            in_flight: Arc::new(Mutex::new(None)),
            retire_tx,
            thread: None,
        }
    }

    /// Launch the worker thread and stamp its start time. No-op if already
    /// running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let slot = self.slot;
        let state_holder = Arc::clone(&self.state_holder);
        let queue = Arc::clone(&self.queue);
        let in_flight = Arc::clone(&self.in_flight);
        let retired = self.retire_tx.subscribe();

        let thread = std::thread::Builder::new()
            .name(format!("mlsk-worker-{slot}"))
            .spawn(move || run_worker(slot, &state_holder, &queue, &in_flight, retired))?;
        self.thread = Some(thread);
        self.state_holder.mark_started();
        info!(slot, "Worker started");
        Ok(())
    }

    /// Retire the worker unconditionally.
    ///
    /// The in-flight task, if any, is abandoned at once: its result channel
    /// closes without a value. A body that yields is dropped at its next
    /// await; a body stuck in blocking code is given `grace` to return and is
    /// then left to finish on its detached thread, with its result discarded.
    pub async fn terminate(mut self, grace: Duration) {
        let _ = self.retire_tx.send(true);
        drop(self.in_flight.lock().take());

        let Some(thread) = self.thread.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    slot = self.slot,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "Worker did not stop in time, detaching its thread"
                );
                return;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        if thread.join().is_err() {
            warn!(slot = self.slot, "Worker thread ended abnormally");
        }
        info!(slot = self.slot, "Worker terminated");
    }

    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> ProcessState {
        self.state_holder.state()
    }

    pub const fn state_holder(&self) -> &Arc<ProcessStateHolder> {
        &self.state_holder
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.retire_tx.send(true);
        drop(self.in_flight.lock().take());
    }
}

fn run_worker(
    slot: usize,
    state_holder: &ProcessStateHolder,
    queue: &SharedQueue,
    in_flight: &InFlight,
    mut retired: watch::Receiver<bool>,
) {
    let runtime = match thread_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(slot, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    runtime.block_on(async move {
        loop {
            // A dropped handle counts as retirement too
            let next = tokio::select! {
                biased;
                _ = retired.wait_for(|r| *r) => None,
                task = async { queue.lock().await.recv().await } => task,
            };
            let Some(Task {
                body,
                args,
                result_tx,
            }) = next
            else {
                debug!(slot, "Worker retired or task queue closed, exiting");
                return;
            };

            *in_flight.lock() = Some(result_tx);
            let transition_count = state_holder.to_busy();
            debug!(slot, transition_count, "Worker picked up task");

            let result = tokio::select! {
                biased;
                _ = retired.wait_for(|r| *r) => None,
                result = capture(async move { body(args).await }) => Some(result),
            };
            let Some(result) = result else {
                debug!(slot, "Worker retired during a task");
                return;
            };

            let transition_count = state_holder.to_idle();
            debug!(
                slot,
                transition_count,
                failed = result.failed(),
                "Worker finished task"
            );

            let result_tx = in_flight.lock().take();
            match result_tx {
                Some(tx) => {
                    if tx.send(result).is_err() {
                        debug!(slot, "Result receiver dropped before delivery");
                    }
                }
                None => debug!(slot, "Worker was retired, discarding result"),
            }
        }
    });
}
