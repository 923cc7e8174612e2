//! Fixed-size worker pool with admission control.
//!
//! The [`WorkerPool`] owns the bounded task queue, the worker slots and the
//! stuck-worker monitor. [`WorkerPool::execute`] refuses work outright when no
//! worker is IDLE instead of queueing behind busy workers: callers are
//! expected to stay within capacity, so hitting the limit is reported as
//! [`PoolError::PoolExhausted`] rather than retried.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mlsk_core::EngineConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::WorkerTable;
use super::monitor::{MonitorConfig, PoolMonitor, StuckWorker};
use super::state::{ProcessState, ProcessStateHolder, StateSnapshot};
use super::task::{Task, TaskBody, TaskResult, capture, task_body};
use super::worker::{SharedQueue, WorkerProcess, thread_runtime};

/// Action run after an [`any_of`](WorkerPool::any_of) race resolves, used to
/// unblock the losing side.
pub type UnblockFn = Box<dyn FnOnce() + Send>;

type QuickestSlot<T> = Arc<Mutex<Option<oneshot::Sender<TaskResult<T>>>>>;

/// Pool sizing and monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub monitor: MonitorConfig,
    pub monitor_enabled: bool,
    /// Delay after a forced restart before the slot is considered usable.
    pub restart_settle: Duration,
    /// How long a retired worker may take to stop before it is detached.
    pub terminate_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.task_queue_capacity,
            monitor: MonitorConfig {
                interval: config.monitor_interval(),
                stuck_threshold: config.stuck_threshold(),
            },
            monitor_enabled: config.monitor_enabled,
            restart_settle: config.restart_settle(),
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// Awaitable result of a task submitted with [`WorkerPool::execute`].
#[derive(Debug)]
pub struct ResultReceiver {
    rx: oneshot::Receiver<TaskResult>,
}

impl ResultReceiver {
    /// Wait for the worker to publish the task's result.
    pub async fn recv(self) -> Result<TaskResult, PoolError> {
        self.rx.await.map_err(|_| PoolError::WorkerTerminated)
    }
}

/// Fixed set of worker slots fed by one bounded queue.
pub struct WorkerPool {
    config: PoolConfig,
    task_tx: mpsc::Sender<Task>,
    queue: SharedQueue,
    workers: WorkerTable,
    monitor: Mutex<Option<PoolMonitor>>,
    running: AtomicBool,
}

impl WorkerPool {
    /// Create the pool with unstarted workers. Call [`start`](Self::start)
    /// from within a Tokio runtime before submitting work.
    pub fn new(config: PoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (task_tx, task_rx) = mpsc::channel(queue_capacity);
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(task_rx));
        let workers = (0..worker_count)
            .map(|slot| WorkerProcess::new(slot, Arc::clone(&queue)))
            .collect();

        Self {
            config: PoolConfig {
                worker_count,
                queue_capacity,
                ..config
            },
            task_tx,
            queue,
            workers: Arc::new(RwLock::new(workers)),
            monitor: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Start every worker and the monitor. Calling it twice is a no-op.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for worker in self.workers.write().iter_mut() {
            if let Err(source) = worker.start() {
                self.running.store(false, Ordering::Release);
                return Err(PoolError::WorkerSpawn {
                    slot: worker.slot(),
                    source,
                });
            }
        }
        *self.monitor.lock() = Some(PoolMonitor::spawn(
            Arc::clone(&self.workers),
            self.config.monitor,
            self.config.monitor_enabled,
        ));
        info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );
        Ok(())
    }

    /// Terminate the monitor and every worker. In-flight tasks are dropped.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.terminate().await;
        }

        // Unstarted replacements keep the slot table intact for snapshots
        let workers: Vec<WorkerProcess> = self
            .workers
            .write()
            .iter_mut()
            .map(|current| {
                let fresh = WorkerProcess::new(current.slot(), Arc::clone(&self.queue));
                std::mem::replace(current, fresh)
            })
            .collect();
        for worker in workers {
            worker.terminate(self.config.terminate_grace).await;
        }
        info!("Worker pool shut down");
    }

    /// Submit `body(args)` to the next free worker.
    ///
    /// Fails immediately, enqueueing nothing, when no worker is IDLE or the
    /// queue is full.
    pub fn execute<F, Fut>(&self, body: F, args: Vec<Value>) -> Result<ResultReceiver, PoolError>
    where
        F: FnOnce(Vec<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.execute_boxed(task_body(body), args)
    }

    /// [`execute`](Self::execute) for an already boxed body.
    pub fn execute_boxed(
        &self,
        body: TaskBody,
        args: Vec<Value>,
    ) -> Result<ResultReceiver, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        // Check-then-enqueue: two concurrent callers can both pass the idle
        // check, the queue capacity absorbs the second one.
        self.ensure_idle_worker()?;

        let (task, rx) = Task::new(body, args);
        self.task_tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(
                    capacity = self.config.queue_capacity,
                    "Task queue full, rejecting task"
                );
                PoolError::QueueFull {
                    capacity: self.config.queue_capacity,
                }
            }
            mpsc::error::TrySendError::Closed(_) => PoolError::NotRunning,
        })?;
        debug!(queued = self.queued_tasks(), "Task enqueued");
        Ok(ResultReceiver { rx })
    }

    /// Run two computations concurrently inside one worker slot and return
    /// whichever finishes first, error included.
    ///
    /// Each side runs on its own thread, so a side stuck in blocking code
    /// cannot starve the other. The loser keeps running and the worker stays
    /// BUSY until both sides are done. The unblock actions are invoked once the
    /// race is decided so the caller can make the loser return.
    pub async fn any_of<T, F1, F2>(
        &self,
        first: F1,
        second: F2,
        unblock_first: Option<UnblockFn>,
        unblock_second: Option<UnblockFn>,
    ) -> Result<TaskResult<T>, PoolError>
    where
        T: Send + 'static,
        F1: Future<Output = anyhow::Result<T>> + Send + 'static,
        F2: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (quickest_tx, quickest_rx) = oneshot::channel();
        let quickest: QuickestSlot<T> = Arc::new(Mutex::new(Some(quickest_tx)));

        let race = task_body(move |_args| async move {
            let first_done = spawn_racer("first", first, Arc::clone(&quickest));
            let second_done = spawn_racer("second", second, quickest);
            // A closed channel means the racer thread is gone, either way it is done
            let _ = first_done.await;
            let _ = second_done.await;
            anyhow::Ok(Value::Null)
        });
        let completion = self.execute_boxed(race, Vec::new())?;

        // The race task only completes after a side has posted, so a finished
        // or dropped task without a posted result means the worker was retired.
        let outcome = tokio::select! {
            biased;
            quickest = quickest_rx => quickest.map_err(|_| PoolError::WorkerTerminated),
            _ = completion.recv() => Err(PoolError::WorkerTerminated),
        };
        if outcome.is_err() {
            return outcome;
        }
        if let Some(unblock) = unblock_first {
            unblock();
        }
        if let Some(unblock) = unblock_second {
            unblock();
        }
        outcome
    }

    /// Kill the worker at `slot` and replace it with a fresh one.
    ///
    /// The new worker starts with a fresh state holder (IDLE, zero
    /// transitions) and is running before the old one is retired, so the slot
    /// never holds a dead worker even if this future is dropped midway. Other
    /// slots are left untouched.
    pub async fn restart_worker(&self, slot: usize) -> Result<(), PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let old = {
            let mut table = self.workers.write();
            let workers = table.len();
            let current = table
                .get_mut(slot)
                .ok_or(PoolError::InvalidSlot { slot, workers })?;
            let mut fresh = WorkerProcess::new(slot, Arc::clone(&self.queue));
            fresh
                .start()
                .map_err(|source| PoolError::WorkerSpawn { slot, source })?;
            std::mem::replace(current, fresh)
        };
        warn!(
            slot,
            state = %old.state(),
            transition_count = old.state_holder().transition_count(),
            "Restarting worker"
        );
        old.terminate(self.config.terminate_grace).await;

        tokio::time::sleep(self.config.restart_settle).await;
        info!(slot, "Worker restarted");
        Ok(())
    }

    /// Current state of every slot, ordered by slot.
    pub fn states(&self) -> Vec<ProcessState> {
        self.workers.read().iter().map(WorkerProcess::state).collect()
    }

    /// Shared state holders of every slot, ordered by slot.
    pub fn state_holders(&self) -> Vec<(usize, Arc<ProcessStateHolder>)> {
        self.workers
            .read()
            .iter()
            .map(|w| (w.slot(), Arc::clone(w.state_holder())))
            .collect()
    }

    /// Point-in-time snapshots of every slot, ordered by slot.
    pub fn state_snapshots(&self) -> Vec<(usize, StateSnapshot)> {
        self.workers
            .read()
            .iter()
            .map(|w| (w.slot(), w.state_holder().snapshot()))
            .collect()
    }

    pub fn turn_on_monitoring(&self) {
        if let Some(monitor) = self.monitor.lock().as_ref() {
            monitor.turn_on();
        }
    }

    pub fn turn_off_monitoring(&self) {
        if let Some(monitor) = self.monitor.lock().as_ref() {
            monitor.turn_off();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(PoolMonitor::is_on)
    }

    /// Stuck-worker reports from the monitor, `None` before [`start`](Self::start).
    pub fn subscribe_stuck_workers(&self) -> Option<broadcast::Receiver<StuckWorker>> {
        self.monitor.lock().as_ref().map(PoolMonitor::subscribe)
    }

    /// Number of tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.task_tx.max_capacity() - self.task_tx.capacity()
    }

    pub fn is_task_queue_empty(&self) -> bool {
        self.queued_tasks() == 0
    }

    pub const fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_idle_worker(&self) -> Result<(), PoolError> {
        let states = self.states();
        if states.contains(&ProcessState::Idle) {
            return Ok(());
        }
        warn!(
            workers = states.len(),
            "No idle worker, the orchestrator is sending more requests than the pool can run"
        );
        Err(PoolError::PoolExhausted {
            workers: states.len(),
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Run one side of a race on a dedicated thread. The returned channel closes
/// when the thread is done.
fn spawn_racer<T, F>(
    side: &'static str,
    racer: F,
    quickest: QuickestSlot<T>,
) -> oneshot::Receiver<()>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let failed_quickest = Arc::clone(&quickest);
    let spawned = std::thread::Builder::new()
        .name(format!("mlsk-racer-{side}"))
        .spawn(move || {
            let _done = done_tx;
            match thread_runtime() {
                Ok(runtime) => runtime.block_on(post_if_first(side, racer, quickest)),
                Err(e) => {
                    let error = anyhow::Error::new(e).context("racer runtime unavailable");
                    post_first(side, &quickest, TaskResult::failure(error));
                }
            }
        });
    if let Err(e) = spawned {
        let error = anyhow::Error::new(e).context("racer thread unavailable");
        post_first(side, &failed_quickest, TaskResult::failure(error));
    }
    done_rx
}

/// Run one side of a race and post its result unless the other side already did.
async fn post_if_first<T, F>(side: &'static str, racer: F, quickest: QuickestSlot<T>)
where
    F: Future<Output = anyhow::Result<T>>,
{
    let result = capture(racer).await;
    post_first(side, &quickest, result);
}

fn post_first<T>(side: &'static str, quickest: &QuickestSlot<T>, result: TaskResult<T>) {
    let sender = quickest.lock().take();
    match sender {
        Some(tx) => {
            if tx.send(result).is_err() {
                debug!(side, "Race caller went away before the first result");
            }
        }
        None => debug!(
            side,
            failed = result.failed(),
            "Race already decided, discarding later result"
        ),
    }
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No worker is IDLE; the caller exceeded the pool's capacity.
    #[error("Worker pool exhausted: no idle worker among {workers}")]
    PoolExhausted { workers: usize },

    #[error("Task queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("Worker terminated before publishing a result")]
    WorkerTerminated,

    #[error("Invalid worker slot {slot} (pool has {workers} workers)")]
    InvalidSlot { slot: usize, workers: usize },

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Failed to start worker {slot}: {source}")]
    WorkerSpawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(worker_count: usize, queue_capacity: usize) -> PoolConfig {
        PoolConfig {
            worker_count,
            queue_capacity,
            restart_settle: Duration::ZERO,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn pool_config_follows_engine_config() {
        let config = PoolConfig::from(&EngineConfig::default());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.monitor.stuck_threshold, Duration::from_secs(40));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let pool = WorkerPool::new(config(0, 0));
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.config().queue_capacity, 1);
    }

    #[tokio::test]
    async fn execute_before_start_is_rejected() {
        let pool = WorkerPool::new(config(1, 1));
        let err = pool
            .execute(|_| async { anyhow::Ok(Value::Null) }, Vec::new())
            .unwrap_err();
        assert!(matches!(err, PoolError::NotRunning));
    }

    #[tokio::test]
    async fn execute_returns_result_and_empties_queue() {
        let pool = WorkerPool::new(config(2, 4));
        pool.start().unwrap();

        let rx = pool
            .execute(
                |args| async move {
                    let x = args[0].as_i64().unwrap_or_default();
                    anyhow::Ok(Value::from(x * 2))
                },
                vec![Value::from(3)],
            )
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().get().unwrap(), Value::from(6));
        assert!(pool.is_task_queue_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn restart_rejects_unknown_slot() {
        let pool = WorkerPool::new(config(2, 2));
        pool.start().unwrap();
        let err = pool.restart_worker(5).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidSlot {
                slot: 5,
                workers: 2
            }
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn monitoring_toggles_at_runtime() {
        let pool = WorkerPool::new(config(1, 1));
        assert!(!pool.is_monitoring());
        pool.start().unwrap();
        assert!(pool.is_monitoring());
        pool.turn_off_monitoring();
        assert!(!pool.is_monitoring());
        pool.turn_on_monitoring();
        assert!(pool.is_monitoring());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_work() {
        let pool = WorkerPool::new(config(1, 1));
        pool.start().unwrap();
        pool.shutdown().await;
        assert!(!pool.is_running());
        assert!(matches!(
            pool.execute(|_| async { anyhow::Ok(Value::Null) }, Vec::new()),
            Err(PoolError::NotRunning)
        ));
    }
}
