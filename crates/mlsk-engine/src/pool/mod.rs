//! Worker pool: task queue, worker slots, state holders and the stuck-worker monitor.

pub mod monitor;
pub mod state;
pub mod task;
pub mod worker;
pub mod worker_pool;

use std::sync::Arc;

use parking_lot::RwLock;

/// Live worker slots, shared between the pool and the monitor.
pub type WorkerTable = Arc<RwLock<Vec<WorkerProcess>>>;

pub use monitor::{MonitorConfig, MonitorState, PoolMonitor, StuckWorker};
pub use state::{ProcessState, ProcessStateHolder, StateSnapshot};
pub use task::{TaskBody, TaskFuture, TaskResult, task_body};
pub use worker::WorkerProcess;
pub use worker_pool::{PoolConfig, PoolError, ResultReceiver, UnblockFn, WorkerPool};
