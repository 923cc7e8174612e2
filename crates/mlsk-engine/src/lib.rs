//! MLSK Engine Library
//!
//! Compute backend core:
//! - Fixed-size pool of long-lived workers fed by a bounded task queue
//! - Per-worker health records and a stuck-worker monitor
//! - First-result-wins race between two computations in one worker slot
//! - In-flight request registry with message-based cancellation
//! - Read-only admin aggregation over pool and registry state

pub mod admin;
pub mod engine;
pub mod pool;
pub mod registry;

pub use admin::{AdminService, EngineDetail, WorkerDetail};
pub use engine::{ComputeEngine, EngineError, SubmitOutcome};
pub use pool::{PoolError, TaskResult, WorkerPool};
pub use registry::{RegistryError, RequestDetail, RequestId, RequestKind, RequestRegistry};
