//! Read-only aggregation of pool and registry state for operators.

use std::sync::Arc;

use serde::Serialize;

use crate::pool::state::epoch_millis;
use crate::pool::{ProcessState, StateSnapshot, WorkerPool};
use crate::registry::{RequestDetail, RequestRegistry};

/// One worker slot as seen by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDetail {
    pub id: usize,
    pub state: ProcessState,
    pub transition_count: u64,
    /// `None` for a slot whose worker was never launched.
    pub started_at_ms: Option<u64>,
}

impl WorkerDetail {
    pub fn from_snapshot(id: usize, snapshot: &StateSnapshot) -> Self {
        Self {
            id,
            state: snapshot.state,
            transition_count: snapshot.transition_count,
            started_at_ms: snapshot.started_at.map(epoch_millis),
        }
    }
}

/// Engine state: every worker slot and every in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDetail {
    pub workers: Vec<WorkerDetail>,
    pub requests: Vec<RequestDetail>,
}

/// Builds [`EngineDetail`] snapshots. Never mutates anything.
#[derive(Clone)]
pub struct AdminService {
    registry: Arc<RequestRegistry>,
    pool: Arc<WorkerPool>,
}

impl AdminService {
    pub const fn new(registry: Arc<RequestRegistry>, pool: Arc<WorkerPool>) -> Self {
        Self { registry, pool }
    }

    /// Registry first, then pool. The two reads are independent, so the lists
    /// may be slightly skewed in time.
    pub async fn snapshot(&self) -> EngineDetail {
        let requests = self.registry.snapshot().await;
        let workers = self
            .pool
            .state_snapshots()
            .iter()
            .map(|(slot, snapshot)| WorkerDetail::from_snapshot(*slot, snapshot))
            .collect();
        EngineDetail { workers, requests }
    }
}
