//! Engine facade used by the outer service layer.
//!
//! [`ComputeEngine`] wires the worker pool, the request registry and the admin
//! service together. Each part is created once by the bootstrap and shared by
//! handle; nothing here is process-global.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use mlsk_core::EngineConfig;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::admin::{AdminService, EngineDetail};
use crate::pool::task::capture;
use crate::pool::{PoolConfig, PoolError, StuckWorker, TaskResult, UnblockFn, WorkerPool};
use crate::registry::{
    CancelSignal, RegistryError, RequestHandle, RequestId, RequestKind, RequestRegistry, notify,
    wait_for_release,
};

/// What the caller of [`ComputeEngine::submit`] gets back.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The computation finished first; its result may itself be a failure.
    Completed(TaskResult),
    /// The request was released while its computation was still running.
    Dropped { id: RequestId },
}

impl SubmitOutcome {
    pub const fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }

    /// The computation's result, `None` for a dropped request.
    pub fn into_task_result(self) -> Option<TaskResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Dropped { .. } => None,
        }
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(result) if result.failed() => write!(f, "request failed"),
            Self::Completed(_) => write!(f, "request completed"),
            Self::Dropped { id } => write!(f, "{id} request dropped"),
        }
    }
}

/// Which side of the submit race produced the first result.
#[derive(Debug)]
enum RaceOutcome {
    Completed(TaskResult),
    Dropped,
    Ignored,
}

/// Compute engine: pool, registry and admin view behind one handle.
#[derive(Clone)]
pub struct ComputeEngine {
    pool: Arc<WorkerPool>,
    registry: Arc<RequestRegistry>,
    admin: AdminService,
}

impl ComputeEngine {
    /// Build an engine with a fresh pool and registry sized from `config`.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_parts(
            Arc::new(WorkerPool::new(PoolConfig::from(config))),
            Arc::new(RequestRegistry::new()),
        )
    }

    /// Build an engine around existing parts.
    pub fn with_parts(pool: Arc<WorkerPool>, registry: Arc<RequestRegistry>) -> Self {
        let admin = AdminService::new(Arc::clone(&registry), Arc::clone(&pool));
        Self {
            pool,
            registry,
            admin,
        }
    }

    /// Start the workers and the monitor.
    pub fn start(&self) -> Result<(), EngineError> {
        Ok(self.pool.start()?)
    }

    /// Run `body(args)` for request `request_id`, racing it against a release
    /// of that request.
    ///
    /// The request is registered first and always deregistered afterwards. A
    /// release that arrives before the computation finishes yields
    /// [`SubmitOutcome::Dropped`]; the computation itself keeps running in its
    /// worker until it returns. Once the computation has claimed the
    /// request's settlement, [`Self::cancel`] reports nothing released.
    pub async fn submit<F, Fut>(
        &self,
        request_id: RequestId,
        kind: RequestKind,
        body: F,
        args: Vec<Value>,
    ) -> Result<SubmitOutcome, EngineError>
    where
        F: FnOnce(Vec<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let RequestHandle {
            id,
            cancel_tx,
            cancel_rx,
            settlement,
        } = self.registry.register(request_id, kind).await?;
        info!(request_id = id, %kind, "Submitting request");

        let computation = async move {
            let result = capture(async move { body(args).await }).await;
            // Losing the settlement means a release got there first
            if settlement.settle() {
                anyhow::Ok(RaceOutcome::Completed(result))
            } else {
                anyhow::Ok(RaceOutcome::Dropped)
            }
        };
        let listener = async move {
            match wait_for_release(cancel_rx).await {
                CancelSignal::Release => anyhow::Ok(RaceOutcome::Dropped),
                CancelSignal::Ignore => anyhow::Ok(RaceOutcome::Ignored),
            }
        };
        // Nobody releases a finished request, so the listener is woken with IGNORE
        let unblock_listener: UnblockFn = Box::new(move || {
            notify(&cancel_tx, CancelSignal::Ignore);
        });

        let race = self
            .pool
            .any_of(computation, listener, None, Some(unblock_listener))
            .await;
        self.registry.remove(id).await;

        match race?.get() {
            Ok(RaceOutcome::Completed(result)) => {
                debug!(request_id = id, failed = result.failed(), "Request completed");
                Ok(SubmitOutcome::Completed(result))
            }
            Err(error) => {
                debug!(request_id = id, error = %error, "Request failed");
                Ok(SubmitOutcome::Completed(TaskResult::failure(error)))
            }
            Ok(RaceOutcome::Dropped) => {
                info!(request_id = id, "Request dropped by caller");
                Ok(SubmitOutcome::Dropped { id })
            }
            Ok(RaceOutcome::Ignored) => {
                warn!(request_id = id, "Cancel listener gave up before the computation finished");
                Err(EngineError::Cancelled { id })
            }
        }
    }

    /// Release an in-flight request. Returns whether anything was released;
    /// `false` also covers a request whose result is already on its way back.
    pub async fn cancel(&self, request_id: RequestId) -> bool {
        self.registry.release(request_id).await
    }

    pub async fn admin_snapshot(&self) -> EngineDetail {
        self.admin.snapshot().await
    }

    /// Kill and replace the worker at `slot`.
    pub async fn restart_worker(&self, slot: usize) -> Result<(), EngineError> {
        Ok(self.pool.restart_worker(slot).await?)
    }

    /// Release every in-flight request.
    pub async fn release_all(&self) -> usize {
        self.registry.release_all().await
    }

    pub fn turn_on_monitoring(&self) {
        self.pool.turn_on_monitoring();
    }

    pub fn turn_off_monitoring(&self) {
        self.pool.turn_off_monitoring();
    }

    pub fn is_monitoring(&self) -> bool {
        self.pool.is_monitoring()
    }

    pub fn subscribe_stuck_workers(&self) -> Option<broadcast::Receiver<StuckWorker>> {
        self.pool.subscribe_stuck_workers()
    }

    /// Release outstanding requests, then stop the pool.
    pub async fn shutdown(&self) {
        let released = self.registry.release_all().await;
        if released > 0 {
            info!(released, "Released in-flight requests for shutdown");
        }
        self.pool.shutdown().await;
    }

    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub const fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub const fn admin(&self) -> &AdminService {
        &self.admin
    }
}

/// Errors surfaced by [`ComputeEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Request {id} lost its cancel listener before completing")]
    Cancelled { id: RequestId },
}
