//! In-flight request registry with message-based cancellation.
//!
//! Every request is registered before its computation starts and carries a
//! small cancel channel plus a [`Settlement`]. [`RequestRegistry::release`]
//! claims the settlement, removes the request and posts
//! [`CancelSignal::Release`] so that whoever is racing the channel against the
//! computation can give up on the result. A request whose computation already
//! claimed the settlement can no longer be released. The computation itself is
//! never interrupted.

pub mod types;

use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

pub use types::{CancelSignal, RegistryError, RequestDetail, RequestId, RequestKind, Settlement};

// Room for one RELEASE and one IGNORE
const CANCEL_CHANNEL_CAPACITY: usize = 2;

/// A registered in-flight request.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    created_at: SystemTime,
    cancel_tx: mpsc::Sender<CancelSignal>,
    settlement: Settlement,
}

impl Request {
    pub fn detail(&self) -> RequestDetail {
        RequestDetail::new(self.id, self.kind, self.created_at)
    }
}

/// Caller-side ends of a request's cancel channel, returned by
/// [`RequestRegistry::register`].
#[derive(Debug)]
pub struct RequestHandle {
    pub id: RequestId,
    /// Used to post [`CancelSignal::Ignore`] once the race is decided.
    pub cancel_tx: mpsc::Sender<CancelSignal>,
    pub cancel_rx: mpsc::Receiver<CancelSignal>,
    /// Claimed by the computation once it has a result.
    pub settlement: Settlement,
}

/// Wait for the next cancel signal.
///
/// A closed channel counts as [`CancelSignal::Ignore`]: nobody can release
/// the request any more.
pub async fn wait_for_release(mut cancel_rx: mpsc::Receiver<CancelSignal>) -> CancelSignal {
    cancel_rx.recv().await.unwrap_or(CancelSignal::Ignore)
}

/// Post `signal` without waiting. A full or closed channel means the listener
/// already moved on, which is expected.
pub fn notify(cancel_tx: &mpsc::Sender<CancelSignal>, signal: CancelSignal) -> bool {
    match cancel_tx.try_send(signal) {
        Ok(()) => true,
        Err(e) => {
            debug!(?signal, error = %e, "Cancel listener already gone");
            false
        }
    }
}

/// Registry of in-flight requests keyed by id.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: RwLock<HashMap<RequestId, Request>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request. A duplicate id is rejected.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn register(
        &self,
        id: RequestId,
        kind: RequestKind,
    ) -> Result<RequestHandle, RegistryError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&id) {
            return Err(RegistryError::DuplicateRequest { id });
        }

        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_CHANNEL_CAPACITY);
        let settlement = Settlement::default();
        requests.insert(
            id,
            Request {
                id,
                kind,
                created_at: SystemTime::now(),
                cancel_tx: cancel_tx.clone(),
                settlement: settlement.clone(),
            },
        );
        debug!(request_id = id, %kind, "Registered request");

        Ok(RequestHandle {
            id,
            cancel_tx,
            cancel_rx,
            settlement,
        })
    }

    /// Drop a request on behalf of its caller: claim its settlement, remove
    /// it and post [`CancelSignal::Release`].
    ///
    /// Returns whether anything was released. A request whose computation
    /// already finished is left alone and reported as not released.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn release(&self, id: RequestId) -> bool {
        let mut requests = self.requests.write().await;
        let Some(request) = requests.get(&id) else {
            debug!(request_id = id, "Nothing to release");
            return false;
        };
        if !request.settlement.settle() {
            debug!(request_id = id, "Request already completed, nothing to release");
            return false;
        }
        let Some(request) = requests.remove(&id) else {
            return false;
        };
        notify(&request.cancel_tx, CancelSignal::Release);
        info!(request_id = id, kind = %request.kind, "Released request");
        true
    }

    /// Deregister a finished request without signalling anyone.
    pub async fn remove(&self, id: RequestId) -> Option<RequestDetail> {
        let request = self.requests.write().await.remove(&id);
        if request.is_some() {
            debug!(request_id = id, "Deregistered request");
        }
        request.as_ref().map(Request::detail)
    }

    /// Release every in-flight request whose computation has not finished
    /// yet. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        self.requests.write().await.retain(|_, request| {
            if !request.settlement.settle() {
                return true;
            }
            notify(&request.cancel_tx, CancelSignal::Release);
            released += 1;
            false
        });
        info!(released, "Released all in-flight requests");
        released
    }

    pub async fn contains(&self, id: RequestId) -> bool {
        self.requests.read().await.contains_key(&id)
    }

    /// Look up a request; an unknown id is a contract violation.
    pub async fn get(&self, id: RequestId) -> Result<RequestDetail, RegistryError> {
        self.requests
            .read()
            .await
            .get(&id)
            .map(Request::detail)
            .ok_or(RegistryError::UnknownRequest { id })
    }

    /// All in-flight requests, ordered by id.
    pub async fn snapshot(&self) -> Vec<RequestDetail> {
        let mut details: Vec<RequestDetail> = self
            .requests
            .read()
            .await
            .values()
            .map(Request::detail)
            .collect();
        details.sort_by_key(|d| d.id);
        details
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }
}
