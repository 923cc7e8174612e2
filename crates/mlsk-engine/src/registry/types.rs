//! Types for the in-flight request registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::pool::state::epoch_millis;

/// Caller-supplied request identifier, unique among in-flight requests.
pub type RequestId = i64;

/// Kind of computation a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    TimeSeries,
    Classifier,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeSeries => write!(f, "TIME_SERIES"),
            Self::Classifier => write!(f, "CLASSIFIER"),
        }
    }
}

/// Message posted on a request's cancel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSignal {
    /// The caller asked to drop the request.
    Release,
    /// No-op wake-up for a listener whose race is already decided.
    Ignore,
}

/// One-shot decision between completing and releasing a request.
///
/// The computation claims it when it finishes and `release` claims it when
/// the caller drops the request; whichever comes first decides the outcome.
#[derive(Debug, Clone, Default)]
pub struct Settlement(Arc<AtomicBool>);

impl Settlement {
    /// Claim the outcome. Only the first caller gets `true`.
    pub fn settle(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_settled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read-only view of an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetail {
    pub id: RequestId,
    pub kind: RequestKind,
    pub created_at_ms: u64,
}

impl RequestDetail {
    pub fn new(id: RequestId, kind: RequestKind, created_at: SystemTime) -> Self {
        Self {
            id,
            kind,
            created_at_ms: epoch_millis(created_at),
        }
    }
}

/// Errors from the request registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Request {id} is already in flight")]
    DuplicateRequest { id: RequestId },

    #[error("Request {id} is not in flight")]
    UnknownRequest { id: RequestId },
}
