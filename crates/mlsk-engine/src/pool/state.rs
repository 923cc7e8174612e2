//! Per-worker health record shared between a worker and its observers.
//!
//! A [`ProcessStateHolder`] is written only by the worker that owns it; the
//! pool, monitor and admin read it through lock-free snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// State of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Idle,
    Busy,
}

impl ProcessState {
    // Every holder starts IDLE and each transition flips the state, so the
    // state is the parity of the transition count.
    const fn from_transition_count(count: u64) -> Self {
        if count % 2 == 0 { Self::Idle } else { Self::Busy }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Busy => write!(f, "BUSY"),
        }
    }
}

/// Point-in-time copy of a holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ProcessState,
    pub transition_count: u64,
    pub last_transition: SystemTime,
    pub started_at: Option<SystemTime>,
}

impl StateSnapshot {
    /// Time spent since the last transition, zero if the clock went backwards.
    pub fn elapsed_since_transition(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_transition).unwrap_or_default()
    }
}

/// Atomic health record for one worker slot.
///
/// `transition_count` grows by exactly one per [`to_busy`](Self::to_busy) or
/// [`to_idle`](Self::to_idle) call and is never decremented. A restarted slot
/// gets a fresh holder starting from zero. State and count live in the same
/// atomic, so a reader never pairs a new state with an old count.
#[derive(Debug)]
pub struct ProcessStateHolder {
    transition_count: AtomicU64,
    last_transition_ms: AtomicU64,
    // 0 until the worker is launched
    started_at_ms: AtomicU64,
}

impl Default for ProcessStateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStateHolder {
    /// Fresh holder: IDLE, zero transitions, never started.
    pub fn new() -> Self {
        Self {
            transition_count: AtomicU64::new(0),
            last_transition_ms: AtomicU64::new(epoch_millis(SystemTime::now())),
            started_at_ms: AtomicU64::new(0),
        }
    }

    /// Switch to BUSY, returning the new transition count.
    pub fn to_busy(&self) -> u64 {
        self.transition(ProcessState::Idle, ProcessState::Busy)
    }

    /// Switch to IDLE, returning the new transition count.
    pub fn to_idle(&self) -> u64 {
        self.transition(ProcessState::Busy, ProcessState::Idle)
    }

    fn transition(&self, from: ProcessState, to: ProcessState) -> u64 {
        // Time first: a reader may see the new time with the old count, never
        // an old time with a new count.
        self.last_transition_ms
            .store(epoch_millis(SystemTime::now()), Ordering::Release);
        let previous = self.transition_count.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(
            ProcessState::from_transition_count(previous),
            from,
            "invalid worker state transition"
        );
        debug_assert_eq!(ProcessState::from_transition_count(previous + 1), to);
        previous + 1
    }

    /// Stamp the launch time of the owning worker.
    pub fn mark_started(&self) {
        self.started_at_ms
            .store(epoch_millis(SystemTime::now()).max(1), Ordering::Release);
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_transition_count(self.transition_count())
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count.load(Ordering::Acquire)
    }

    pub fn last_transition_time(&self) -> SystemTime {
        from_epoch_millis(self.last_transition_ms.load(Ordering::Acquire))
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        match self.started_at_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(from_epoch_millis(ms)),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let transition_count = self.transition_count();
        StateSnapshot {
            state: ProcessState::from_transition_count(transition_count),
            transition_count,
            last_transition: self.last_transition_time(),
            started_at: self.started_at(),
        }
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_epoch_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
