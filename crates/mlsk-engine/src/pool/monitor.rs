//! Stuck-worker monitor.
//!
//! Runs independently of the task queue and polls every worker's state holder
//! on a fixed interval. A worker that stays BUSY with an unchanged transition
//! count for longer than the stuck threshold is reported with a warning. The
//! monitor never restarts anything itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::WorkerTable;
use super::state::{ProcessState, StateSnapshot};

const REPORT_CAPACITY: usize = 64;

/// Monitor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between two ticks.
    pub interval: Duration,
    /// BUSY time without a transition after which a worker is reported.
    pub stuck_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            stuck_threshold: Duration::from_secs(40),
        }
    }
}

/// A worker observed BUSY without any transition for too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckWorker {
    pub slot: usize,
    pub elapsed: Duration,
    pub transition_count: u64,
}

/// Cached `(state, transition_count)` per slot from previous ticks.
#[derive(Debug)]
pub struct MonitorState {
    stuck_threshold: Duration,
    cached: HashMap<usize, (ProcessState, u64)>,
}

impl MonitorState {
    pub fn new(stuck_threshold: Duration) -> Self {
        Self {
            stuck_threshold,
            cached: HashMap::new(),
        }
    }

    /// Run one monitoring tick over `snapshots`.
    ///
    /// Slots whose transition count moved (or that are new) refresh the
    /// cache. Slots whose count did not move are reported when they are still
    /// BUSY and the last transition is older than the threshold. Slots that no
    /// longer exist are forgotten.
    pub fn inspect(
        &mut self,
        snapshots: &[(usize, StateSnapshot)],
        now: SystemTime,
    ) -> Vec<StuckWorker> {
        self.cached
            .retain(|slot, _| snapshots.iter().any(|(s, _)| s == slot));

        let mut stuck = Vec::new();
        for (slot, snapshot) in snapshots {
            match self.cached.get(slot) {
                Some(&(cached_state, cached_count))
                    if cached_count == snapshot.transition_count =>
                {
                    let elapsed = snapshot.elapsed_since_transition(now);
                    if elapsed > self.stuck_threshold
                        && snapshot.state == cached_state
                        && snapshot.state == ProcessState::Busy
                    {
                        warn!(
                            slot,
                            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                            transition_count = snapshot.transition_count,
                            "Worker has been BUSY past the stuck threshold, consider restarting it"
                        );
                        stuck.push(StuckWorker {
                            slot: *slot,
                            elapsed,
                            transition_count: snapshot.transition_count,
                        });
                    }
                }
                _ => {
                    self.cached
                        .insert(*slot, (snapshot.state, snapshot.transition_count));
                }
            }
        }
        stuck
    }
}

/// Handle to the background monitor task.
pub struct PoolMonitor {
    enabled: Arc<AtomicBool>,
    reports: broadcast::Sender<StuckWorker>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PoolMonitor {
    /// Spawn the monitor over the live worker table.
    ///
    /// The cache is primed from the current table so that the first tick can
    /// already report.
    pub fn spawn(workers: WorkerTable, config: MonitorConfig, enabled: bool) -> Self {
        let enabled = Arc::new(AtomicBool::new(enabled));
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut state = MonitorState::new(config.stuck_threshold);
        state.inspect(&snapshot_table(&workers), SystemTime::now());

        let handle = tokio::spawn(run_monitor(
            workers,
            config.interval,
            state,
            Arc::clone(&enabled),
            reports.clone(),
            shutdown_rx,
        ));
        info!(
            interval_ms = u64::try_from(config.interval.as_millis()).unwrap_or(u64::MAX),
            stuck_threshold_ms =
                u64::try_from(config.stuck_threshold.as_millis()).unwrap_or(u64::MAX),
            "Pool monitor started"
        );

        Self {
            enabled,
            reports,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Resume inspection on subsequent ticks.
    pub fn turn_on(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Pause inspection without stopping the monitor task.
    pub fn turn_off(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_on(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Receive every stuck-worker report emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StuckWorker> {
        self.reports.subscribe()
    }

    /// Stop the monitor task and wait for it to exit.
    pub async fn terminate(mut self) {
        self.turn_off();
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn snapshot_table(workers: &WorkerTable) -> Vec<(usize, StateSnapshot)> {
    workers
        .read()
        .iter()
        .map(|worker| (worker.slot(), worker.state_holder().snapshot()))
        .collect()
}

async fn run_monitor(
    workers: WorkerTable,
    interval: Duration,
    mut state: MonitorState,
    enabled: Arc<AtomicBool>,
    reports: broadcast::Sender<StuckWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick, the cache was primed at spawn
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if !enabled.load(Ordering::Acquire) {
                    continue;
                }
                let snapshots = snapshot_table(&workers);
                debug!(workers = snapshots.len(), "Monitoring worker states");
                for report in state.inspect(&snapshots, SystemTime::now()) {
                    // No subscriber is fine, the warning was already logged
                    let _ = reports.send(report);
                }
            }
            _ = shutdown.changed() => {
                info!("Pool monitor shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(40);

    fn snapshot(state: ProcessState, transition_count: u64, at: SystemTime) -> StateSnapshot {
        StateSnapshot {
            state,
            transition_count,
            last_transition: at,
            started_at: Some(at),
        }
    }

    #[test]
    fn first_sighting_only_primes_cache() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        let busy = [(0, snapshot(ProcessState::Busy, 1, t0))];
        assert!(state.inspect(&busy, t0 + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn busy_without_transition_reports_once_per_tick_after_threshold() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        let busy = [(0, snapshot(ProcessState::Busy, 1, t0))];
        state.inspect(&busy, t0);

        // Before the threshold: nothing
        for secs in [10, 20, 40] {
            assert!(state.inspect(&busy, t0 + Duration::from_secs(secs)).is_empty());
        }

        // After the threshold: exactly one report per tick
        for secs in [41, 60, 80] {
            let reports = state.inspect(&busy, t0 + Duration::from_secs(secs));
            assert_eq!(
                reports,
                vec![StuckWorker {
                    slot: 0,
                    elapsed: Duration::from_secs(secs),
                    transition_count: 1,
                }]
            );
        }
    }

    #[test]
    fn idle_worker_is_never_stuck() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        let idle = [(0, snapshot(ProcessState::Idle, 2, t0))];
        state.inspect(&idle, t0);
        assert!(state.inspect(&idle, t0 + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn transition_refreshes_cache_instead_of_reporting() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        state.inspect(&[(0, snapshot(ProcessState::Busy, 1, t0))], t0);

        let later = t0 + Duration::from_secs(100);
        let moved = [(0, snapshot(ProcessState::Busy, 3, t0 + Duration::from_secs(90)))];
        assert!(state.inspect(&moved, later).is_empty());
        // Same count on the next tick, but only 20s since the new transition
        assert!(state.inspect(&moved, t0 + Duration::from_secs(110)).is_empty());
    }

    #[test]
    fn only_the_stuck_slot_is_reported() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        let table = [
            (0, snapshot(ProcessState::Idle, 4, t0)),
            (1, snapshot(ProcessState::Busy, 7, t0)),
        ];
        state.inspect(&table, t0);

        let reports = state.inspect(&table, t0 + Duration::from_secs(45));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].slot, 1);
    }

    #[test]
    fn removed_slots_are_forgotten() {
        let t0 = SystemTime::now();
        let mut state = MonitorState::new(THRESHOLD);
        state.inspect(&[(0, snapshot(ProcessState::Busy, 1, t0))], t0);
        state.inspect(&[], t0);

        // Reappearing slot is treated as new: primes again instead of reporting
        let reports = state.inspect(
            &[(0, snapshot(ProcessState::Busy, 1, t0))],
            t0 + Duration::from_secs(100),
        );
        assert!(reports.is_empty());
    }
}
