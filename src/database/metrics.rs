use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::database::pool::PoolStatus;

/// Queries kept in the rolling latency window.
const QUERY_WINDOW: usize = 512;
/// Snapshots retained in the history ring.
const HISTORY_CAPACITY: usize = 1024;
/// Non-query errors older than this no longer count toward the error rate.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Pool lifecycle events published by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDelta {
    SessionOpened,
    SessionClosed,
    AcquireWaited,
    AcquireTimedOut,
}

#[derive(Debug, Clone, Copy)]
struct QuerySample {
    duration_ms: f64,
    ok: bool,
}

/// An immutable point-in-time view of pool and query health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// `total / current_max`; 0 when the pool has no capacity.
    pub utilization: f64,
    pub avg_query_time_ms: f64,
    pub p95_query_time_ms: f64,
    pub error_rate: f64,
    pub active: u32,
    pub waiting: u32,
    pub hour_of_day: u8,
    pub is_peak_hour: bool,
}

/// Rolling aggregation of query outcomes, connection errors and pool deltas.
///
/// Writers are cheap; readers take immutable snapshots. Observers may miss the
/// last few microseconds of writes, which is permitted: anything recorded
/// before a snapshot is visible in that snapshot or a later one.
pub struct MetricsAggregator {
    queries: Mutex<VecDeque<QuerySample>>,
    errors: Mutex<VecDeque<Instant>>,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    queries_total: AtomicU64,
    errors_total: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(VecDeque::with_capacity(QUERY_WINDOW)),
            errors: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            queries_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    pub fn record_query(&self, start: Instant, end: Instant, ok: bool) {
        let duration_ms = end.saturating_duration_since(start).as_secs_f64() * 1000.0;
        let mut queries = self.queries.lock().expect("metrics lock poisoned");
        if queries.len() == QUERY_WINDOW {
            queries.pop_front();
        }
        queries.push_back(QuerySample { duration_ms, ok });
        drop(queries);

        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a non-query failure (connect failures, probe failures).
    pub fn record_error(&self, _kind: &str) {
        let now = Instant::now();
        let mut errors = self.errors.lock().expect("metrics lock poisoned");
        Self::prune_errors(&mut errors, now);
        errors.push_back(now);
        drop(errors);

        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_delta(&self, delta: PoolDelta) {
        match delta {
            PoolDelta::SessionOpened => {
                self.sessions_opened.fetch_add(1, Ordering::Relaxed);
            }
            PoolDelta::SessionClosed => {
                self.sessions_closed.fetch_add(1, Ordering::Relaxed);
            }
            PoolDelta::AcquireWaited => {}
            PoolDelta::AcquireTimedOut => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn prune_errors(errors: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = errors.front() {
            if now.duration_since(*front) > ERROR_WINDOW {
                errors.pop_front();
            } else {
                break;
            }
        }
    }

    /// Compute a snapshot against the given pool status and append it to the
    /// history ring.
    pub fn snapshot(&self, status: &PoolStatus, peak_hours: &BTreeSet<u8>) -> MetricsSnapshot {
        let now = Utc::now();
        let hour_of_day = now.hour() as u8;
        let snapshot = self.snapshot_at(status, peak_hours, now.into(), hour_of_day);

        let mut history = self.history.lock().expect("metrics lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(snapshot.clone());

        snapshot
    }

    /// Snapshot computation with an explicit clock, shared by `snapshot` and
    /// the autoscaler tests.
    pub fn snapshot_at(
        &self,
        status: &PoolStatus,
        peak_hours: &BTreeSet<u8>,
        timestamp: DateTime<Utc>,
        hour_of_day: u8,
    ) -> MetricsSnapshot {
        let (avg, p95, failed, window_len) = {
            let queries = self.queries.lock().expect("metrics lock poisoned");
            let window_len = queries.len();
            if window_len == 0 {
                (0.0, 0.0, 0usize, 0usize)
            } else {
                let sum: f64 = queries.iter().map(|s| s.duration_ms).sum();
                let failed = queries.iter().filter(|s| !s.ok).count();
                let mut sorted: Vec<f64> = queries.iter().map(|s| s.duration_ms).collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let p95_idx = ((window_len as f64 * 0.95).ceil() as usize).saturating_sub(1);
                (sum / window_len as f64, sorted[p95_idx], failed, window_len)
            }
        };

        let recent_errors = {
            let mut errors = self.errors.lock().expect("metrics lock poisoned");
            Self::prune_errors(&mut errors, Instant::now());
            errors.len()
        };

        let observations = window_len + recent_errors;
        let error_rate = if observations == 0 {
            0.0
        } else {
            (failed + recent_errors) as f64 / observations as f64
        };

        let utilization = if status.current_max == 0 {
            0.0
        } else {
            status.total as f64 / status.current_max as f64
        };

        MetricsSnapshot {
            timestamp,
            utilization,
            avg_query_time_ms: avg,
            p95_query_time_ms: p95,
            error_rate,
            active: status.total.saturating_sub(status.idle),
            waiting: status.waiting,
            hour_of_day,
            is_peak_hour: peak_hours.contains(&hour_of_day),
        }
    }

    /// Last `k` snapshots, oldest first.
    pub fn history(&self, k: usize) -> Vec<MetricsSnapshot> {
        let history = self.history.lock().expect("metrics lock poisoned");
        let take = k.min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
