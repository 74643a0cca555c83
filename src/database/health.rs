use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::database::autoscaler::ScalingEvent;
use crate::database::metrics::MetricsSnapshot;
use crate::database::pool::{PoolState, PoolStatus};

/// Snapshots remembered for the consecutive-waiters rule.
const WAITING_STREAK_WINDOW: usize = 4;

const ERROR_RATE_CRITICAL: f64 = 0.05;
const UTILIZATION_DEGRADED: f64 = 0.85;
const P95_DEGRADED_MS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Derived health view. Never stored; recomputed from the inputs on demand.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pool_sub_status: String,
    pub scaling_sub_status: String,
    pub last_scaling_event: Option<ScalingEvent>,
    pub recommendations: Vec<&'static str>,
}

/// Maps metrics and probe results onto the tri-state health status.
///
/// [`HealthEvaluator::evaluate`] is a side-effect-free projection, safe to
/// call from every request and from the health endpoint without skewing
/// state. The consecutive-waiters rule reads a small fixed buffer of waiter
/// counts that [`HealthEvaluator::observe_waiters`] advances from one
/// periodic tick, so the streak tracks a steady time series rather than
/// request arrival order.
pub struct HealthEvaluator {
    recent_waiting: Mutex<VecDeque<u32>>,
}

impl HealthEvaluator {
    pub fn new() -> Self {
        Self {
            recent_waiting: Mutex::new(VecDeque::with_capacity(WAITING_STREAK_WINDOW)),
        }
    }

    /// Record one periodic waiter-count observation. Called on the probe
    /// tick; never from request handling.
    pub fn observe_waiters(&self, waiting: u32) {
        let mut recent = self.recent_waiting.lock().expect("health lock poisoned");
        if recent.len() == WAITING_STREAK_WINDOW {
            recent.pop_front();
        }
        recent.push_back(waiting);
    }

    fn waiting_streak(&self) -> usize {
        let recent = self.recent_waiting.lock().expect("health lock poisoned");
        recent.iter().rev().take_while(|w| **w > 0).count()
    }

    pub fn evaluate(
        &self,
        snapshot: &MetricsSnapshot,
        status: &PoolStatus,
        probe_ok: bool,
        last_scaling_event: Option<ScalingEvent>,
    ) -> HealthReport {
        let waiting_streak = self.waiting_streak();

        let mut recommendations = Vec::new();
        let mut health = HealthStatus::Healthy;

        if !probe_ok {
            health = HealthStatus::Critical;
            recommendations.push("database_probe_failing");
        }
        if snapshot.error_rate > ERROR_RATE_CRITICAL {
            health = HealthStatus::Critical;
            recommendations.push("high_error_rate");
        }

        if health != HealthStatus::Critical {
            if snapshot.utilization > UTILIZATION_DEGRADED {
                health = HealthStatus::Degraded;
                recommendations.push("high_pool_utilization");
                recommendations.push("increase_pool_size");
            }
            if snapshot.p95_query_time_ms > P95_DEGRADED_MS {
                health = HealthStatus::Degraded;
                recommendations.push("review_slow_queries");
            }
            if waiting_streak >= 2 {
                health = HealthStatus::Degraded;
                if !recommendations.contains(&"increase_pool_size") {
                    recommendations.push("increase_pool_size");
                }
            }
        }

        let pool_sub_status = match status.state {
            PoolState::Initializing => "initializing".to_string(),
            PoolState::Ready => format!(
                "ready ({}/{} sessions, {} idle)",
                status.total, status.current_max, status.idle
            ),
            PoolState::Degraded => "degraded (probe failures)".to_string(),
            PoolState::Closing => "closing".to_string(),
            PoolState::Closed => "closed".to_string(),
        };

        let scaling_sub_status = match &last_scaling_event {
            Some(event) => format!(
                "last {} to {} ({})",
                event.action.as_str(),
                event.new_max,
                event.reason.as_str()
            ),
            None => "no scaling activity".to_string(),
        };

        HealthReport {
            status: health,
            pool_sub_status,
            scaling_sub_status,
            last_scaling_event,
            recommendations,
        }
    }
}

impl Default for HealthEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
