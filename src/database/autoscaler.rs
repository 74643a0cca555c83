use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{AutoscalePolicy, ConfigHandle};
use crate::database::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::database::pool::{PoolController, PoolStatus};
use crate::error::AppError;
use crate::services::events::PoolEventListener;

/// Scaling events retained for the admin surface.
const HISTORY_CAPACITY: usize = 100;

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    Up,
    Down,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::Up => "up",
            ScaleAction::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    HighUtilization,
    LowUtilization,
    PeakHour,
    OffPeakHour,
    Manual,
    ResizeFailed,
}

impl ScaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleReason::HighUtilization => "high_utilization",
            ScaleReason::LowUtilization => "low_utilization",
            ScaleReason::PeakHour => "peak_hour",
            ScaleReason::OffPeakHour => "off_peak_hour",
            ScaleReason::Manual => "manual",
            ScaleReason::ResizeFailed => "resize_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub action: ScaleAction,
    pub reason: ScaleReason,
    pub old_max: u32,
    pub new_max: u32,
    pub metrics_snapshot: MetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscalerState {
    Idle,
    Evaluating,
    Applying,
    CoolingDown,
}

/// A resize the policy wants to make, before it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleCandidate {
    pub action: ScaleAction,
    pub reason: ScaleReason,
    pub target: u32,
}

/// Decide what the pool cap should become, if anything.
///
/// Explicit time-of-day rules take precedence over utilization rules when both
/// fire. The cooldown drops a candidate before clamping; a candidate that
/// clamps back to the current cap is dropped as well.
pub fn plan(
    snapshot: &MetricsSnapshot,
    status: &PoolStatus,
    policy: &AutoscalePolicy,
    now_hour: u8,
    elapsed_since_resize: Option<Duration>,
) -> Option<ScaleCandidate> {
    if !policy.enabled {
        return None;
    }

    let candidate = if policy.peak_hours.contains(&now_hour) && status.current_max < policy.max_sessions
    {
        Some((
            ScaleAction::Up,
            ScaleReason::PeakHour,
            status.current_max.saturating_add(policy.scale_up_step),
        ))
    } else if policy.off_peak_hours.contains(&now_hour) && status.current_max > policy.min_sessions {
        Some((
            ScaleAction::Down,
            ScaleReason::OffPeakHour,
            status.current_max.saturating_sub(policy.scale_down_step),
        ))
    } else if snapshot.utilization >= policy.scale_up_threshold {
        Some((
            ScaleAction::Up,
            ScaleReason::HighUtilization,
            status.current_max.saturating_add(policy.scale_up_step),
        ))
    } else if snapshot.utilization <= policy.scale_down_threshold && status.waiting == 0 {
        Some((
            ScaleAction::Down,
            ScaleReason::LowUtilization,
            status.current_max.saturating_sub(policy.scale_down_step),
        ))
    } else {
        None
    };

    let (action, reason, target) = candidate?;

    if let Some(elapsed) = elapsed_since_resize {
        if elapsed < policy.cooldown() {
            return None;
        }
    }

    let target = policy.clamp_sessions(target);
    if target == status.current_max {
        return None;
    }

    Some(ScaleCandidate { action, reason, target })
}

/// Periodic control loop that owns all policy-driven resizes. Manual resizes
/// go through the same serialized apply path.
pub struct Autoscaler {
    pool: Arc<PoolController>,
    metrics: Arc<MetricsAggregator>,
    config: Arc<ConfigHandle>,
    listeners: Vec<Arc<dyn PoolEventListener>>,
    history: Mutex<VecDeque<ScalingEvent>>,
    state: Mutex<AutoscalerState>,
    resize_serial: tokio::sync::Mutex<()>,
    running: AtomicBool,
    tick: Duration,
}

impl Autoscaler {
    pub fn new(
        pool: Arc<PoolController>,
        metrics: Arc<MetricsAggregator>,
        config: Arc<ConfigHandle>,
        listeners: Vec<Arc<dyn PoolEventListener>>,
    ) -> Self {
        Self {
            pool,
            metrics,
            config,
            listeners,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            state: Mutex::new(AutoscalerState::Idle),
            resize_serial: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the control loop until [`Autoscaler::stop`] is called. An in-flight
    /// resize completes before the loop exits.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(tick_secs = self.tick.as_secs(), "Autoscaler loop started");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so the pool has a
        // tick's worth of traffic before the first evaluation.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.evaluate_once().await;
        }

        info!("Autoscaler loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> AutoscalerState {
        *self.state.lock().expect("autoscaler lock poisoned")
    }

    fn set_state(&self, state: AutoscalerState) {
        *self.state.lock().expect("autoscaler lock poisoned") = state;
    }

    /// One evaluation pass: snapshot, plan, apply, record.
    pub async fn evaluate_once(&self) {
        self.set_state(AutoscalerState::Evaluating);

        let config = self.config.load();
        let policy = &config.autoscale;
        let status = self.pool.status();
        let snapshot = self.metrics.snapshot(&status, &policy.peak_hours);

        if snapshot.utilization >= policy.scale_up_threshold {
            for listener in &self.listeners {
                listener.on_high_utilization(snapshot.utilization, &status);
            }
        }

        let now_hour = Utc::now().hour() as u8;
        let elapsed = status.last_resize_at.map(|at| at.elapsed());

        match plan(&snapshot, &status, policy, now_hour, elapsed) {
            Some(candidate) => {
                self.set_state(AutoscalerState::Applying);
                self.apply(candidate, &status, snapshot).await;
                self.set_state(AutoscalerState::CoolingDown);
                self.set_state(AutoscalerState::Idle);
            }
            None => {
                debug!(
                    utilization = format!("{:.2}", snapshot.utilization),
                    current_max = status.current_max,
                    "No scaling action"
                );
                self.set_state(AutoscalerState::Idle);
            }
        }
    }

    async fn apply(&self, candidate: ScaleCandidate, status: &PoolStatus, snapshot: MetricsSnapshot) {
        let _serial = self.resize_serial.lock().await;

        match self.pool.resize(candidate.target) {
            Ok(applied) => {
                let event = ScalingEvent {
                    action: candidate.action,
                    reason: candidate.reason,
                    old_max: status.current_max,
                    new_max: applied,
                    metrics_snapshot: snapshot,
                    timestamp: Utc::now(),
                };
                info!(
                    action = event.action.as_str(),
                    reason = event.reason.as_str(),
                    old_max = event.old_max,
                    new_max = event.new_max,
                    "Applied pool resize"
                );
                self.record(event);
            }
            Err(e) => {
                // The failure is recorded but never corrupts state; the next
                // tick re-evaluates from scratch.
                warn!(error = %e, target = candidate.target, "Pool resize failed");
                let event = ScalingEvent {
                    action: candidate.action,
                    reason: ScaleReason::ResizeFailed,
                    old_max: status.current_max,
                    new_max: status.current_max,
                    metrics_snapshot: snapshot,
                    timestamp: Utc::now(),
                };
                self.record(event);
            }
        }
    }

    /// Administrative resize. Shares the serialized apply path with the policy
    /// loop and records a `manual` scaling event; the cooldown does not apply.
    pub async fn manual_resize(&self, new_max: u32) -> Result<ScalingEvent, AppError> {
        let _serial = self.resize_serial.lock().await;

        let config = self.config.load();
        let status = self.pool.status();
        let snapshot = self.metrics.snapshot(&status, &config.autoscale.peak_hours);

        let applied = self.pool.resize(new_max)?;
        let event = ScalingEvent {
            action: if applied >= status.current_max {
                ScaleAction::Up
            } else {
                ScaleAction::Down
            },
            reason: ScaleReason::Manual,
            old_max: status.current_max,
            new_max: applied,
            metrics_snapshot: snapshot,
            timestamp: Utc::now(),
        };
        info!(old_max = event.old_max, new_max = event.new_max, "Manual pool resize");
        self.record(event.clone());
        Ok(event)
    }

    fn record(&self, event: ScalingEvent) {
        for listener in &self.listeners {
            listener.on_pool_scaled(&event);
        }
        let mut history = self.history.lock().expect("autoscaler lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Last `k` scaling events, oldest first.
    pub fn history(&self, k: usize) -> Vec<ScalingEvent> {
        let history = self.history.lock().expect("autoscaler lock poisoned");
        let take = k.min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    pub fn last_event(&self) -> Option<ScalingEvent> {
        self.history
            .lock()
            .expect("autoscaler lock poisoned")
            .back()
            .cloned()
    }
}
