use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::database::autoscaler::ScalingEvent;
use crate::database::pool::PoolStatus;
use crate::models::SearchStrategy;

/// Subscription surface for pool and request lifecycle notifications.
///
/// Components accept listeners at construction; there is no global event bus.
/// Implementations must be cheap and non-blocking — they run inline on the
/// notifying task.
pub trait PoolEventListener: Send + Sync {
    fn on_pool_scaled(&self, event: &ScalingEvent);

    fn on_slow_request(&self, request_id: Uuid, strategy: SearchStrategy, elapsed: Duration);

    fn on_high_utilization(&self, utilization: f64, status: &PoolStatus);
}

/// Default listener: structured log lines, nothing else.
pub struct TracingEventListener;

impl PoolEventListener for TracingEventListener {
    fn on_pool_scaled(&self, event: &ScalingEvent) {
        info!(
            action = event.action.as_str(),
            reason = event.reason.as_str(),
            old_max = event.old_max,
            new_max = event.new_max,
            "Pool scaled"
        );
    }

    fn on_slow_request(&self, request_id: Uuid, strategy: SearchStrategy, elapsed: Duration) {
        warn!(
            %request_id,
            strategy = strategy.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow search request"
        );
    }

    fn on_high_utilization(&self, utilization: f64, status: &PoolStatus) {
        warn!(
            utilization = format!("{:.2}", utilization),
            total = status.total,
            current_max = status.current_max,
            waiting = status.waiting,
            "Pool utilization above scale-up threshold"
        );
    }
}
