pub mod autoscaler;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod vector_search;

pub use autoscaler::{Autoscaler, ScaleAction, ScaleReason, ScalingEvent};
pub use health::{HealthEvaluator, HealthReport, HealthStatus};
pub use metrics::{MetricsAggregator, MetricsSnapshot, PoolDelta};
pub use pool::{PoolController, PoolState, PoolStatus, PooledSession};
pub use session::{PgSessionBackend, QueryParam, Session, SessionBackend, SqlQuery};
