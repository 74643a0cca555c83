use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tracing::{debug, info};

use crate::models::SearchResult;

/// Interval of the maintenance sweep that evicts expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A cached search outcome with its storage timestamp, so responses can
/// report entry age.
#[derive(Debug, Clone)]
pub struct CachedSearch {
    pub result: SearchResult,
    pub stored_at: DateTime<Utc>,
}

/// Bounded TTL map from request fingerprint to a prior search result.
///
/// Entries expire after `ttl` and are never visible past expiry; the backing
/// cache evicts least-recently-used entries when capacity is exceeded, and a
/// periodic sweep drives eviction of expired entries between reads. Values are
/// inserted whole behind an `Arc`, so readers can never observe a partially
/// constructed entry.
pub struct ResultCache {
    cache: Cache<String, Arc<CachedSearch>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        info!(ttl_secs = ttl.as_secs(), capacity, "Result cache initialized");
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, fingerprint: &str) -> Option<Arc<CachedSearch>> {
        self.cache.get(fingerprint).await
    }

    pub async fn insert(&self, fingerprint: String, result: SearchResult) {
        let entry = CachedSearch {
            result,
            stored_at: Utc::now(),
        };
        self.cache.insert(fingerprint, Arc::new(entry)).await;
    }

    pub async fn invalidate(&self, fingerprint: &str) {
        self.cache.invalidate(fingerprint).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run the periodic expiry sweep until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.cache.run_pending_tasks().await;
                debug!(entries = cache.entry_count(), "Result cache sweep completed");
            }
        })
    }
}
