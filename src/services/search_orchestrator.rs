use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigHandle, SearchSettings};
use crate::database::health::{HealthEvaluator, HealthStatus};
use crate::database::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::database::pool::{PoolController, PooledSession};
use crate::database::session::SqlQuery;
use crate::database::vector_search::{build_simplified_query, build_vector_query, rank_rows};
use crate::error::AppError;
use crate::models::{
    PropertyHit, SearchMetadata, SearchRequest, SearchResult, SearchStrategy,
};
use crate::services::embedding_client::EmbeddingClient;
use crate::services::events::PoolEventListener;
use crate::services::result_cache::{CachedSearch, ResultCache};
use crate::services::text_search_client::{TextHit, TextSearchClient};

/// Subtracted from the request deadline for hybrid upstream calls, leaving
/// room to merge and respond.
const HYBRID_SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Backoff before the single pool-exhaustion retry.
const POOL_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Utilization above which query plans carry index hints.
const HINT_UTILIZATION: f64 = 0.6;

/// Utilization above which the orchestrator serves from cache or degrades to
/// the simplified plan.
const PRESSURE_UTILIZATION: f64 = 0.8;

const HYBRID_AVG_QUERY_MS: f64 = 100.0;
const TEXT_AVG_QUERY_MS: f64 = 500.0;

const TEXT_WEIGHT: f64 = 0.6;
const VECTOR_WEIGHT: f64 = 0.4;

/// Everything strategy selection looks at, captured in one snapshot at
/// request entry. Selection is a pure function of these inputs.
#[derive(Debug, Clone, Copy)]
pub struct StrategyInputs {
    pub utilization: f64,
    pub avg_query_time_ms: f64,
    pub healthy: bool,
    pub cache_hit: bool,
    pub embedding_ok: bool,
}

/// Pick the execution strategy for one request.
pub fn select_strategy(inputs: &StrategyInputs) -> SearchStrategy {
    if inputs.utilization > PRESSURE_UTILIZATION {
        return if inputs.cache_hit {
            SearchStrategy::Cached
        } else {
            SearchStrategy::Simplified
        };
    }
    if inputs.healthy && inputs.avg_query_time_ms < HYBRID_AVG_QUERY_MS && inputs.embedding_ok {
        return SearchStrategy::Hybrid;
    }
    if inputs.healthy && inputs.avg_query_time_ms < TEXT_AVG_QUERY_MS {
        return SearchStrategy::Text;
    }
    if inputs.healthy && inputs.embedding_ok {
        return SearchStrategy::Vector;
    }
    SearchStrategy::Fallback
}

/// Merge concurrent text and vector results.
///
/// Text hits score `1 − rank/|text_hits|`; vector hits score `1 − distance`.
/// Items in both sources combine as `0.6·text + 0.4·vector`; vector-only hits
/// carry `0.4·vector`. A text-only hit keeps its raw score when it led the
/// text ranking and is down-weighted by 0.6 otherwise, so a perfect keyword
/// match is never displaced by a partial vector match. Ties keep text order.
pub fn merge_hybrid(
    text_hits: &[PropertyHit],
    vector_hits: &[PropertyHit],
    limit: usize,
) -> Vec<PropertyHit> {
    let text_n = text_hits.len();

    struct Merged {
        hit: PropertyHit,
        text_score: Option<f64>,
        text_rank: usize,
        vector_score: Option<f64>,
    }

    let mut order: Vec<Uuid> = Vec::new();
    let mut merged: HashMap<Uuid, Merged> = HashMap::new();

    for (rank, hit) in text_hits.iter().enumerate() {
        let id = hit.property.id;
        order.push(id);
        merged.insert(
            id,
            Merged {
                hit: hit.clone(),
                text_score: Some(1.0 - rank as f64 / text_n as f64),
                text_rank: rank,
                vector_score: None,
            },
        );
    }

    for hit in vector_hits {
        let id = hit.property.id;
        let score = hit.similarity.unwrap_or(0.0);
        match merged.get_mut(&id) {
            Some(entry) => {
                // Prefer the database row: it carries the full column set.
                entry.hit = hit.clone();
                entry.vector_score = Some(score);
            }
            None => {
                order.push(id);
                merged.insert(
                    id,
                    Merged {
                        hit: hit.clone(),
                        text_score: None,
                        text_rank: usize::MAX,
                        vector_score: Some(score),
                    },
                );
            }
        }
    }

    let mut scored: Vec<(f64, PropertyHit)> = order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .map(|entry| {
            let combined = match (entry.text_score, entry.vector_score) {
                (Some(t), Some(v)) => TEXT_WEIGHT * t + VECTOR_WEIGHT * v,
                (Some(t), None) if entry.text_rank == 0 => t,
                (Some(t), None) => TEXT_WEIGHT * t,
                (None, Some(v)) => VECTOR_WEIGHT * v,
                (None, None) => 0.0,
            };
            let mut hit = entry.hit;
            hit.relevance = Some(combined);
            if entry.vector_score.is_some() {
                hit.similarity = entry.vector_score;
            }
            (combined, hit)
        })
        .collect();

    // Stable sort: equal scores keep source order.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, hit)| hit).collect()
}

fn text_hit_to_property(hit: &TextHit) -> PropertyHit {
    use chrono::Utc;
    PropertyHit {
        property: crate::models::Property {
            id: hit.id,
            title: hit.title.clone(),
            description: hit.description.clone(),
            price: hit.price,
            location: hit.location.clone(),
            property_type: hit.property_type.clone(),
            bedrooms: hit.bedrooms,
            bathrooms: hit.bathrooms,
            size_sqft: 0.0,
            features: Vec::new(),
            images: Vec::new(),
            listed_at: Utc::now(),
            updated_at: Utc::now(),
        },
        similarity: None,
        relevance: None,
    }
}

/// Routes each request through one strategy, with fallbacks, deadlines and
/// per-request instrumentation. Holds sessions only through scoped leases.
pub struct SearchOrchestrator {
    pool: Arc<PoolController>,
    metrics: Arc<MetricsAggregator>,
    health: Arc<HealthEvaluator>,
    embedding: Arc<EmbeddingClient>,
    text: Arc<TextSearchClient>,
    cache: Arc<ResultCache>,
    config: Arc<ConfigHandle>,
    settings: SearchSettings,
    listeners: Vec<Arc<dyn PoolEventListener>>,
}

impl SearchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<PoolController>,
        metrics: Arc<MetricsAggregator>,
        health: Arc<HealthEvaluator>,
        embedding: Arc<EmbeddingClient>,
        text: Arc<TextSearchClient>,
        cache: Arc<ResultCache>,
        config: Arc<ConfigHandle>,
        settings: SearchSettings,
        listeners: Vec<Arc<dyn PoolEventListener>>,
    ) -> Self {
        Self {
            pool,
            metrics,
            health,
            embedding,
            text,
            cache,
            config,
            settings,
            listeners,
        }
    }

    /// Serve one search request end to end.
    pub async fn search(
        &self,
        request_id: Uuid,
        req: SearchRequest,
    ) -> Result<SearchResult, AppError> {
        let started = Instant::now();
        req.validate()?;

        let deadline = started
            + Duration::from_millis(req.deadline_ms.unwrap_or(self.settings.default_deadline_ms));
        let fingerprint = req.fingerprint();

        // One snapshot at entry drives every decision for this request.
        let config = self.config.load();
        let status = self.pool.status();
        let snapshot = self.metrics.snapshot(&status, &config.autoscale.peak_hours);
        let probe_ok = self.pool.probe_ok();
        let report = self.health.evaluate(&snapshot, &status, probe_ok, None);

        let cached_entry = self.cache.get(&fingerprint).await;
        let embedding_ok = req.embedding.is_some()
            || (req.query_text.is_some() && self.embedding.is_available());

        let inputs = StrategyInputs {
            utilization: snapshot.utilization,
            avg_query_time_ms: snapshot.avg_query_time_ms,
            healthy: report.status == HealthStatus::Healthy,
            cache_hit: cached_entry.is_some(),
            embedding_ok,
        };
        let strategy = select_strategy(&inputs);
        debug!(
            %request_id,
            strategy = strategy.as_str(),
            utilization = format!("{:.2}", snapshot.utilization),
            avg_query_ms = format!("{:.0}", snapshot.avg_query_time_ms),
            "Strategy selected"
        );

        let outcome = self
            .execute(strategy, &req, &snapshot, cached_entry, deadline, &fingerprint)
            .await;

        let elapsed = started.elapsed();
        match outcome {
            Ok(mut result) => {
                result.elapsed_ms = elapsed.as_millis() as u64;
                result.metadata.pool_utilization = snapshot.utilization;

                if elapsed >= Duration::from_millis(self.settings.slow_request_threshold_ms) {
                    for listener in &self.listeners {
                        listener.on_slow_request(request_id, result.strategy_used, elapsed);
                    }
                }

                if matches!(
                    result.strategy_used,
                    SearchStrategy::Hybrid
                        | SearchStrategy::Text
                        | SearchStrategy::Vector
                        | SearchStrategy::Optimized
                ) && !result.items.is_empty()
                {
                    self.cache.insert(fingerprint, result.clone()).await;
                }

                Ok(result)
            }
            Err(e) => {
                warn!(%request_id, error = %e, strategy = strategy.as_str(), "Search failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        strategy: SearchStrategy,
        req: &SearchRequest,
        snapshot: &MetricsSnapshot,
        cached_entry: Option<Arc<CachedSearch>>,
        deadline: Instant,
        fingerprint: &str,
    ) -> Result<SearchResult, AppError> {
        match strategy {
            SearchStrategy::Cached => match cached_entry {
                Some(entry) => Ok(Self::from_cache(&entry, SearchStrategy::Cached)),
                // The entry expired between selection and execution.
                None => self.exec_fallback(fingerprint).await,
            },
            SearchStrategy::Simplified => self.exec_simplified(req, deadline).await,
            SearchStrategy::Hybrid => self.exec_hybrid(req, snapshot, deadline, fingerprint).await,
            SearchStrategy::Text => match self.exec_text(req).await {
                Ok(result) => Ok(result),
                Err(AppError::UpstreamUnavailable(_)) | Err(AppError::Timeout(_)) => {
                    self.exec_fallback(fingerprint).await
                }
                Err(e) => Err(e),
            },
            SearchStrategy::Vector => match self.exec_vector(req, snapshot, deadline).await {
                Ok(result) => Ok(result),
                Err(AppError::UpstreamUnavailable(_)) => self.exec_fallback(fingerprint).await,
                Err(e) => Err(e),
            },
            SearchStrategy::Fallback | SearchStrategy::Optimized => {
                self.exec_fallback(fingerprint).await
            }
        }
    }

    fn from_cache(entry: &CachedSearch, strategy: SearchStrategy) -> SearchResult {
        let mut result = entry.result.clone();
        result.strategy_used = strategy;
        result.metadata.cache_hit = true;
        result
    }

    /// Acquire with the §7 pool-exhaustion contract: one retry after a short
    /// backoff, then `PoolExhausted`.
    async fn acquire_for_query(&self, deadline: Instant) -> Result<PooledSession, AppError> {
        match self.pool.acquire(deadline).await {
            Ok(session) => Ok(session),
            Err(AppError::Timeout(first)) => {
                sleep(POOL_RETRY_BACKOFF).await;
                match self.pool.acquire(deadline).await {
                    Ok(session) => Ok(session),
                    Err(AppError::Timeout(_)) => Err(AppError::PoolExhausted(first)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Run a built query on a fresh lease, recording the observation.
    async fn run_query(
        &self,
        query: &SqlQuery,
        deadline: Instant,
    ) -> Result<Vec<crate::database::session::FetchedRow>, AppError> {
        let mut session = self.acquire_for_query(deadline).await?;

        let started = std::time::Instant::now();
        let outcome = timeout_at(deadline, session.fetch_properties(query)).await;
        let finished = std::time::Instant::now();

        match outcome {
            Ok(Ok(rows)) => {
                self.metrics.record_query(started, finished, true);
                Ok(rows)
            }
            Ok(Err(e)) => {
                self.metrics.record_query(started, finished, false);
                Err(e)
            }
            Err(_) => {
                self.metrics.record_query(started, finished, false);
                Err(AppError::Timeout("query exceeded the request deadline".into()))
            }
        }
    }

    async fn resolve_embedding(&self, req: &SearchRequest) -> Result<Vec<f32>, AppError> {
        if let Some(embedding) = &req.embedding {
            return Ok(embedding.clone());
        }
        match &req.query_text {
            Some(text) => self.embedding.embed_one(text).await,
            None => Err(AppError::UpstreamUnavailable(
                "no query text to vectorize".into(),
            )),
        }
    }

    async fn exec_vector(
        &self,
        req: &SearchRequest,
        snapshot: &MetricsSnapshot,
        deadline: Instant,
    ) -> Result<SearchResult, AppError> {
        let embedding = self.resolve_embedding(req).await?;
        let with_hints = snapshot.utilization > HINT_UTILIZATION;
        let query = build_vector_query(
            &embedding,
            req,
            self.settings.similarity_threshold,
            with_hints,
        );

        let rows = self.run_query(&query, deadline).await?;
        let items = rank_rows(rows);

        let strategy = if with_hints {
            SearchStrategy::Optimized
        } else {
            SearchStrategy::Vector
        };
        let mut optimizations = Vec::new();
        if with_hints {
            optimizations.push("index_hints".to_string());
        }

        Ok(SearchResult {
            total: items.len() as u64,
            metadata: SearchMetadata {
                vector_results: items.len(),
                indexes_hinted: query.hints,
                optimizations,
                ..Default::default()
            },
            items,
            strategy_used: strategy,
            elapsed_ms: 0,
        })
    }

    async fn exec_text(&self, req: &SearchRequest) -> Result<SearchResult, AppError> {
        let response = self.text.search(req).await?;
        let n = response.hits.len();

        let items: Vec<PropertyHit> = response
            .hits
            .iter()
            .enumerate()
            .map(|(rank, hit)| {
                let mut item = text_hit_to_property(hit);
                item.relevance = Some(1.0 - rank as f64 / n.max(1) as f64);
                item
            })
            .collect();

        Ok(SearchResult {
            total: response.estimated_total,
            metadata: SearchMetadata {
                text_results: n,
                ..Default::default()
            },
            items,
            strategy_used: SearchStrategy::Text,
            elapsed_ms: 0,
        })
    }

    async fn exec_hybrid(
        &self,
        req: &SearchRequest,
        snapshot: &MetricsSnapshot,
        deadline: Instant,
        fingerprint: &str,
    ) -> Result<SearchResult, AppError> {
        let shared_deadline = deadline
            .checked_sub(HYBRID_SAFETY_MARGIN)
            .unwrap_or_else(Instant::now);

        let with_hints = snapshot.utilization > HINT_UTILIZATION;

        let text_fut = async {
            match timeout_at(shared_deadline, self.text.search(req)).await {
                Ok(Ok(response)) => Some(response),
                Ok(Err(e)) => {
                    debug!(error = %e, "Hybrid text side failed");
                    None
                }
                Err(_) => {
                    debug!("Hybrid text side exceeded the shared deadline");
                    None
                }
            }
        };

        let vector_fut = async {
            let embedding = match self.resolve_embedding(req).await {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "Hybrid vector side has no embedding");
                    return None;
                }
            };
            let query = build_vector_query(
                &embedding,
                req,
                self.settings.similarity_threshold,
                with_hints,
            );
            match self.run_query(&query, shared_deadline).await {
                Ok(rows) => Some((rank_rows(rows), query.hints)),
                Err(e) => {
                    debug!(error = %e, "Hybrid vector side failed");
                    None
                }
            }
        };

        let (text_response, vector_outcome) = tokio::join!(text_fut, vector_fut);

        if text_response.is_none() && vector_outcome.is_none() {
            info!("Both hybrid sides failed, downgrading to fallback");
            return self.exec_fallback(fingerprint).await;
        }

        let text_hits: Vec<PropertyHit> = text_response
            .as_ref()
            .map(|r| r.hits.iter().map(text_hit_to_property).collect())
            .unwrap_or_default();
        let (vector_hits, hints) = vector_outcome.unwrap_or_default();

        let text_results = text_hits.len();
        let vector_results = vector_hits.len();
        let items = merge_hybrid(&text_hits, &vector_hits, req.limit as usize);

        let mut optimizations = Vec::new();
        if with_hints {
            optimizations.push("index_hints".to_string());
        }

        Ok(SearchResult {
            total: items.len() as u64,
            metadata: SearchMetadata {
                text_results,
                vector_results,
                indexes_hinted: hints,
                optimizations,
                ..Default::default()
            },
            items,
            strategy_used: SearchStrategy::Hybrid,
            elapsed_ms: 0,
        })
    }

    async fn exec_simplified(
        &self,
        req: &SearchRequest,
        deadline: Instant,
    ) -> Result<SearchResult, AppError> {
        let query = build_simplified_query(req);
        let rows = self.run_query(&query, deadline).await?;

        let items: Vec<PropertyHit> = rows
            .into_iter()
            .map(|row| PropertyHit {
                property: row.property,
                similarity: None,
                relevance: None,
            })
            .collect();

        Ok(SearchResult {
            total: items.len() as u64,
            metadata: SearchMetadata {
                optimizations: vec!["minimal_columns".to_string(), "no_joins".to_string()],
                ..Default::default()
            },
            items,
            strategy_used: SearchStrategy::Simplified,
            elapsed_ms: 0,
        })
    }

    /// Last resort: a cached result if one exists, an empty result otherwise.
    /// Never fails.
    async fn exec_fallback(&self, fingerprint: &str) -> Result<SearchResult, AppError> {
        if let Some(entry) = self.cache.get(fingerprint).await {
            return Ok(Self::from_cache(&entry, SearchStrategy::Fallback));
        }
        Ok(SearchResult::empty(SearchStrategy::Fallback))
    }
}
