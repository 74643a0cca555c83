use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::EmbeddingSettings;
use crate::error::AppError;

/// Inputs per chunk in batch mode.
const BATCH_CHUNK_SIZE: usize = 50;

/// Consecutive all-endpoint failures after which the client reports itself
/// unavailable to strategy selection.
const UNAVAILABLE_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Failover-capable client for the remote vectorization service.
///
/// Endpoints are tried in order starting from a persistent round-robin index,
/// each with its own timeout and linear `1s * k` backoff between attempts.
/// Successful results are cached by input fingerprint.
pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    model: Option<String>,
    timeout: Duration,
    retries: u32,
    current_endpoint: AtomicUsize,
    consecutive_failures: AtomicU32,
    cache: Cache<String, Arc<Vec<Vec<f32>>>>,
}

impl EmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs))
            .build();

        info!(
            endpoints = settings.endpoints.len(),
            cache_ttl_secs = settings.cache_ttl_secs,
            "Embedding client initialized"
        );

        Self {
            http: reqwest::Client::new(),
            endpoints: settings.endpoints.clone(),
            model: settings.model.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            retries: settings.retries.max(1),
            current_endpoint: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            cache,
        }
    }

    /// Whether strategy selection should consider embeddings obtainable right
    /// now. Flips false after repeated all-endpoint failures and recovers on
    /// the next success.
    pub fn is_available(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < UNAVAILABLE_AFTER_FAILURES
    }

    fn fingerprint(&self, texts: &[String]) -> String {
        let mut hasher = Sha256::new();
        if let Some(model) = &self.model {
            hasher.update(model.as_bytes());
        }
        hasher.update([0x1f]);
        for text in texts {
            hasher.update(text.trim().to_lowercase().as_bytes());
            hasher.update([0x1e]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Vectorize up to [`BATCH_CHUNK_SIZE`] texts.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let key = self.fingerprint(texts);
        if let Some(cached) = self.cache.get(&key).await {
            debug!("Embedding cache hit");
            return Ok(cached.as_ref().clone());
        }

        let vectors = self.embed_uncached(texts).await?;
        self.cache.insert(key, Arc::new(vectors.clone())).await;
        Ok(vectors)
    }

    /// Convenience wrapper for the single-query case.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or_else(|| {
            AppError::UpstreamUnavailable("embedding service returned no vectors".into())
        })
    }

    /// Batch mode: chunks of 50, each chunk embedded independently. A failed
    /// chunk does not roll back chunks that already succeeded; the first
    /// failure is returned alongside nothing, but prior results stay cached.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_CHUNK_SIZE) {
            match self.embed(chunk).await {
                Ok(mut vectors) => out.append(&mut vectors),
                Err(e) => {
                    warn!(
                        embedded = out.len(),
                        remaining = texts.len() - out.len(),
                        error = %e,
                        "Embedding batch aborted mid-way"
                    );
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    async fn embed_uncached(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let start_index = self.current_endpoint.load(Ordering::Relaxed);
        let mut last_error: Option<AppError> = None;

        for offset in 0..self.endpoints.len() {
            let index = (start_index + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            for attempt in 0..self.retries {
                match self.request_embeddings(endpoint, texts).await {
                    Ok(vectors) => {
                        // Stick to the endpoint that worked.
                        self.current_endpoint.store(index, Ordering::Relaxed);
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                        return Ok(vectors);
                    }
                    Err(e) => {
                        warn!(
                            endpoint = endpoint.as_str(),
                            attempt = attempt + 1,
                            error = %e,
                            "Embedding request failed"
                        );
                        last_error = Some(e);
                        if attempt + 1 < self.retries {
                            sleep(Duration::from_secs((attempt + 1) as u64)).await;
                        }
                    }
                }
            }

            debug!(endpoint = endpoint.as_str(), "Advancing to next embedding endpoint");
        }

        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        Err(match last_error {
            Some(AppError::Timeout(msg)) => AppError::UpstreamUnavailable(msg),
            Some(AppError::UpstreamUnavailable(msg)) => AppError::UpstreamUnavailable(msg),
            Some(other) => other,
            None => AppError::UpstreamUnavailable("no embedding endpoints configured".into()),
        })
    }

    async fn request_embeddings(
        &self,
        endpoint: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let body = EmbedRequest {
            texts,
            model: self.model.as_deref(),
        };

        let response = self
            .http
            .post(format!("{}/embed", endpoint))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("malformed embedding response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(AppError::UpstreamUnavailable(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(parsed.embeddings)
    }
}
