use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TextEngineSettings;
use crate::error::AppError;
use crate::models::SearchRequest;

#[derive(Debug, Serialize)]
struct EngineQuery<'a> {
    q: &'a str,
    filter: Vec<String>,
    limit: u32,
    offset: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sort: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextHit {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub property_type: String,
    #[serde(default)]
    pub bedrooms: i32,
    #[serde(default)]
    pub bathrooms: i32,
}

#[derive(Debug, Deserialize)]
struct EngineResponse {
    hits: Vec<TextHit>,
    #[serde(rename = "estimatedTotalHits", default)]
    estimated_total_hits: u64,
    #[serde(rename = "processingTimeMs", default)]
    processing_time_ms: u64,
}

#[derive(Debug, Deserialize)]
struct EngineHealth {
    status: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Clone)]
pub struct TextSearchResponse {
    pub hits: Vec<TextHit>,
    pub estimated_total: u64,
    pub processing_time: Duration,
}

/// Translate request filters into the engine's filter expression grammar.
pub fn build_filter_expressions(req: &SearchRequest) -> Vec<String> {
    let mut filters = Vec::new();
    if let Some(location) = &req.location {
        filters.push(format!("location = \"{}\"", location));
    }
    if let Some(range) = &req.price_range {
        if let Some(min) = range.min {
            filters.push(format!("price >= {}", min));
        }
        if let Some(max) = range.max {
            filters.push(format!("price <= {}", max));
        }
    }
    if let Some(property_type) = &req.property_type {
        filters.push(format!("property_type = \"{}\"", property_type));
    }
    if let Some(bedrooms) = req.bedrooms {
        filters.push(format!("bedrooms = {}", bedrooms));
    }
    filters
}

/// Remote keyword-search client. Any failure here is non-fatal to the
/// orchestrator, which treats it as an empty hit list.
pub struct TextSearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl TextSearchClient {
    pub fn new(settings: &TextEngineSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<TextSearchResponse, AppError> {
        let query_text = req.query_text.as_deref().unwrap_or_default();
        let body = EngineQuery {
            q: query_text,
            filter: build_filter_expressions(req),
            limit: req.limit,
            offset: req.offset,
            sort: Vec::new(),
        };

        let mut request = self
            .http
            .post(format!("{}/indexes/properties/search", self.base_url))
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "text search engine returned {}",
                response.status()
            )));
        }

        let parsed: EngineResponse = response.json().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("malformed text search response: {}", e))
        })?;

        debug!(
            hits = parsed.hits.len(),
            estimated_total = parsed.estimated_total_hits,
            engine_ms = parsed.processing_time_ms,
            "Text search completed"
        );

        Ok(TextSearchResponse {
            hits: parsed.hits,
            estimated_total: parsed.estimated_total_hits,
            processing_time: Duration::from_millis(parsed.processing_time_ms),
        })
    }

    /// Engine health probe (`/health` returning `{status, version}`).
    pub async fn health(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<EngineHealth>().await {
                    Ok(health) => {
                        debug!(status = health.status.as_str(), version = health.version.as_str(),
                               "Text engine health");
                        health.status == "available" || health.status == "ok"
                    }
                    Err(e) => {
                        warn!(error = %e, "Text engine health response malformed");
                        false
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "Text engine health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Text engine unreachable");
                false
            }
        }
    }
}
