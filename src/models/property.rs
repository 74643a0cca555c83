use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

pub const MAX_RESULT_LIMIT: u32 = 100;
pub const DEFAULT_RESULT_LIMIT: u32 = 20;

/// A property listing as stored in the `properties` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: String,
    pub property_type: String,
    pub bedrooms: i32,
    pub bathrooms: i32,
    pub size_sqft: f64,
    pub features: Vec<String>,
    pub images: Vec<String>,
    pub listed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    Price,
    Size,
    Date,
}

impl SortBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::Relevance => "relevance",
            SortBy::Price => "price",
            SortBy::Size => "size",
            SortBy::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

fn default_limit() -> u32 {
    DEFAULT_RESULT_LIMIT
}

/// An incoming search request. Field validation happens in [`SearchRequest::validate`];
/// sanitization of the raw input is the HTTP layer's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<i32>,
    #[serde(default)]
    pub bathrooms: Option<i32>,
    #[serde(default)]
    pub features: Option<Vec<String>>,
    /// Pre-computed query embedding. Excluded from the request fingerprint.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Per-request deadline in milliseconds; the server default applies when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query_text: None,
            location: None,
            price_range: None,
            property_type: None,
            bedrooms: None,
            bathrooms: None,
            features: None,
            embedding: None,
            limit: DEFAULT_RESULT_LIMIT,
            offset: 0,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            deadline_ms: None,
        }
    }
}

impl SearchRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.limit < 1 || self.limit > MAX_RESULT_LIMIT {
            return Err(AppError::InvalidRequest(format!(
                "limit must be between 1 and {}, got {}",
                MAX_RESULT_LIMIT, self.limit
            )));
        }
        if let Some(range) = &self.price_range {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(AppError::InvalidRequest(format!(
                        "price_range.min ({}) exceeds price_range.max ({})",
                        min, max
                    )));
                }
            }
        }
        if let Some(embedding) = &self.embedding {
            if embedding.is_empty() {
                return Err(AppError::InvalidRequest(
                    "embedding must not be empty when present".into(),
                ));
            }
        }
        if let Some(bedrooms) = self.bedrooms {
            if bedrooms < 0 {
                return Err(AppError::InvalidRequest("bedrooms must be non-negative".into()));
            }
        }
        if let Some(bathrooms) = self.bathrooms {
            if bathrooms < 0 {
                return Err(AppError::InvalidRequest("bathrooms must be non-negative".into()));
            }
        }
        Ok(())
    }

    /// Stable fingerprint of the normalized request, used as the result-cache key.
    ///
    /// The embedding is deliberately excluded: two clients may produce slightly
    /// different vectors for the same text, and the text itself is already part
    /// of the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();

        if let Some(q) = &self.query_text {
            hasher.update(q.trim().to_lowercase().as_bytes());
        }
        hasher.update([0x1f]);
        if let Some(loc) = &self.location {
            hasher.update(loc.trim().to_lowercase().as_bytes());
        }
        hasher.update([0x1f]);
        if let Some(range) = &self.price_range {
            hasher.update(format!("{:?}-{:?}", range.min, range.max).as_bytes());
        }
        hasher.update([0x1f]);
        if let Some(pt) = &self.property_type {
            hasher.update(pt.trim().to_lowercase().as_bytes());
        }
        hasher.update([0x1f]);
        hasher.update(format!("{:?}|{:?}", self.bedrooms, self.bathrooms).as_bytes());
        hasher.update([0x1f]);
        if let Some(features) = &self.features {
            let mut sorted: Vec<String> =
                features.iter().map(|f| f.trim().to_lowercase()).collect();
            sorted.sort();
            for feature in sorted {
                hasher.update(feature.as_bytes());
                hasher.update([0x1e]);
            }
        }
        hasher.update([0x1f]);
        hasher.update(
            format!(
                "{}|{}|{}|{}",
                self.limit,
                self.offset,
                self.sort_by.as_str(),
                self.sort_order.as_str()
            )
            .as_bytes(),
        );

        let digest = hasher.finalize();
        format!("{:x}", digest)
    }
}

/// Which execution plan served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    Hybrid,
    Text,
    Vector,
    Cached,
    Fallback,
    Optimized,
    Simplified,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Hybrid => "hybrid",
            SearchStrategy::Text => "text",
            SearchStrategy::Vector => "vector",
            SearchStrategy::Cached => "cached",
            SearchStrategy::Fallback => "fallback",
            SearchStrategy::Optimized => "optimized",
            SearchStrategy::Simplified => "simplified",
        }
    }
}

/// A single scored item in a result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyHit {
    #[serde(flatten)]
    pub property: Property,
    /// Vector similarity (1 − distance), when a vector plan contributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Text/merged relevance score, when a text plan contributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    /// Pool utilization observed at strategy selection.
    pub pool_utilization: f64,
    pub cache_hit: bool,
    pub optimizations: Vec<String>,
    pub indexes_hinted: Vec<String>,
    pub text_results: usize,
    pub vector_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub items: Vec<PropertyHit>,
    pub total: u64,
    pub strategy_used: SearchStrategy,
    pub elapsed_ms: u64,
    pub metadata: SearchMetadata,
}

impl SearchResult {
    pub fn empty(strategy: SearchStrategy) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            strategy_used: strategy,
            elapsed_ms: 0,
            metadata: SearchMetadata::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_text(text: &str) -> SearchRequest {
        SearchRequest {
            query_text: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_limit_bounds() {
        let mut req = SearchRequest::default();
        assert!(req.validate().is_ok());

        req.limit = 0;
        assert!(matches!(req.validate(), Err(AppError::InvalidRequest(_))));

        req.limit = 101;
        assert!(matches!(req.validate(), Err(AppError::InvalidRequest(_))));

        req.limit = 100;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_price_range() {
        let req = SearchRequest {
            price_range: Some(PriceRange {
                min: Some(500_000.0),
                max: Some(100_000.0),
            }),
            ..Default::default()
        };
        assert!(matches!(req.validate(), Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn test_fingerprint_excludes_embedding() {
        let mut a = request_with_text("two bed flat in shoreditch");
        let mut b = request_with_text("two bed flat in shoreditch");
        a.embedding = Some(vec![0.1, 0.2, 0.3]);
        b.embedding = Some(vec![0.9, 0.8, 0.7]);

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_normalizes_query_text() {
        let a = request_with_text("  Garden FLAT ");
        let b = request_with_text("garden flat");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_filters_and_paging() {
        let base = request_with_text("cottage");
        let mut other = request_with_text("cottage");
        other.bedrooms = Some(3);
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut paged = request_with_text("cottage");
        paged.offset = 20;
        assert_ne!(base.fingerprint(), paged.fingerprint());
    }

    #[test]
    fn test_feature_order_does_not_change_fingerprint() {
        let mut a = request_with_text("house");
        let mut b = request_with_text("house");
        a.features = Some(vec!["Garden".into(), "parking".into()]);
        b.features = Some(vec!["parking".into(), "garden".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
