use chrono::{Duration as ChronoDuration, Utc};

use crate::database::session::{FetchedRow, QueryParam, SqlQuery};
use crate::models::{PropertyHit, SearchRequest};

/// Default minimum similarity retained by a vector plan.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Share of the result set within which relevance boosting may reorder rows.
const BOOST_WINDOW_FRACTION: f64 = 0.2;

/// Multiplier applied to boosted rows.
const BOOST_FACTOR: f64 = 1.05;

/// Listings newer than this get the recency boost.
const RECENT_LISTING_DAYS: i64 = 14;

const PROPERTY_COLUMNS: &str = "p.id, p.title, p.description, p.price, p.location, \
     p.property_type, p.bedrooms, p.bathrooms, p.size_sqft, p.features, p.images, \
     p.created_at, p.updated_at";

fn push_filters(req: &SearchRequest, sql: &mut String, params: &mut Vec<QueryParam>, alias: &str) {
    if let Some(location) = &req.location {
        params.push(QueryParam::Text(location.clone()));
        sql.push_str(&format!(" AND {}.location = ${}", alias, params.len()));
    }
    if let Some(range) = &req.price_range {
        if let Some(min) = range.min {
            params.push(QueryParam::Float(min));
            sql.push_str(&format!(" AND {}.price >= ${}", alias, params.len()));
        }
        if let Some(max) = range.max {
            params.push(QueryParam::Float(max));
            sql.push_str(&format!(" AND {}.price <= ${}", alias, params.len()));
        }
    }
    if let Some(property_type) = &req.property_type {
        params.push(QueryParam::Text(property_type.clone()));
        sql.push_str(&format!(" AND {}.property_type = ${}", alias, params.len()));
    }
    if let Some(bedrooms) = req.bedrooms {
        params.push(QueryParam::Int(bedrooms as i64));
        sql.push_str(&format!(" AND {}.bedrooms = ${}", alias, params.len()));
    }
    if let Some(bathrooms) = req.bathrooms {
        params.push(QueryParam::Int(bathrooms as i64));
        sql.push_str(&format!(" AND {}.bathrooms = ${}", alias, params.len()));
    }
}

/// Build the parametric similarity query: properties whose cosine distance to
/// the query embedding is below `1 − similarity_threshold`, filtered, ordered
/// by distance ascending.
///
/// Pure function; the caller decides when to execute and with which session.
pub fn build_vector_query(
    embedding: &[f32],
    req: &SearchRequest,
    similarity_threshold: f64,
    with_hints: bool,
) -> SqlQuery {
    let mut params: Vec<QueryParam> = vec![
        QueryParam::Vector(embedding.to_vec()),
        QueryParam::Float(1.0 - similarity_threshold),
    ];

    let mut sql = format!(
        "SELECT {}, (e.combined_embedding <=> $1) AS distance \
         FROM properties p \
         JOIN property_embeddings e ON e.property_id = p.id \
         WHERE (e.combined_embedding <=> $1) < $2",
        PROPERTY_COLUMNS
    );

    push_filters(req, &mut sql, &mut params, "p");

    params.push(QueryParam::Int(req.limit as i64));
    sql.push_str(&format!(" ORDER BY distance ASC LIMIT ${}", params.len()));
    params.push(QueryParam::Int(req.offset as i64));
    sql.push_str(&format!(" OFFSET ${}", params.len()));

    let hints = if with_hints {
        vec![
            "idx_property_embeddings_combined_ivfflat".to_string(),
            "idx_properties_type_price".to_string(),
        ]
    } else {
        Vec::new()
    };

    SqlQuery { sql, params, hints }
}

/// Build the degraded-mode query: minimal columns, no joins, newest first.
pub fn build_simplified_query(req: &SearchRequest) -> SqlQuery {
    let mut params: Vec<QueryParam> = Vec::new();
    let mut sql =
        "SELECT p.id, p.title, p.price, p.location, p.property_type, p.created_at, p.updated_at \
         FROM properties p WHERE TRUE"
            .to_string();

    push_filters(req, &mut sql, &mut params, "p");

    params.push(QueryParam::Int(req.limit as i64));
    sql.push_str(&format!(" ORDER BY p.created_at DESC LIMIT ${}", params.len()));
    params.push(QueryParam::Int(req.offset as i64));
    sql.push_str(&format!(" OFFSET ${}", params.len()));

    SqlQuery {
        sql,
        params,
        hints: Vec::new(),
    }
}

fn boost_multiplier(row: &FetchedRow) -> f64 {
    let mut boost = 1.0;
    let recent_cutoff = Utc::now() - ChronoDuration::days(RECENT_LISTING_DAYS);
    if row.property.listed_at > recent_cutoff {
        boost *= BOOST_FACTOR;
    }
    if matches!(row.property.property_type.as_str(), "penthouse" | "detached") {
        boost *= BOOST_FACTOR;
    }
    boost
}

/// Convert distance-ordered rows into scored hits.
///
/// Similarity is `1 − distance`. The relevance multiplier may promote recent
/// listings and premium property types, but only inside the first 20% of the
/// result set; the tail keeps its distance order so the ranking stays
/// explainable.
pub fn rank_rows(rows: Vec<FetchedRow>) -> Vec<PropertyHit> {
    let n = rows.len();
    if n == 0 {
        return Vec::new();
    }

    let mut hits: Vec<PropertyHit> = rows
        .into_iter()
        .map(|row| {
            let similarity = row.distance.map(|d| (1.0 - d).clamp(0.0, 1.0));
            let relevance = similarity.map(|s| (s * boost_multiplier(&row)).min(1.0));
            PropertyHit {
                property: row.property,
                similarity,
                relevance,
            }
        })
        .collect();

    let boost_window = ((n as f64 * BOOST_WINDOW_FRACTION).ceil() as usize).min(n);
    hits[..boost_window].sort_by(|a, b| {
        let ra = a.relevance.unwrap_or(0.0);
        let rb = b.relevance.unwrap_or(0.0);
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });

    hits
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use super::*;
    use crate::models::{PriceRange, Property};

    fn request() -> SearchRequest {
        SearchRequest {
            query_text: Some("garden flat".into()),
            location: Some("London".into()),
            price_range: Some(PriceRange {
                min: Some(100_000.0),
                max: Some(500_000.0),
            }),
            bedrooms: Some(2),
            limit: 10,
            offset: 20,
            ..Default::default()
        }
    }

    fn row(distance: f64, property_type: &str, days_old: i64) -> FetchedRow {
        let listed = Utc::now() - ChronoDuration::days(days_old);
        FetchedRow {
            property: Property {
                id: Uuid::new_v4(),
                title: format!("{} listing", property_type),
                description: String::new(),
                price: 250_000.0,
                location: "London".into(),
                property_type: property_type.into(),
                bedrooms: 2,
                bathrooms: 1,
                size_sqft: 700.0,
                features: vec![],
                images: vec![],
                listed_at: listed,
                updated_at: listed,
            },
            distance: Some(distance),
        }
    }

    #[test]
    fn test_vector_query_shape() {
        let query = build_vector_query(&[0.1, 0.2, 0.3], &request(), 0.7, false);

        assert!(query.sql.contains("combined_embedding <=> $1"));
        assert!(query.sql.contains("JOIN property_embeddings"));
        assert!(query.sql.contains("ORDER BY distance ASC"));
        assert!(query.sql.contains("p.location = $3"));
        assert!(query.sql.contains("p.bedrooms = $6"));
        assert!(query.hints.is_empty());

        // Vector, distance cutoff, location, price min/max, bedrooms, limit, offset.
        assert_eq!(query.params.len(), 8);
        assert!(matches!(query.params[0], QueryParam::Vector(_)));
        match &query.params[1] {
            QueryParam::Float(cutoff) => assert!((cutoff - 0.3).abs() < 1e-9),
            other => panic!("unexpected param {:?}", other),
        }
        assert_eq!(query.params[6], QueryParam::Int(10));
        assert_eq!(query.params[7], QueryParam::Int(20));
    }

    #[test]
    fn test_vector_query_hints_when_requested() {
        let query = build_vector_query(&[0.1], &request(), 0.7, true);
        assert!(!query.hints.is_empty());
        assert!(query.hints.iter().any(|h| h.contains("ivfflat")));
    }

    #[test]
    fn test_simplified_query_has_no_joins_and_orders_by_recency() {
        let query = build_simplified_query(&request());
        assert!(!query.sql.contains("JOIN"));
        assert!(!query.sql.contains("description"));
        assert!(query.sql.contains("ORDER BY p.created_at DESC"));
    }

    #[test]
    fn test_rank_rows_similarity_is_one_minus_distance() {
        let hits = rank_rows(vec![row(0.1, "flat", 100)]);
        assert!((hits[0].similarity.unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_boost_cannot_reorder_beyond_first_twenty_percent() {
        // Ten rows; the boost window is the first 2. A heavily boosted row at
        // position 9 must stay at position 9.
        let mut rows = Vec::new();
        for i in 0..9 {
            rows.push(row(0.1 + i as f64 * 0.05, "flat", 100));
        }
        rows.push(row(0.9, "penthouse", 1));
        let tail_id = rows[9].property.id;

        let hits = rank_rows(rows);
        assert_eq!(hits.len(), 10);
        assert_eq!(hits[9].property.id, tail_id);
    }

    #[test]
    fn test_boost_reorders_within_window() {
        // Window of 1 for 5 rows is ceil(1) = 1, use 10 rows -> window 2.
        let mut rows = Vec::new();
        rows.push(row(0.10, "flat", 100)); // similarity 0.90
        rows.push(row(0.12, "penthouse", 1)); // 0.88 boosted ~0.97
        for i in 0..8 {
            rows.push(row(0.2 + i as f64 * 0.05, "flat", 100));
        }
        let boosted_id = rows[1].property.id;

        let hits = rank_rows(rows);
        assert_eq!(hits[0].property.id, boosted_id);
    }
}
