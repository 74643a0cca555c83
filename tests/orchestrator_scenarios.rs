mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{build_fixture, property_row, seed_query_time, FixtureOptions};
use property_search_core::error::AppError;
use property_search_core::models::{SearchRequest, SearchStrategy};

fn text_engine_body(hits: serde_json::Value, total: u64) -> serde_json::Value {
    serde_json::json!({
        "hits": hits,
        "estimatedTotalHits": total,
        "processingTimeMs": 5
    })
}

fn request_with_embedding(text: &str) -> SearchRequest {
    SearchRequest {
        query_text: Some(text.to_string()),
        embedding: Some(vec![0.1, 0.2, 0.3]),
        ..Default::default()
    }
}

#[tokio::test]
async fn hybrid_merges_text_and_vector_sources() {
    let text_server = MockServer::start().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_engine_body(
            serde_json::json!([
                {"id": a, "title": "A", "price": 100000.0},
                {"id": b, "title": "B", "price": 200000.0}
            ]),
            2,
        )))
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        text_engine_url: text_server.uri(),
        ..Default::default()
    })
    .await;

    // B appears in both sources, C is vector-only.
    fixture.backend.set_rows(vec![
        property_row(b, "B", Some(0.1)),
        property_row(c, "C", Some(0.3)),
    ]);

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("garden flat"))
        .await
        .unwrap();

    assert_eq!(result.strategy_used, SearchStrategy::Hybrid);
    assert_eq!(result.metadata.text_results, 2);
    assert_eq!(result.metadata.vector_results, 2);

    let ids: Vec<Uuid> = result.items.iter().map(|h| h.property.id).collect();
    // A leads the text ranking (score 1.0); B combines both sources
    // (0.6*0.5 + 0.4*0.9 = 0.66); C is vector-only (0.4*0.7 = 0.28).
    assert_eq!(ids, vec![a, b, c]);

    // Fresh hybrid results populate the cache.
    let fingerprint = request_with_embedding("garden flat").fingerprint();
    assert!(fixture.cache.get(&fingerprint).await.is_some());
}

#[tokio::test]
async fn hybrid_uses_vector_only_when_text_misses_deadline() {
    let text_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(text_engine_body(serde_json::json!([]), 0))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        text_engine_url: text_server.uri(),
        default_deadline_ms: 600,
        ..Default::default()
    })
    .await;

    let v = Uuid::new_v4();
    fixture.backend.set_rows(vec![property_row(v, "vector hit", Some(0.2))]);
    fixture.backend.set_query_delay(Duration::from_millis(120));

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("riverside flat"))
        .await
        .unwrap();

    // The slow text side contributes nothing; the strategy stays hybrid.
    assert_eq!(result.strategy_used, SearchStrategy::Hybrid);
    assert_eq!(result.metadata.text_results, 0);
    assert_eq!(result.metadata.vector_results, 1);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].property.id, v);
}

#[tokio::test]
async fn hybrid_downgrades_to_fallback_when_both_sides_fail() {
    let text_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        text_engine_url: text_server.uri(),
        ..Default::default()
    })
    .await;
    fixture.backend.fail_queries.store(true, Ordering::SeqCst);

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("penthouse"))
        .await
        .unwrap();

    assert_eq!(result.strategy_used, SearchStrategy::Fallback);
    assert!(result.items.is_empty());
    assert_eq!(result.total, 0);
}

#[tokio::test]
async fn text_strategy_when_queries_run_slower_than_hybrid_budget() {
    let text_server = MockServer::start().await;
    let t = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_engine_body(
            serde_json::json!([{"id": t, "title": "terrace", "price": 300000.0}]),
            17,
        )))
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        text_engine_url: text_server.uri(),
        ..Default::default()
    })
    .await;

    // Average query time ~200ms: too slow for hybrid, fine for text.
    seed_query_time(&fixture.metrics, 200, 16);

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("victorian terrace"))
        .await
        .unwrap();

    assert_eq!(result.strategy_used, SearchStrategy::Text);
    assert_eq!(result.total, 17);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].property.id, t);
    assert!(result.items[0].relevance.unwrap() > 0.99);
}

#[tokio::test]
async fn vector_strategy_when_queries_too_slow_for_text() {
    let fixture = build_fixture(FixtureOptions::default()).await;

    // Average ~700ms: beyond the text threshold, vector still allowed.
    seed_query_time(&fixture.metrics, 700, 16);

    let v = Uuid::new_v4();
    fixture.backend.set_rows(vec![property_row(v, "match", Some(0.25))]);

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("modern flat"))
        .await
        .unwrap();

    assert_eq!(result.strategy_used, SearchStrategy::Vector);
    assert_eq!(result.items.len(), 1);
    let similarity = result.items[0].similarity.unwrap();
    assert!((similarity - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn cached_strategy_under_pool_pressure() {
    let text_server = MockServer::start().await;
    let t = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_engine_body(
            serde_json::json!([{"id": t, "title": "cached terrace", "price": 250000.0}]),
            1,
        )))
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        max_sessions: 2,
        text_engine_url: text_server.uri(),
        ..Default::default()
    })
    .await;

    // Warm the cache with a text search while the pool is calm.
    seed_query_time(&fixture.metrics, 200, 16);
    let req = SearchRequest {
        query_text: Some("harbour view".into()),
        ..Default::default()
    };
    let first = fixture
        .orchestrator
        .search(Uuid::new_v4(), req.clone())
        .await
        .unwrap();
    assert_eq!(first.strategy_used, SearchStrategy::Text);

    // Drive utilization to 1.0 by holding every session.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    let lease_a = fixture.pool.acquire(deadline).await.unwrap();
    let lease_b = fixture.pool.acquire(deadline).await.unwrap();

    let second = fixture
        .orchestrator
        .search(Uuid::new_v4(), req.clone())
        .await
        .unwrap();
    assert_eq!(second.strategy_used, SearchStrategy::Cached);
    assert!(second.metadata.cache_hit);
    assert_eq!(second.items.len(), 1);

    drop(lease_a);
    drop(lease_b);
}

#[tokio::test]
async fn simplified_strategy_under_pressure_without_cache_entry() {
    let fixture = build_fixture(FixtureOptions {
        max_sessions: 2,
        ..Default::default()
    })
    .await;

    let s = Uuid::new_v4();
    fixture.backend.set_rows(vec![property_row(s, "recent listing", None)]);

    // Both sessions opened, one held: utilization 1.0 with one idle session
    // left for the simplified query.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    let lease_a = fixture.pool.acquire(deadline).await.unwrap();
    let lease_b = fixture.pool.acquire(deadline).await.unwrap();
    drop(lease_b);

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("no cache for this"))
        .await
        .unwrap();

    assert_eq!(result.strategy_used, SearchStrategy::Simplified);
    assert_eq!(result.items.len(), 1);
    assert!(result
        .metadata
        .optimizations
        .contains(&"minimal_columns".to_string()));

    drop(lease_a);
}

#[tokio::test]
async fn pool_exhaustion_surfaces_after_single_retry() {
    let fixture = build_fixture(FixtureOptions {
        max_sessions: 1,
        default_deadline_ms: 150,
        ..Default::default()
    })
    .await;

    seed_query_time(&fixture.metrics, 700, 16);

    let v = Uuid::new_v4();
    fixture.backend.set_rows(vec![property_row(v, "unreachable", Some(0.2))]);

    // Hold the only session so the vector plan cannot acquire one.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
    let lease = fixture.pool.acquire(deadline).await.unwrap();

    let err = fixture
        .orchestrator
        .search(Uuid::new_v4(), request_with_embedding("blocked"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PoolExhausted(_)));

    drop(lease);
}

#[tokio::test]
async fn invalid_request_surfaces_immediately() {
    let fixture = build_fixture(FixtureOptions::default()).await;

    let mut req = request_with_embedding("anything");
    req.limit = 0;

    let err = fixture
        .orchestrator
        .search(Uuid::new_v4(), req)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn fallback_serves_cached_result_when_unhealthy() {
    let text_server = MockServer::start().await;
    let t = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/indexes/properties/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_engine_body(
            serde_json::json!([{"id": t, "title": "kept", "price": 150000.0}]),
            1,
        )))
        .mount(&text_server)
        .await;

    let fixture = build_fixture(FixtureOptions {
        text_engine_url: text_server.uri(),
        ..Default::default()
    })
    .await;

    seed_query_time(&fixture.metrics, 200, 16);
    let req = SearchRequest {
        query_text: Some("stale but useful".into()),
        ..Default::default()
    };
    fixture
        .orchestrator
        .search(Uuid::new_v4(), req.clone())
        .await
        .unwrap();

    // Slow queries beyond every healthy threshold and no embedding: fallback,
    // which reuses the cached entry rather than returning nothing.
    seed_query_time(&fixture.metrics, 700, 512);
    let mut degraded_req = req.clone();
    degraded_req.embedding = None;

    let result = fixture
        .orchestrator
        .search(Uuid::new_v4(), degraded_req)
        .await
        .unwrap();
    assert_eq!(result.strategy_used, SearchStrategy::Fallback);
    assert!(result.metadata.cache_hit);
    assert_eq!(result.items.len(), 1);
}
