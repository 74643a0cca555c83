use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::database::health::HealthStatus;
use crate::AppState;

fn envelope(request_id: Uuid, started: Instant, data: serde_json::Value) -> serde_json::Value {
    json!({
        "request_id": request_id,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "data": data
    })
}

/// GET /api/v1/pool/status
pub async fn pool_status(State(state): State<AppState>) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let status = state.pool.status();
    let body = json!({
        "total": status.total,
        "idle": status.idle,
        "leased": status.total.saturating_sub(status.idle),
        "waiting": status.waiting,
        "current_max": status.current_max,
        "state": status.state.as_str(),
        "last_resize_secs_ago": status.last_resize_at.map(|at| at.elapsed().as_secs()),
        "probe_ok": state.pool.probe_ok(),
        "last_healthy_secs_ago": state.pool.last_healthy_age().map(|age| age.as_secs()),
        "sessions_opened": state.metrics.sessions_opened(),
        "sessions_closed": state.metrics.sessions_closed(),
    });

    (StatusCode::OK, Json(envelope(request_id, started, body))).into_response()
}

/// GET /api/v1/metrics
pub async fn metrics_snapshot(State(state): State<AppState>) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let config = state.config.load();
    let status = state.pool.status();
    let snapshot = state.metrics.snapshot(&status, &config.autoscale.peak_hours);

    (
        StatusCode::OK,
        Json(envelope(
            request_id,
            started,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        )),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_count")]
    pub count: usize,
}

fn default_history_count() -> usize {
    50
}

/// GET /api/v1/metrics/history?count=k
pub async fn metrics_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let history = state.metrics.history(params.count);
    (
        StatusCode::OK,
        Json(envelope(
            request_id,
            started,
            serde_json::to_value(&history).unwrap_or_default(),
        )),
    )
        .into_response()
}

/// GET /api/v1/health
///
/// healthy and degraded answer 200 (the body carries the status); critical
/// answers 503.
pub async fn platform_health(State(state): State<AppState>) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let config = state.config.load();
    let status = state.pool.status();
    let snapshot = state.metrics.snapshot(&status, &config.autoscale.peak_hours);
    let report = state.health.evaluate(
        &snapshot,
        &status,
        state.pool.probe_ok(),
        state.autoscaler.last_event(),
    );

    let http_status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = json!({
        "status": report.status.as_str(),
        "pool": report.pool_sub_status,
        "scaling": report.scaling_sub_status,
        "recommendations": report.recommendations,
        "last_scaling_event": report.last_scaling_event,
        "cache_entries": state.cache.entry_count(),
    });

    (http_status, Json(envelope(request_id, started, body))).into_response()
}

/// GET /api/v1/scaling-events?count=k
pub async fn scaling_events(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let events = state.autoscaler.history(params.count);
    (
        StatusCode::OK,
        Json(envelope(
            request_id,
            started,
            serde_json::to_value(&events).unwrap_or_default(),
        )),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub max_sessions: u32,
}

/// POST /api/v1/pool/resize
///
/// Administrative resize; goes through the autoscaler's serialized path and
/// shows up in the scaling-events listing with reason `manual`.
pub async fn resize_pool(
    State(state): State<AppState>,
    Json(req): Json<ResizeRequest>,
) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    match state.autoscaler.manual_resize(req.max_sessions).await {
        Ok(event) => (
            StatusCode::OK,
            Json(envelope(
                request_id,
                started,
                serde_json::to_value(&event).unwrap_or_default(),
            )),
        )
            .into_response(),
        Err(e) => {
            let status = e.status_code();
            (
                status,
                Json(json!({
                    "request_id": request_id,
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                    "error_kind": e.kind(),
                    "error": e.to_string(),
                    "status": status.as_u16()
                })),
            )
                .into_response()
        }
    }
}
