use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::models::SearchRequest;
use crate::AppState;

/// POST /api/v1/search
pub async fn search(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    match state.orchestrator.search(request_id, req).await {
        Ok(result) => {
            info!(
                %request_id,
                strategy = result.strategy_used.as_str(),
                items = result.items.len(),
                elapsed_ms = result.elapsed_ms,
                "Search served"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "request_id": request_id,
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                    "data": result
                })),
            )
                .into_response()
        }
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
