use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Service is shutting down")]
    ShuttingDown,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, used in response bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Timeout(_) => "timeout",
            AppError::PoolExhausted(_) => "pool_exhausted",
            AppError::ConnectFailed(_) => "connect_failed",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::QueryFailed(_) => "query_failed",
            AppError::Cancelled(_) => "cancelled",
            AppError::ShuttingDown => "shutting_down",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConnectFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::QueryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error_kind": self.kind(),
            "error": self.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => AppError::Timeout(err.to_string()),
            sqlx::Error::PoolClosed => AppError::ShuttingDown,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => AppError::ConnectFailed(err.to_string()),
            _ => AppError::QueryFailed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(format!("HTTP request timed out: {}", err))
        } else {
            AppError::UpstreamUnavailable(err.to_string())
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(format!("Configuration error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}
