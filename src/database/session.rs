use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, PgConnection, Row};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::config::PoolRuntimeConfig;
use crate::error::AppError;
use crate::models::Property;

/// A typed query parameter. Queries are built as pure values and bound at
/// execution time, so no component ever mutates a shared builder.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Vector(Vec<f32>),
}

/// A fully built parametric query: SQL text, positional parameters, and the
/// index hints the planner decided to surface.
#[derive(Debug, Clone, Default)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub hints: Vec<String>,
}

/// A property row as returned by a session, with the raw vector distance
/// when the plan computed one.
#[derive(Debug, Clone)]
pub struct FetchedRow {
    pub property: Property,
    pub distance: Option<f64>,
}

/// One physical database connection, leased out by the pool.
#[async_trait]
pub trait Session: Send {
    /// Trivial round-trip used by the pool's health probe.
    async fn ping(&mut self) -> Result<(), AppError>;

    /// Run a built query and map the rows.
    async fn fetch_properties(&mut self, query: &SqlQuery) -> Result<Vec<FetchedRow>, AppError>;
}

/// Opens sessions for the pool. The seam exists so the pool, autoscaler and
/// orchestrator can be exercised without a live database.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn connect(&self, config: &PoolRuntimeConfig) -> Result<Box<dyn Session>, AppError>;
}

/// Production backend: one dedicated `PgConnection` per session.
pub struct PgSessionBackend;

impl PgSessionBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PgSessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for PgSessionBackend {
    async fn connect(&self, config: &PoolRuntimeConfig) -> Result<Box<dyn Session>, AppError> {
        let mut options = PgConnectOptions::from_str(&config.connection_endpoint)
            .map_err(|e| AppError::ConnectFailed(format!("invalid connection endpoint: {}", e)))?
            .application_name("property-search-core");
        if config.tls_required {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let conn = timeout(config.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                AppError::ConnectFailed(format!(
                    "connect timed out after {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(|e| AppError::ConnectFailed(e.to_string()))?;

        debug!("Opened database session");
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl Session for PgSession {
    async fn ping(&mut self) -> Result<(), AppError> {
        sqlx::query(VALIDATION_QUERY)
            .execute(&mut self.conn)
            .await
            .map_err(|e| AppError::ConnectFailed(format!("validation query failed: {}", e)))?;
        Ok(())
    }

    async fn fetch_properties(&mut self, query: &SqlQuery) -> Result<Vec<FetchedRow>, AppError> {
        let mut q = sqlx::query(&query.sql);
        for param in &query.params {
            q = match param {
                QueryParam::Text(v) => q.bind(v.clone()),
                QueryParam::Int(v) => q.bind(*v),
                QueryParam::Float(v) => q.bind(*v),
                QueryParam::Bool(v) => q.bind(*v),
                QueryParam::Vector(v) => q.bind(pgvector::Vector::from(v.clone())),
            };
        }

        let rows = q
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| AppError::QueryFailed(e.to_string()))?;

        let mut fetched = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| AppError::QueryFailed(format!("missing id column: {}", e)))?;
            let listed_at: DateTime<Utc> = row.try_get("created_at").unwrap_or_else(|_| Utc::now());
            let updated_at: DateTime<Utc> = row.try_get("updated_at").unwrap_or(listed_at);

            // Simplified plans select a reduced column set; everything beyond
            // the identity columns is optional on the way out.
            fetched.push(FetchedRow {
                property: Property {
                    id,
                    title: row.try_get("title").unwrap_or_default(),
                    description: row.try_get("description").unwrap_or_default(),
                    price: row.try_get("price").unwrap_or_default(),
                    location: row.try_get("location").unwrap_or_default(),
                    property_type: row.try_get("property_type").unwrap_or_default(),
                    bedrooms: row.try_get("bedrooms").unwrap_or_default(),
                    bathrooms: row.try_get("bathrooms").unwrap_or_default(),
                    size_sqft: row.try_get("size_sqft").unwrap_or_default(),
                    features: row.try_get("features").unwrap_or_default(),
                    images: row.try_get("images").unwrap_or_default(),
                    listed_at,
                    updated_at,
                },
                distance: row.try_get("distance").ok(),
            });
        }

        Ok(fetched)
    }
}

/// Shared validation query, also used by the pool's probe path.
pub const VALIDATION_QUERY: &str = "SELECT 1";

/// Budget for a single health probe round-trip.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
