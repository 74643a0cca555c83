use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use property_search_core::config::{
    ConfigHandle, DatabaseSettings, EmbeddingSettings, PoolRuntimeConfig, SearchSettings,
    TextEngineSettings,
};
use property_search_core::database::session::FetchedRow;
use property_search_core::database::{
    HealthEvaluator, MetricsAggregator, PoolController, Session, SessionBackend, SqlQuery,
};
use property_search_core::error::AppError;
use property_search_core::models::Property;
use property_search_core::services::{
    EmbeddingClient, ResultCache, SearchOrchestrator, TextSearchClient,
};

/// Scripted database backend: every session returns the configured rows after
/// the configured delay, or fails when the failure flag is set.
pub struct ScriptedBackend {
    pub rows: Mutex<Vec<FetchedRow>>,
    pub query_delay: Mutex<Duration>,
    pub fail_queries: AtomicBool,
    pub connects: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            query_delay: Mutex::new(Duration::ZERO),
            fail_queries: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn set_rows(&self, rows: Vec<FetchedRow>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }
}

struct ScriptedSession {
    backend: Arc<ScriptedBackend>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn ping(&mut self) -> Result<(), AppError> {
        Ok(())
    }

    async fn fetch_properties(&mut self, _query: &SqlQuery) -> Result<Vec<FetchedRow>, AppError> {
        let delay = *self.backend.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.backend.fail_queries.load(Ordering::SeqCst) {
            return Err(AppError::QueryFailed("scripted failure".into()));
        }
        Ok(self.backend.rows.lock().unwrap().clone())
    }
}

pub struct SharedScriptedBackend(pub Arc<ScriptedBackend>);

#[async_trait]
impl SessionBackend for SharedScriptedBackend {
    async fn connect(&self, _config: &PoolRuntimeConfig) -> Result<Box<dyn Session>, AppError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            backend: self.0.clone(),
        }))
    }
}

pub fn property_row(id: Uuid, title: &str, distance: Option<f64>) -> FetchedRow {
    let now = Utc::now();
    FetchedRow {
        property: Property {
            id,
            title: title.to_string(),
            description: format!("{} description", title),
            price: 275_000.0,
            location: "London".into(),
            property_type: "flat".into(),
            bedrooms: 2,
            bathrooms: 1,
            size_sqft: 720.0,
            features: vec!["garden".into()],
            images: vec![],
            listed_at: now,
            updated_at: now,
        },
        distance,
    }
}

/// Everything a scenario needs, wired the way the composition root does it.
pub struct Fixture {
    pub backend: Arc<ScriptedBackend>,
    pub pool: Arc<PoolController>,
    pub metrics: Arc<MetricsAggregator>,
    pub cache: Arc<ResultCache>,
    pub orchestrator: SearchOrchestrator,
}

pub struct FixtureOptions {
    pub max_sessions: u32,
    pub text_engine_url: String,
    pub embedding_url: String,
    pub default_deadline_ms: u64,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            text_engine_url: "http://127.0.0.1:9".into(),
            embedding_url: "http://127.0.0.1:9".into(),
            default_deadline_ms: 5_000,
        }
    }
}

pub async fn build_fixture(options: FixtureOptions) -> Fixture {
    let mut db = DatabaseSettings::default();
    db.autoscale.min_sessions = 1;
    db.autoscale.max_sessions = options.max_sessions;

    let config = Arc::new(ConfigHandle::new(PoolRuntimeConfig::from_settings(&db)));
    let metrics = Arc::new(MetricsAggregator::new());
    let backend = ScriptedBackend::new();
    let pool = Arc::new(PoolController::new(
        Arc::new(SharedScriptedBackend(backend.clone())),
        config.clone(),
        metrics.clone(),
    ));
    pool.initialize().await;

    let cache = Arc::new(ResultCache::new(Duration::from_secs(300), 1_000));
    let search_settings = SearchSettings {
        default_deadline_ms: options.default_deadline_ms,
        ..SearchSettings::default()
    };

    let embedding = Arc::new(EmbeddingClient::new(&EmbeddingSettings {
        endpoints: vec![options.embedding_url],
        model: None,
        timeout_secs: 1,
        retries: 1,
        cache_ttl_secs: 60,
        cache_capacity: 100,
    }));
    let text = Arc::new(TextSearchClient::new(&TextEngineSettings {
        url: options.text_engine_url,
        api_key: None,
        timeout_secs: 1,
    }));

    let orchestrator = SearchOrchestrator::new(
        pool.clone(),
        metrics.clone(),
        Arc::new(HealthEvaluator::new()),
        embedding,
        text,
        cache.clone(),
        config,
        search_settings,
        Vec::new(),
    );

    Fixture {
        backend,
        pool,
        metrics,
        cache,
        orchestrator,
    }
}

/// Record `count` query observations of `ms` milliseconds each, so strategy
/// selection sees the intended rolling average.
pub fn seed_query_time(metrics: &MetricsAggregator, ms: u64, count: usize) {
    for _ in 0..count {
        let start = std::time::Instant::now() - Duration::from_millis(ms);
        metrics.record_query(start, std::time::Instant::now(), true);
    }
}
