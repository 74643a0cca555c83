use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use property_search_core::config::{ConfigHandle, PoolRuntimeConfig, Settings};
use property_search_core::database::{
    Autoscaler, HealthEvaluator, MetricsAggregator, PgSessionBackend, PoolController,
};
use property_search_core::handlers::{search_handlers, system_handlers};
use property_search_core::services::{
    EmbeddingClient, PoolEventListener, ResultCache, SearchOrchestrator, TextSearchClient,
    TracingEventListener,
};
use property_search_core::AppState;

/// Cadence of the background database probe.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone())),
        )
        .init();

    settings.validate()?;
    info!("Starting property search core");

    // Composition root: every component built once, dependencies passed
    // explicitly.
    let settings = Arc::new(settings);
    let config = Arc::new(ConfigHandle::new(PoolRuntimeConfig::from_settings(
        &settings.database,
    )));
    let metrics = Arc::new(MetricsAggregator::new());
    let pool = Arc::new(PoolController::new(
        Arc::new(PgSessionBackend::new()),
        config.clone(),
        metrics.clone(),
    ));
    pool.initialize().await;

    let listeners: Vec<Arc<dyn PoolEventListener>> = vec![Arc::new(TracingEventListener)];
    let health = Arc::new(HealthEvaluator::new());
    let autoscaler = Arc::new(Autoscaler::new(
        pool.clone(),
        metrics.clone(),
        config.clone(),
        listeners.clone(),
    ));
    let cache = Arc::new(ResultCache::new(
        Duration::from_secs(settings.search.cache_ttl_secs),
        settings.search.cache_capacity,
    ));
    let embedding = Arc::new(EmbeddingClient::new(&settings.embedding));
    let text = Arc::new(TextSearchClient::new(&settings.text_engine));
    let orchestrator = Arc::new(SearchOrchestrator::new(
        pool.clone(),
        metrics.clone(),
        health.clone(),
        embedding,
        text,
        cache.clone(),
        config.clone(),
        settings.search.clone(),
        listeners,
    ));

    // Background loops: autoscaler ticks, database probe, cache sweep. The
    // probe tick is also the sole writer of the consecutive-waiters streak,
    // so the health evaluator sees a steady time series.
    let autoscaler_task = tokio::spawn(autoscaler.clone().run());
    let sweeper_task = cache.spawn_sweeper();
    let probe_pool = pool.clone();
    let probe_health = health.clone();
    let probe_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            ticker.tick().await;
            probe_pool.health_probe().await;
            probe_health.observe_waiters(probe_pool.status().waiting);
        }
    });

    let state = AppState {
        settings: settings.clone(),
        config,
        pool: pool.clone(),
        metrics,
        health,
        autoscaler: autoscaler.clone(),
        cache,
        orchestrator,
    };

    let app = Router::new()
        .route("/api/v1/search", post(search_handlers::search))
        .route("/api/v1/pool/status", get(system_handlers::pool_status))
        .route("/api/v1/pool/resize", post(system_handlers::resize_pool))
        .route("/api/v1/metrics", get(system_handlers::metrics_snapshot))
        .route("/api/v1/metrics/history", get(system_handlers::metrics_history))
        .route("/api/v1/health", get(system_handlers::platform_health))
        .route("/api/v1/scaling-events", get(system_handlers::scaling_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", settings.api.host, settings.api.port).parse()?;
    info!("Property search core listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop the control loops, then drain the pool within the grace window.
    autoscaler.stop();
    probe_task.abort();
    sweeper_task.abort();
    let _ = autoscaler_task.await;

    let leaked = pool
        .shutdown(Duration::from_secs(settings.api.shutdown_grace_secs))
        .await;
    if leaked > 0 {
        tracing::warn!(leaked, "Sessions leaked at shutdown");
    }
    info!("Property search core stopped");

    Ok(())
}
