pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

use std::sync::Arc;

use config::{ConfigHandle, Settings};
use database::{Autoscaler, HealthEvaluator, MetricsAggregator, PoolController};
use services::{ResultCache, SearchOrchestrator};

/// Shared state handed to Axum handlers. Built once by the composition root;
/// every component is constructed explicitly and passed in.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub config: Arc<ConfigHandle>,
    pub pool: Arc<PoolController>,
    pub metrics: Arc<MetricsAggregator>,
    pub health: Arc<HealthEvaluator>,
    pub autoscaler: Arc<Autoscaler>,
    pub cache: Arc<ResultCache>,
    pub orchestrator: Arc<SearchOrchestrator>,
}
