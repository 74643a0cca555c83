pub mod embedding_client;
pub mod events;
pub mod result_cache;
pub mod search_orchestrator;
pub mod text_search_client;

pub use embedding_client::EmbeddingClient;
pub use events::{PoolEventListener, TracingEventListener};
pub use result_cache::ResultCache;
pub use search_orchestrator::SearchOrchestrator;
pub use text_search_client::TextSearchClient;
