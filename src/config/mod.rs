pub mod settings;

pub use settings::{
    ApiSettings, AutoscalePolicy, ConfigHandle, DatabaseSettings, EmbeddingSettings,
    LoggingSettings, PoolRuntimeConfig, SearchSettings, Settings, TextEngineSettings,
};
