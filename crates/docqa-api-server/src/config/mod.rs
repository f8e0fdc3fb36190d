pub mod settings;

pub use settings::{
    CacheConfig, EmbeddingConfig, GenerationConfig, HealthConfig, InstanceConfig, LimitsConfig,
    LoggingConfig, ModelRolesConfig, RerankerConfig, RetrievalConfig, ServerConfig, Settings,
    VectorStoreConfig, WebSearchConfig,
};
