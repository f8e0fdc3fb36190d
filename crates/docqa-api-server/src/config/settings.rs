use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub instances: Vec<InstanceConfig>,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub models: ModelRolesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One model-serving endpoint. `models` is the statically configured set;
/// the health monitor refreshes the live set from /api/tags.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub url: String,
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_embedding_dim(),
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorStoreConfig {
    /// Postgres URL of the pgvector-backed store.
    pub url: String,
    #[serde(default = "default_chunk_table")]
    pub chunk_table: String,
    #[serde(default = "default_true")]
    pub category_filters_enabled: bool,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
    #[serde(default = "default_pool_timeout_seconds")]
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RerankerConfig {
    /// Absent URL disables reranking entirely.
    pub url: Option<String>,
    #[serde(default = "default_rerank_timeout_s")]
    pub timeout_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct WebSearchConfig {
    pub url: Option<String>,
    #[serde(default = "default_web_search_timeout_s")]
    pub timeout_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_pool: default_candidate_pool(),
            alpha: default_alpha(),
            max_context_chunks: default_max_context_chunks(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Prompt budget: context window minus the response reservation.
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: usize,
    #[serde(default = "default_memory_turns")]
    pub memory_turns: usize,
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap_per_instance: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_generation_timeout_s(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window_tokens: default_context_window_tokens(),
            memory_turns: default_memory_turns(),
            concurrency_cap_per_instance: default_concurrency_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_s")]
    pub probe_interval_s: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_pick_wait_ms")]
    pub pick_wait_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_s: default_probe_interval_s(),
            failure_threshold: default_failure_threshold(),
            pick_wait_ms: default_pick_wait_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_s")]
    pub answer_ttl_s: u64,
    #[serde(default = "default_cache_max_entries")]
    pub answer_max_entries: usize,
    #[serde(default = "default_embedding_ttl_s")]
    pub embedding_ttl_s: u64,
    #[serde(default = "default_embedding_max_entries")]
    pub embedding_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            answer_ttl_s: default_cache_ttl_s(),
            answer_max_entries: default_cache_max_entries(),
            embedding_ttl_s: default_embedding_ttl_s(),
            embedding_max_entries: default_embedding_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_db_search_concurrency")]
    pub db_search_concurrency: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embedding_concurrency: default_embedding_concurrency(),
            db_search_concurrency: default_db_search_concurrency(),
        }
    }
}

/// Category -> specialized model mapping for the router.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelRolesConfig {
    #[serde(default = "default_code_model")]
    pub code: String,
    #[serde(default = "default_math_model")]
    pub math: String,
    #[serde(default = "default_creative_model")]
    pub creative: String,
    #[serde(default = "default_technical_model")]
    pub technical: String,
    #[serde(default = "default_chat_model")]
    pub chat: String,
}

impl ModelRolesConfig {
    /// Every model the router may generate with, used to size the
    /// generation semaphore and for the last-resort fallback.
    pub fn generation_models(&self) -> Vec<String> {
        let mut models = vec![
            self.code.clone(),
            self.math.clone(),
            self.creative.clone(),
            self.technical.clone(),
            self.chat.clone(),
        ];
        models.sort();
        models.dedup();
        models
    }
}

impl Default for ModelRolesConfig {
    fn default() -> Self {
        Self {
            code: default_code_model(),
            math: default_math_model(),
            creative: default_creative_model(),
            technical: default_technical_model(),
            chat: default_chat_model(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_log_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_log_worker_count")]
    pub worker_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_log_queue_capacity(),
            batch_size: default_log_batch_size(),
            batch_timeout_ms: default_log_batch_timeout_ms(),
            worker_count: default_log_worker_count(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            anyhow::bail!("at least one model-serving instance must be configured");
        }
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            anyhow::bail!("retrieval.alpha must be in [0,1]");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be positive");
        }
        Ok(())
    }

    /// Effective values for /health, with the store URL elided.
    pub fn effective(&self) -> serde_json::Value {
        serde_json::json!({
            "embedding_model": self.embedding.model,
            "embedding_dim": self.embedding.dimension,
            "batch_size": self.embedding.batch_size,
            "batch_window_ms": self.embedding.batch_window_ms,
            "chunk_table": self.vector_store.chunk_table,
            "category_filters_enabled": self.vector_store.category_filters_enabled,
            "reranker_enabled": self.reranker.url.is_some(),
            "web_search_enabled": self.web_search.url.is_some(),
            "web_search_timeout_s": self.web_search.timeout_s,
            "health_probe_interval_s": self.health.probe_interval_s,
            "failure_threshold": self.health.failure_threshold,
            "pick_wait_ms": self.health.pick_wait_ms,
            "generation_timeout_s": self.generation.timeout_s,
            "top_k": self.retrieval.top_k,
            "candidate_pool": self.retrieval.candidate_pool,
            "max_context_chunks": self.retrieval.max_context_chunks,
            "alpha": self.retrieval.alpha,
            "confidence_threshold": self.retrieval.confidence_threshold,
            "cache_ttl_s": self.cache.answer_ttl_s,
            "cache_max_entries": self.cache.answer_max_entries,
            "concurrency_cap_per_instance": self.generation.concurrency_cap_per_instance,
            "log_level": self.server.log_level,
            "metrics_port": self.server.metrics_port,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text:v1.5".to_string()
}

fn default_embedding_dim() -> usize {
    768
}

fn default_batch_size() -> usize {
    16
}

fn default_batch_window_ms() -> u64 {
    10
}

fn default_chunk_table() -> String {
    "document_chunks".to_string()
}

fn default_pool_max_size() -> u32 {
    16
}

fn default_pool_timeout_seconds() -> u64 {
    5
}

fn default_rerank_timeout_s() -> u64 {
    3
}

fn default_web_search_timeout_s() -> u64 {
    8
}

fn default_top_k() -> usize {
    10
}

fn default_candidate_pool() -> usize {
    50
}

fn default_alpha() -> f32 {
    0.7
}

fn default_max_context_chunks() -> usize {
    5
}

fn default_confidence_threshold() -> f32 {
    0.3
}

fn default_generation_timeout_s() -> u64 {
    45
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> usize {
    1024
}

fn default_context_window_tokens() -> usize {
    8192
}

fn default_memory_turns() -> usize {
    6
}

fn default_concurrency_cap() -> usize {
    2
}

fn default_probe_interval_s() -> u64 {
    15
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_pick_wait_ms() -> u64 {
    50
}

fn default_cache_ttl_s() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_embedding_ttl_s() -> u64 {
    86_400
}

fn default_embedding_max_entries() -> usize {
    50_000
}

fn default_embedding_concurrency() -> usize {
    8
}

fn default_db_search_concurrency() -> usize {
    16
}

fn default_code_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_math_model() -> String {
    "deepseek-r1:7b".to_string()
}

fn default_creative_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_technical_model() -> String {
    "mistral:7b".to_string()
}

fn default_chat_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_log_queue_capacity() -> usize {
    10_000
}

fn default_log_batch_size() -> usize {
    100
}

fn default_log_batch_timeout_ms() -> u64 {
    1000
}

fn default_log_worker_count() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_settings() -> Settings {
        Settings {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                metrics_port: None,
                log_level: default_log_level(),
            },
            instances: vec![InstanceConfig {
                name: "local-a".to_string(),
                url: "http://127.0.0.1:11434".to_string(),
                models: vec!["llama3.1:8b".to_string()],
            }],
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig {
                url: "postgres://localhost/docqa".to_string(),
                chunk_table: default_chunk_table(),
                category_filters_enabled: true,
                pool_max_size: default_pool_max_size(),
                pool_timeout_seconds: default_pool_timeout_seconds(),
            },
            reranker: RerankerConfig::default(),
            web_search: WebSearchConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
            models: ModelRolesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_defaults_match_contract() {
        let s = minimal_settings();
        assert_eq!(s.embedding.dimension, 768);
        assert_eq!(s.embedding.batch_size, 16);
        assert_eq!(s.embedding.batch_window_ms, 10);
        assert_eq!(s.retrieval.top_k, 10);
        assert_eq!(s.retrieval.candidate_pool, 50);
        assert!((s.retrieval.alpha - 0.7).abs() < f32::EPSILON);
        assert!((s.retrieval.confidence_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(s.health.probe_interval_s, 15);
        assert_eq!(s.health.failure_threshold, 3);
        assert_eq!(s.health.pick_wait_ms, 50);
        assert_eq!(s.generation.timeout_s, 45);
        assert_eq!(s.cache.answer_ttl_s, 3600);
        assert_eq!(s.cache.answer_max_entries, 10_000);
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut s = minimal_settings();
        s.retrieval.alpha = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_requires_instances() {
        let mut s = minimal_settings();
        s.instances.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_generation_models_dedup() {
        let roles = ModelRolesConfig {
            creative: "llama3.1:8b".to_string(),
            chat: "llama3.1:8b".to_string(),
            ..ModelRolesConfig::default()
        };
        let models = roles.generation_models();
        assert_eq!(models.iter().filter(|m| *m == "llama3.1:8b").count(), 1);
    }
}
