use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub vacuum: VacuumConfig,
    #[serde(default)]
    pub reranking: RerankingConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

/// Ingestion worker pool and file intake limits.
#[derive(Clone, Deserialize, Debug)]
pub struct IngestConfig {
    pub workers: usize,
    pub retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub ignore_globs: Vec<String>,
    pub max_file_bytes: u64,
    pub debounce_ms: u64,
    /// Task-level failure threshold in percent; 100 means the task only
    /// fails when every file failed.
    pub failure_threshold_pct: u8,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            ignore_globs: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
            max_file_bytes: 5 * 1024 * 1024,
            debounce_ms: 500,
            failure_threshold_pct: 100,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct RetrievalConfig {
    pub overfetch_rerank: f32,
    pub overfetch: f32,
    pub hard_max_candidates: usize,
    pub rrf_k: f32,
    pub tokens_per_char_divisor: usize,
    pub per_result_token_overhead: usize,
    pub cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            overfetch_rerank: 4.0,
            overfetch: 1.5,
            hard_max_candidates: 256,
            rrf_k: 60.0,
            tokens_per_char_divisor: 4,
            per_result_token_overhead: 8,
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct ConsolidationConfig {
    pub temperature: f32,
    pub max_pairs_per_run: usize,
    /// Minimum cosine similarity for a pair to be considered at all.
    pub similarity_floor: f32,
    pub schema_retry_attempts: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_pairs_per_run: 32,
            similarity_floor: 0.85,
            schema_retry_attempts: 2,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CacheConfig {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 300,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct VacuumConfig {
    /// How long a chunk must have been deletion-eligible before physical purge.
    pub grace_window_days: i64,
    pub interval_secs: u64,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            grace_window_days: 14,
            interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct RerankingConfig {
    pub enabled: bool,
    pub pool_size: Option<usize>,
    pub max_docs_per_call: usize,
    pub cache_dir: Option<String>,
}

impl Default for RerankingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: None,
            max_docs_per_call: 32,
            cache_dir: None,
        }
    }
}

/// Capability bindings plus the provider definitions they point at.
#[derive(Clone, Deserialize, Debug, Default)]
pub struct BackendsConfig {
    /// Backend id -> provider definition.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Capability name -> ordered backend ids (primary first).
    #[serde(default)]
    pub bindings: HashMap<String, Vec<String>>,
}

impl BackendsConfig {
    pub fn binding(&self, capability: &str) -> &[String] {
        self.bindings
            .get(capability)
            .map_or(&[], |ids| ids.as_slice())
    }
}

/// One concrete backend definition; `kind` selects the implementation.
#[derive(Clone, Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// OpenAI-compatible HTTP API (embeddings + JSON completions).
    Openai {
        api_key: String,
        #[serde(default = "default_openai_base_url")]
        base_url: String,
        #[serde(default = "default_embedding_model")]
        embedding_model: String,
        #[serde(default = "default_embedding_dimensions")]
        embedding_dimensions: u32,
        #[serde(default = "default_completion_model")]
        completion_model: String,
    },
    /// Local fastembed models (embeddings + reranking), no network at query time.
    Fastembed {
        #[serde(default)]
        cache_dir: Option<String>,
        #[serde(default = "default_local_dimension")]
        dimension: usize,
    },
    /// Deterministic in-process backend used by the test suites.
    Fixture {
        #[serde(default = "default_fixture_dimension")]
        dimension: usize,
    },
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_local_dimension() -> usize {
    384
}

fn default_fixture_dimension() -> usize {
    32
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Configuration for tests: in-memory database, fixture backends bound to
    /// every capability the pipelines use.
    pub fn for_tests() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "fixture".to_string(),
            ProviderConfig::Fixture { dimension: 32 },
        );

        let mut bindings = HashMap::new();
        for capability in [
            "text-embedding",
            "code-embedding",
            "contextualized-embedding",
            "json-completion",
            "text-reranking",
        ] {
            bindings.insert(capability.to_string(), vec!["fixture".to_string()]);
        }

        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "test".to_string(),
            surrealdb_password: "test".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            data_dir: "./data".to_string(),
            http_port: 0,
            ingest: IngestConfig::default(),
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            cache: CacheConfig::default(),
            vacuum: VacuumConfig::default(),
            reranking: RerankingConfig::default(),
            backends: BackendsConfig {
                providers,
                bindings,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let ingest = IngestConfig::default();
        assert!(ingest.workers >= 1);
        assert_eq!(ingest.max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(ingest.debounce_ms, 500);

        let retrieval = RetrievalConfig::default();
        assert!((retrieval.rrf_k - 60.0).abs() < f32::EPSILON);
        assert!(retrieval.overfetch_rerank > retrieval.overfetch);

        let vacuum = VacuumConfig::default();
        assert_eq!(vacuum.grace_window_days, 14);
    }

    #[test]
    fn test_config_binds_every_capability_to_fixture() {
        let config = AppConfig::for_tests();
        for capability in ["text-embedding", "json-completion", "text-reranking"] {
            assert_eq!(config.backends.binding(capability), ["fixture".to_string()]);
        }
        assert!(config.backends.binding("unknown-capability").is_empty());
    }
}
