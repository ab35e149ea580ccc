//! TOML configuration parsing and validation.
//!
//! Every tunable of the pipeline has a serde default matching the deployed
//! defaults, so a minimal config only needs a database path. See
//! `config/fhx.example.toml` for a full annotated example.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank_cache: RerankCacheConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Carry-over between consecutive chunks; character fallback only.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_min_chars() -> usize {
    500
}
fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum in-flight items; admissions beyond this are rejected.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Worker count. `0` resolves to the hardware thread count, floor 2.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_s")]
    pub retry_base_delay_s: u64,
    #[serde(default = "default_retry_max_delay_s")]
    pub retry_max_delay_s: u64,
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,
    /// How long `submit` may wait for queue room before reporting
    /// `queue_full`. The deployed default does not wait.
    #[serde(default)]
    pub enqueue_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: 0,
            max_retries: default_max_retries(),
            retry_base_delay_s: default_retry_base_delay_s(),
            retry_max_delay_s: default_retry_max_delay_s(),
            drain_timeout_s: default_drain_timeout_s(),
            enqueue_wait_ms: 0,
        }
    }
}

impl QueueConfig {
    /// Resolve the configured worker count, defaulting to the number of
    /// hardware threads with a floor of two.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay_s() -> u64 {
    1
}
fn default_retry_max_delay_s() -> u64 {
    60
}
fn default_drain_timeout_s() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: u32,
    #[serde(default = "default_pool_overflow")]
    pub overflow: u32,
    #[serde(default = "default_pool_acquire_timeout_s")]
    pub acquire_timeout_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            overflow: default_pool_overflow(),
            acquire_timeout_s: default_pool_acquire_timeout_s(),
        }
    }
}

fn default_pool_size() -> u32 {
    10
}
fn default_pool_overflow() -> u32 {
    5
}
fn default_pool_acquire_timeout_s() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidate count fetched per side before fusion and truncation.
    #[serde(default = "default_k_retrieve")]
    pub k_retrieve: usize,
    #[serde(default = "default_weight")]
    pub weight_sparse: f64,
    #[serde(default = "default_weight")]
    pub weight_dense: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_retrieve: default_k_retrieve(),
            weight_sparse: default_weight(),
            weight_dense: default_weight(),
        }
    }
}

fn default_k_retrieve() -> usize {
    50
}
fn default_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankCacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,
}

impl Default for RerankCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_s: default_cache_ttl_s(),
        }
    }
}

fn default_cache_max_entries() -> usize {
    10_000
}
fn default_cache_ttl_s() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ollama"`, or `"disabled"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: default_dims(),
            base_url: None,
            timeout_s: default_provider_timeout_s(),
            max_retries: default_provider_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `"http"` or `"disabled"`. Disabled degrades rerank calls to
    /// hybrid order instead of failing them.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout_s")]
    pub timeout_s: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: None,
            timeout_s: default_provider_timeout_s(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1024
}
fn default_provider_timeout_s() -> u64 {
    30
}
fn default_provider_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8600".to_string()
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.min_chars == 0 || config.chunking.max_chars <= config.chunking.min_chars {
        bail!(
            "chunking: max_chars ({}) must exceed min_chars ({}) and min_chars must be positive",
            config.chunking.max_chars,
            config.chunking.min_chars
        );
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking: overlap_chars must be smaller than max_chars");
    }
    if config.queue.capacity == 0 {
        bail!("queue: capacity must be positive");
    }
    if config.retrieval.weight_sparse < 0.0 || config.retrieval.weight_dense < 0.0 {
        bail!("retrieval: weights must be non-negative");
    }
    if config.pool.size == 0 {
        bail!("pool: size must be positive");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"data/fhx.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.min_chars, 500);
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.retry_base_delay_s, 1);
        assert_eq!(config.queue.retry_max_delay_s, 60);
        assert_eq!(config.queue.drain_timeout_s, 30);
        assert_eq!(config.pool.size, 10);
        assert_eq!(config.pool.overflow, 5);
        assert_eq!(config.retrieval.k_retrieve, 50);
        assert_eq!(config.retrieval.weight_sparse, 0.5);
        assert_eq!(config.rerank_cache.max_entries, 10_000);
        assert_eq!(config.rerank_cache.ttl_s, 3600);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.embedding.dims, 1024);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_workers_floor() {
        let queue = QueueConfig::default();
        assert!(queue.resolved_workers() >= 2);
        let explicit = QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        };
        assert_eq!(explicit.resolved_workers(), 1);
    }

    #[test]
    fn test_validate_rejects_inverted_chunk_limits() {
        let mut config: Config = toml::from_str("[db]\npath = \"x\"\n").unwrap();
        config.chunking.min_chars = 1000;
        config.chunking.max_chars = 500;
        assert!(validate(&config).is_err());
    }
}
