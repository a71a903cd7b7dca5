//! Engine configuration.
//!
//! Values come from a YAML file named by `ENGINE_CONFIG`, or from defaults
//! overlaid with `ENGINE_*` environment variables. Every constructor in the
//! engine validates its section eagerly.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::{EngineError, Result};

/// Eviction policy used by the block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Arc,
}

impl FromStr for EvictionPolicyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "arc" => Ok(Self::Arc),
            other => Err(EngineError::InvalidConfig(format!("unknown eviction policy '{other}'"))),
        }
    }
}

/// Longest-prefix matcher used by the prefix cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    Radix,
    /// Reference implementation: linear scan over all cached prefixes.
    Linear,
}

impl FromStr for MatcherKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "radix" => Ok(Self::Radix),
            "linear" => Ok(Self::Linear),
            other => Err(EngineError::InvalidConfig(format!("unknown prefix matcher '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of running requests (batch size cap).
    pub max_num_seqs: usize,
    /// Maximum number of tokens scheduled in one step.
    pub max_num_batched_tokens: usize,
    /// Prompt plus output may not reach this length.
    pub max_model_len: usize,
    /// Number of recently finished request IDs remembered.
    pub finished_history_size: usize,
    pub finished_history_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 8192,
            max_model_len: 32768,
            finished_history_size: 4096,
            finished_history_ttl_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(EngineError::InvalidConfig("max_num_seqs must be > 0".into()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(EngineError::InvalidConfig("max_num_batched_tokens must be > 0".into()));
        }
        if self.max_model_len < 2 {
            return Err(EngineError::InvalidConfig("max_model_len must be >= 2".into()));
        }
        if self.finished_history_size == 0 {
            return Err(EngineError::InvalidConfig("finished_history_size must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per KV block.
    pub block_size: usize,
    /// Total blocks in the pool.
    pub num_blocks: usize,
    pub enable_prefix_caching: bool,
    pub eviction_policy: EvictionPolicyKind,
    /// Cached blocks tracked by the eviction policy before it evicts on store.
    /// Defaults to `num_blocks`.
    pub policy_capacity: Option<usize>,
    pub hash_seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 4096,
            enable_prefix_caching: true,
            eviction_policy: EvictionPolicyKind::Lru,
            policy_capacity: None,
            hash_seed: 0x5eed,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(EngineError::InvalidConfig("block_size must be > 0".into()));
        }
        if self.num_blocks == 0 {
            return Err(EngineError::InvalidConfig("num_blocks must be > 0".into()));
        }
        if self.num_blocks > u32::MAX as usize {
            return Err(EngineError::InvalidConfig("num_blocks exceeds u32 block ids".into()));
        }
        if self.policy_capacity == Some(0) {
            return Err(EngineError::InvalidConfig("policy_capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixCacheConfig {
    /// Maximum number of cached prefixes.
    pub capacity: usize,
    /// Hit count at which an entry becomes HOT.
    pub hot_threshold: u64,
    /// Hit count at which an entry is reported as a pre-warm candidate.
    pub prewarm_threshold: u64,
    /// WARM entries idle for longer than this are demoted to COLD before eviction.
    pub warm_timeout_ms: u64,
    pub matcher: MatcherKind,
}

impl Default for PrefixCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            hot_threshold: 8,
            prewarm_threshold: 4,
            warm_timeout_ms: 60_000,
            matcher: MatcherKind::Radix,
        }
    }
}

impl PrefixCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(EngineError::InvalidConfig("prefix cache capacity must be > 0".into()));
        }
        if self.hot_threshold == 0 {
            return Err(EngineError::InvalidConfig("hot_threshold must be > 0".into()));
        }
        if self.prewarm_threshold == 0 {
            return Err(EngineError::InvalidConfig("prewarm_threshold must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Workers sampled per decision.
    pub sample_size: usize,
    /// Consecutive failures tolerated before a worker is marked FAILED.
    pub failure_threshold: u32,
    /// Fixed RNG seed; entropy-seeded when unset.
    pub seed: Option<u64>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self { sample_size: 2, failure_threshold: 3, seed: None }
    }
}

impl LoadBalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            return Err(EngineError::InvalidConfig("sample_size must be > 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(EngineError::InvalidConfig("failure_threshold must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub prefix_cache: PrefixCacheConfig,
    pub load_balancer: LoadBalancerConfig,
    /// In-flight batches allowed by the pipelined step.
    pub batch_queue_size: usize,
    /// Sleep between steps of the engine queue while work is blocked.
    pub idle_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            prefix_cache: PrefixCacheConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            batch_queue_size: 2,
            idle_tick_ms: 2,
        }
    }
}

impl EngineConfig {
    /// Load from `ENGINE_CONFIG` if set, else defaults with `ENGINE_*` overrides.
    pub fn load() -> Result<Self> {
        let cfg = match env::var("ENGINE_CONFIG") {
            Ok(path) => Self::from_path(path)?,
            Err(_) => {
                let mut cfg = Self::default();
                cfg.apply_env()?;
                cfg
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.cache.validate()?;
        self.prefix_cache.validate()?;
        self.load_balancer.validate()?;
        if self.batch_queue_size == 0 {
            return Err(EngineError::InvalidConfig("batch_queue_size must be > 0".into()));
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("ENGINE_MAX_NUM_SEQS")? { self.scheduler.max_num_seqs = v; }
        if let Some(v) = env_parse("ENGINE_MAX_BATCHED_TOKENS")? { self.scheduler.max_num_batched_tokens = v; }
        if let Some(v) = env_parse("ENGINE_MAX_MODEL_LEN")? { self.scheduler.max_model_len = v; }
        if let Some(v) = env_parse("ENGINE_BLOCK_SIZE")? { self.cache.block_size = v; }
        if let Some(v) = env_parse("ENGINE_NUM_BLOCKS")? { self.cache.num_blocks = v; }
        if let Some(v) = env_parse("ENGINE_PREFIX_CACHING")? { self.cache.enable_prefix_caching = v; }
        if let Some(v) = env_parse("ENGINE_EVICTION_POLICY")? { self.cache.eviction_policy = v; }
        if let Some(v) = env_parse("ENGINE_PREFIX_MATCHER")? { self.prefix_cache.matcher = v; }
        if let Some(v) = env_parse("ENGINE_BATCH_QUEUE_SIZE")? { self.batch_queue_size = v; }
        if let Some(v) = env_parse("ENGINE_IDLE_TICK_MS")? { self.idle_tick_ms = v; }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{key}={raw} is not valid"))),
        Err(_) => Ok(None),
    }
}
