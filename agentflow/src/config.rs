//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden by `AGENTFLOW__*`
//! environment variables (double underscore separates nesting, e.g.
//! `AGENTFLOW__STAGE__TIMEOUT_SECS=30`). Every field has a default, so an
//! empty source yields [`EngineConfig::default`].

use crate::pipeline::{BackoffStrategy, JitterStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AGENTFLOW";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stage timeout and retry defaults.
    pub stage: StageDefaults,
    /// Approval gate settings.
    pub approval: ApprovalConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// `[stage]`: defaults applied to stages that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefaults {
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,
    /// Total attempts per stage.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Backoff base in milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// How the delay grows between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Randomization applied to each delay.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_stage_timeout() -> u64 {
    120
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_stage_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            max_backoff_ms: default_max_backoff(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl StageDefaults {
    /// Returns the per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the retry policy these defaults describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_retries)
            .with_base_delay(Duration::from_millis(self.backoff_base_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_backoff(self.backoff)
            .with_jitter(self.jitter)
    }
}

/// `[approval]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// How long a stage waits for a human decision, in seconds.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

fn default_approval_timeout() -> u64 {
    300
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
        }
    }
}

impl ApprovalConfig {
    /// Returns the wait timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[cache]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Key namespace.
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,
    /// Shared Redis backend; memory only when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_namespace() -> String {
    crate::cache::SEARCH_NAMESPACE.to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            namespace: default_cache_namespace(),
            redis_url: None,
        }
    }
}

impl CacheConfig {
    /// Returns the default TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Loads configuration from an optional file plus `AGENTFLOW__*` variables.
///
/// A missing file is skipped; a malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
