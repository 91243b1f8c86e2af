//! Configuration management for the dialectic engine
//!
//! Loaded from `.dialectic/config.toml` under a root directory. Every field
//! has a default so a partial (or missing) file is fine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{DialecticError, Result};

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialecticConfig {
    /// Continuation loop bounds
    #[serde(default)]
    pub continuation: ContinuationSettings,

    /// Per-model retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Provider connection settings
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Parallelism across models
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationSettings {
    /// Extra calls allowed after the first (4 means at most 5 calls)
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,

    /// When false a truncated response is returned after a single call
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Full attempts per model within a job
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Completion budget per call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries on HTTP 429 inside a single call
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_max_parallel_models")]
    pub max_parallel_models: usize,
}

/// Bound injected into the continuation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationConfig {
    pub max_continuations: u32,
}

impl ContinuationConfig {
    pub const DEFAULT_MAX_CONTINUATIONS: u32 = 4;

    pub fn new(max_continuations: u32) -> Self {
        Self { max_continuations }
    }

    /// A single call, never continued
    pub fn single_call() -> Self {
        Self::new(0)
    }

    /// Upper bound on provider calls
    pub fn max_calls(&self) -> u32 {
        self.max_continuations + 1
    }
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CONTINUATIONS)
    }
}

// Default value providers
fn default_max_continuations() -> u32 {
    ContinuationConfig::DEFAULT_MAX_CONTINUATIONS
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_max_parallel_models() -> usize {
    4
}

impl DialecticConfig {
    /// Load configuration from `.dialectic/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".dialectic/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DialecticError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.dialectic/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".dialectic");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| DialecticError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            return Err(DialecticError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_parallel_models == 0 {
            return Err(DialecticError::Config(
                "concurrency.max_parallel_models must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Continuation bound derived from the `continuation` section
    pub fn continuation_config(&self) -> ContinuationConfig {
        if self.continuation.enabled {
            ContinuationConfig::new(self.continuation.max_continuations)
        } else {
            ContinuationConfig::single_call()
        }
    }
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            max_continuations: default_max_continuations(),
            enabled: true,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_parallel_models: default_max_parallel_models(),
        }
    }
}
