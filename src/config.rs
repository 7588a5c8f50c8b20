//! TOML configuration for discovery and the upstream cache

use crate::cache::CacheConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Instance discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Upstream cache settings
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Only instances whose name starts with this prefix are considered.
    /// Empty (the default) matches all instances.
    #[serde(default)]
    pub node_name_prefix: String,

    /// Only use instances whose status is RUNNING (default: true)
    #[serde(default = "default_running_only")]
    pub running_only: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_name_prefix: String::new(),
            running_only: default_running_only(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Service port joined with every discovered address (default: 30080)
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Snapshot age in seconds before a refresh is triggered (default: 60)
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// Seconds between retries inside a failed refresh session (default: 60)
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Hold back newly observed addresses until they have been seen
    /// continuously for the debounce window (default: true)
    #[serde(default = "default_debounce")]
    pub debounce: bool,

    /// Debounce window in seconds (default: 300)
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            service_port: default_service_port(),
            freshness_secs: default_freshness_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            debounce: default_debounce(),
            debounce_secs: default_debounce_secs(),
        }
    }
}

fn default_running_only() -> bool {
    true
}

fn default_service_port() -> u16 {
    30080
}

fn default_freshness_secs() -> u64 {
    60
}

fn default_retry_backoff_secs() -> u64 {
    60
}

fn default_debounce() -> bool {
    true
}

fn default_debounce_secs() -> u64 {
    300
}

impl CacheSettings {
    /// Convert the file-level settings into the cache's runtime config.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            service_port: self.service_port,
            freshness_window: Duration::from_secs(self.freshness_secs),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            debounce_window: self
                .debounce
                .then(|| Duration::from_secs(self.debounce_secs)),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.cache.service_port == 0 {
            errors.push("cache.service_port must be non-zero".to_string());
        }
        if self.cache.freshness_secs == 0 {
            errors.push("cache.freshness_secs must be non-zero".to_string());
        }
        if self.cache.retry_backoff_secs == 0 {
            errors.push("cache.retry_backoff_secs must be non-zero".to_string());
        }
        if self.cache.debounce && self.cache.debounce_secs == 0 {
            errors.push("cache.debounce_secs must be non-zero when debounce is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "))
        }
    }
}
