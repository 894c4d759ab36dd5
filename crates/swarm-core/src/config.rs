//! The configuration value the core consumes (spec §1: "the core consumes
//! an already-validated configuration value"; file-format parsing is the
//! CLI's job). Grounded on `examples/original_source/src/claudeswarm/config.py`'s
//! schema and defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub ack: AckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limiting: RateLimitConfig::default(),
            locking: LockingConfig::default(),
            discovery: DiscoveryConfig::default(),
            ack: AckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_messages: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    pub stale_timeout_secs: u64,
    pub default_reason: String,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 300,
            default_reason: "working".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub stale_threshold_secs: u64,
    pub auto_refresh_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 60,
            auto_refresh_interval_secs: 30,
        }
    }
}

impl DiscoveryConfig {
    pub const MIN_STALE_THRESHOLD_SECS: u64 = 10;
    pub const MAX_STALE_THRESHOLD_SECS: u64 = 3600;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    pub max_retries: u32,
    pub retry_backoff_secs: Vec<u64>,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_secs: vec![30, 60, 120],
        }
    }
}
