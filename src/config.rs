//! Configuration management for Gatekeeper.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};
use crate::store::BreakerConfig;
use crate::throttle::ThrottlerConfig;

/// Prefix for environment overrides, e.g. `GATEKEEPER__STORE__URL`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Backing store
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker guarding the store
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Named limiters
    #[serde(default = "default_limiters")]
    pub limiters: Vec<LimiterConfig>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            breaker: BreakerSettings::default(),
            limiters: default_limiters(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Circuit breaker settings as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_error_threshold_percentage")]
    pub error_threshold_percentage: u32,

    #[serde(default = "default_request_volume_threshold")]
    pub request_volume_threshold: u64,

    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,

    #[serde(default = "default_rolling_buckets")]
    pub rolling_buckets: u32,

    #[serde(default = "default_sleep_window_ms")]
    pub sleep_window_ms: u64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Per-call deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            error_threshold_percentage: default_error_threshold_percentage(),
            request_volume_threshold: default_request_volume_threshold(),
            rolling_window_ms: default_rolling_window_ms(),
            rolling_buckets: default_rolling_buckets(),
            sleep_window_ms: default_sleep_window_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl BreakerSettings {
    /// Convert into the breaker's own configuration type.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            error_threshold_percentage: self.error_threshold_percentage,
            request_volume_threshold: self.request_volume_threshold,
            rolling_window: Duration::from_millis(self.rolling_window_ms),
            rolling_buckets: self.rolling_buckets,
            sleep_window: Duration::from_millis(self.sleep_window_ms),
            max_concurrent_requests: self.max_concurrent_requests,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn default_error_threshold_percentage() -> u32 {
    50
}

fn default_request_volume_threshold() -> u64 {
    10
}

fn default_rolling_window_ms() -> u64 {
    10_000
}

fn default_rolling_buckets() -> u32 {
    10
}

fn default_sleep_window_ms() -> u64 {
    5_000
}

fn default_max_concurrent_requests() -> usize {
    20_000
}

fn default_timeout_ms() -> u64 {
    500
}

/// One named limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Lookup name
    pub name: String,

    /// Key namespace; defaults to the name
    #[serde(default)]
    pub key_type: Option<String>,

    pub attempt_limit: i64,

    pub attempt_window_secs: u64,

    pub base_timeout_secs: u64,

    pub max_timeout_secs: u64,

    #[serde(default = "default_timeout_scale_factor")]
    pub timeout_scale_factor: f64,
}

impl LimiterConfig {
    /// Convert into a throttler configuration.
    pub fn throttler_config(&self) -> ThrottlerConfig {
        ThrottlerConfig {
            key_type: self.key_type.clone().unwrap_or_else(|| self.name.clone()),
            attempt_limit: self.attempt_limit,
            attempt_window: Duration::from_secs(self.attempt_window_secs),
            base_timeout: Duration::from_secs(self.base_timeout_secs),
            max_timeout: Duration::from_secs(self.max_timeout_secs),
            timeout_scale_factor: self.timeout_scale_factor,
        }
    }
}

fn default_timeout_scale_factor() -> f64 {
    2.0
}

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// The limiters of a stock deployment.
pub fn default_limiters() -> Vec<LimiterConfig> {
    vec![
        LimiterConfig {
            name: "request".to_string(),
            key_type: None,
            attempt_limit: 400,
            attempt_window_secs: 10 * MINUTE,
            base_timeout_secs: MINUTE,
            max_timeout_secs: DAY,
            timeout_scale_factor: 30.0,
        },
        LimiterConfig {
            name: "user_login".to_string(),
            key_type: None,
            attempt_limit: 10,
            attempt_window_secs: MINUTE,
            base_timeout_secs: MINUTE,
            max_timeout_secs: DAY,
            timeout_scale_factor: 2.0,
        },
        LimiterConfig {
            name: "user_register".to_string(),
            key_type: None,
            attempt_limit: 10,
            attempt_window_secs: MINUTE,
            base_timeout_secs: MINUTE,
            max_timeout_secs: DAY,
            timeout_scale_factor: 2.0,
        },
    ]
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional file layered under `GATEKEEPER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every section for unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(GatekeeperError::Config("store.url must not be empty".to_string()));
        }
        self.breaker
            .breaker_config()
            .validate()
            .map_err(|e| GatekeeperError::Config(format!("breaker: {e}")))?;
        for limiter in &self.limiters {
            limiter.throttler_config().validate()?;
        }
        Ok(())
    }
}
