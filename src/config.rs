//! Configuration management for Gatekeeper.
//!
//! Durations are written in milliseconds in configuration files (`*_ms`
//! fields) and exposed as [`Duration`] through accessor methods. Every
//! struct is validated once, at construction of the component using it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::KeySource;

/// Environment variable prefix for layered configuration.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper admission layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gatekeeper configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by
    /// `GATEKEEPER__<SECTION>__<FIELD>` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// Which store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Instance-local, best-effort enforcement.
    #[default]
    Memory,
    /// Shared Redis instance, consistent across gateway instances.
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How often the memory backend drops expired keys
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            cleanup_interval_ms: default_cleanup_interval(),
        }
    }
}

impl StoreConfig {
    /// Cleanup interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.cleanup_interval_ms == 0 {
            return Err(GatekeeperError::Config(
                "store.cleanup_interval_ms must be > 0".to_string(),
            ));
        }
        if self.backend == StoreBackend::Redis
            && self.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(GatekeeperError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cleanup_interval() -> u64 {
    30_000
}

/// What to do when the store cannot produce a decision in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through and log a warning.
    #[default]
    FailOpen,
    /// Reject the request.
    FailClosed,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window when the caller does not override it
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length, also used when a caller passes a zero window
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Namespace prefix for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How the quota key is derived from a request
    #[serde(default)]
    pub key_source: KeySource,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Upper bound on one store round trip
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window(),
            key_prefix: default_key_prefix(),
            key_source: KeySource::default(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl RateLimitConfig {
    /// Default window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Store deadline as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Check limits and windows.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(GatekeeperError::Config(
                "rate_limit.limit must be > 0".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(GatekeeperError::Config(
                "rate_limit.window_ms must be > 0".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(GatekeeperError::Config(
                "rate_limit.key_prefix must not be empty".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "rate_limit.store_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "gatekeeper".to_string()
}

fn default_store_timeout() -> u64 {
    100
}

/// Condition that moves a closed circuit to open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TripPolicy {
    /// Trip once `threshold` failures arrive in a row.
    ConsecutiveFailures { threshold: u32 },
    /// Trip once at least `min_samples` requests were seen and the share of
    /// failures among them reaches `ratio`.
    FailureRatio { ratio: f64, min_samples: u32 },
}

impl Default for TripPolicy {
    fn default() -> Self {
        TripPolicy::ConsecutiveFailures { threshold: 5 }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trip condition evaluated after each report while closed
    #[serde(default)]
    pub trip: TripPolicy,

    /// Consecutive half-open successes needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Closed-state counting period; zero keeps counts until a transition
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Time spent open before a probe is let through
    #[serde(default = "default_open_timeout")]
    pub timeout_ms: u64,

    /// Probes allowed in flight while half-open
    #[serde(default = "default_max_half_open")]
    pub max_half_open_requests: u32,

    /// Store TTL of idle circuit records
    #[serde(default = "default_record_ttl")]
    pub record_ttl_ms: u64,

    /// Namespace prefix for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Upper bound on one store round trip
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip: TripPolicy::default(),
            success_threshold: default_success_threshold(),
            interval_ms: default_interval(),
            timeout_ms: default_open_timeout(),
            max_half_open_requests: default_max_half_open(),
            record_ttl_ms: default_record_ttl(),
            key_prefix: default_key_prefix(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Closed-state counting period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Open-state duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Idle record TTL.
    pub fn record_ttl(&self) -> Duration {
        Duration::from_millis(self.record_ttl_ms)
    }

    /// Store deadline as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Check thresholds and intervals.
    pub fn validate(&self) -> Result<()> {
        match self.trip {
            TripPolicy::ConsecutiveFailures { threshold } if threshold == 0 => {
                return Err(GatekeeperError::Config(
                    "circuit_breaker.trip.threshold must be > 0".to_string(),
                ));
            }
            TripPolicy::FailureRatio { ratio, min_samples } => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(GatekeeperError::Config(format!(
                        "circuit_breaker.trip.ratio must be in (0, 1], got {}",
                        ratio
                    )));
                }
                if min_samples == 0 {
                    return Err(GatekeeperError::Config(
                        "circuit_breaker.trip.min_samples must be > 0".to_string(),
                    ));
                }
            }
            _ => {}
        }
        if self.success_threshold == 0 {
            return Err(GatekeeperError::Config(
                "circuit_breaker.success_threshold must be > 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "circuit_breaker.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_half_open_requests == 0 {
            return Err(GatekeeperError::Config(
                "circuit_breaker.max_half_open_requests must be > 0".to_string(),
            ));
        }
        if self.record_ttl_ms < self.timeout_ms.max(self.interval_ms) {
            return Err(GatekeeperError::Config(
                "circuit_breaker.record_ttl_ms must cover both interval_ms and timeout_ms"
                    .to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(GatekeeperError::Config(
                "circuit_breaker.key_prefix must not be empty".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "circuit_breaker.store_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_success_threshold() -> u32 {
    2
}

fn default_interval() -> u64 {
    60_000
}

fn default_open_timeout() -> u64 {
    30_000
}

fn default_max_half_open() -> u32 {
    1
}

fn default_record_ttl() -> u64 {
    3_600_000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
