//! Error types for the Gatekeeper admission layer.

use std::time::Duration;

use thiserror::Error;

use crate::circuit::CircuitState;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid limits, windows or thresholds. Raised at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not be reached within the deadline.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A rate limit quota has been used up for the current window.
    #[error("Rate limit exceeded for {key}: limit {limit} per {window:?}")]
    LimitExceeded {
        key: String,
        limit: u64,
        window: Duration,
    },

    /// The circuit for a resource refuses traffic.
    #[error("Circuit for {resource} is {state}")]
    CircuitOpen {
        resource: String,
        state: CircuitState,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised by a [`Store`](crate::store::Store) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend refused or dropped the connection.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The round trip did not finish before the deadline.
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// Compare-and-swap lost too many races in a row.
    #[error("too much contention on {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    /// The stored data could not be decoded.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
