//! Shared state backends for rate limiting and circuit breaking.
//!
//! A [`Store`] exposes two composite operations that must each execute
//! atomically on the backend: the sliding-window check (prune, count,
//! conditional add, expire) and the compare-and-swap of a circuit record
//! (read revision, write fields, bump revision, expire). Any backend that
//! provides these two atomically can back both components.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::time::Duration;

use crate::circuit::CircuitRecord;
use crate::error::StoreError;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Whether a store is shared between gateway instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Every instance sees the same counters.
    Shared,
    /// Counters live in this process only; enforcement is per instance.
    Local,
}

/// Input of one sliding-window check.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Current time in epoch millis, used as the entry score
    pub now_ms: u64,
    /// Window length in millis
    pub window_ms: u64,
    /// Maximum live entries
    pub limit: u64,
    /// Unique member name for the new entry
    pub member: String,
}

impl WindowRequest {
    /// Entries with a score at or below this value no longer count.
    pub fn cutoff(&self) -> u64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// Output of one sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Live entries before this request
    pub count: u64,
    /// Whether this request was recorded
    pub admitted: bool,
}

/// A value together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    /// Revision, starting at 1 for the first write
    pub revision: u64,
}

/// Backend for admission state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether this store is shared across instances.
    fn mode(&self) -> StoreMode;

    /// Human readable backend name for logs.
    fn name(&self) -> &'static str;

    /// Prune expired entries, count the rest and add `member` if the count is
    /// below the limit, as one atomic step.
    async fn sliding_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError>;

    /// Live entries under `key` at `now_ms`.
    async fn window_count(&self, key: &str, now_ms: u64, window_ms: u64)
        -> Result<u64, StoreError>;

    /// Remove every entry under `key`.
    async fn clear_window(&self, key: &str) -> Result<(), StoreError>;

    /// Read a circuit record.
    async fn load_circuit(&self, key: &str)
        -> Result<Option<Versioned<CircuitRecord>>, StoreError>;

    /// Write a circuit record if the stored revision still equals
    /// `expected_revision` (0 for a record that does not exist yet).
    /// Returns `false` when another writer got there first.
    async fn save_circuit(
        &self,
        key: &str,
        expected_revision: u64,
        record: &CircuitRecord,
        ttl: Duration,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Check that the backend answers.
    async fn ping(&self) -> Result<(), StoreError>;
}
