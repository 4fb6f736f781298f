//! In-process store.
//!
//! Each key lives in one `DashMap` shard and every operation holds that
//! shard's write guard for its whole read-modify-write, which gives the same
//! per-key atomicity a Lua script gives on Redis. Counters are only visible
//! to this process.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Store, StoreMode, Versioned, WindowOutcome, WindowRequest};
use crate::circuit::CircuitRecord;
use crate::clock::{duration_ms, Clock, SystemClock};
use crate::error::StoreError;

/// Timestamps of one sliding window, as score -> number of entries.
#[derive(Debug, Default)]
struct WindowSet {
    entries: BTreeMap<u64, u32>,
    len: u64,
    expires_at_ms: u64,
}

impl WindowSet {
    /// Drop entries with a score at or below `cutoff`.
    fn prune(&mut self, cutoff: u64) {
        let live = self.entries.split_off(&(cutoff.saturating_add(1)));
        let removed: u64 = self.entries.values().map(|n| *n as u64).sum();
        self.entries = live;
        self.len -= removed;
    }

    fn insert(&mut self, score: u64) {
        *self.entries.entry(score).or_insert(0) += 1;
        self.len += 1;
    }

    fn live(&self, cutoff: u64) -> u64 {
        self.entries
            .range(cutoff.saturating_add(1)..)
            .map(|(_, n)| *n as u64)
            .sum()
    }
}

#[derive(Debug)]
struct StoredCircuit {
    record: CircuitRecord,
    revision: u64,
    expires_at_ms: u64,
}

/// Store backed by process memory.
pub struct MemoryStore {
    windows: DashMap<String, WindowSet>,
    circuits: DashMap<String, StoredCircuit>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry sweep uses `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            circuits: DashMap::new(),
            clock,
        }
    }

    /// Drop every window and circuit whose TTL has passed.
    ///
    /// Returns the number of keys removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.windows.len() + self.circuits.len();
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        self.circuits.retain(|_, c| c.expires_at_ms > now_ms);
        before.saturating_sub(self.windows.len() + self.circuits.len())
    }

    /// Number of window keys currently held.
    pub fn window_keys(&self) -> usize {
        self.windows.len()
    }

    /// Number of circuit keys currently held.
    pub fn circuit_keys(&self) -> usize {
        self.circuits.len()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.purge_expired(store.clock.now_ms());
                        if removed > 0 {
                            debug!(removed = removed, "Purged expired admission state");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Memory store cleanup loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Local
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn sliding_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        let mut window = self.windows.entry(key.to_string()).or_default();

        if window.expires_at_ms != 0 && window.expires_at_ms <= request.now_ms {
            *window = WindowSet::default();
        }
        window.prune(request.cutoff());

        let count = window.len;
        let admitted = count < request.limit;
        if admitted {
            window.insert(request.now_ms);
            window.expires_at_ms = request.now_ms.saturating_add(request.window_ms);
        }

        trace!(key = %key, count = count, admitted = admitted, "Memory window checked");
        Ok(WindowOutcome { count, admitted })
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        Ok(self
            .windows
            .get(key)
            .filter(|w| w.expires_at_ms > now_ms)
            .map(|w| w.live(now_ms.saturating_sub(window_ms)))
            .unwrap_or(0))
    }

    async fn clear_window(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }

    async fn load_circuit(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<CircuitRecord>>, StoreError> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .circuits
            .get(key)
            .filter(|c| c.expires_at_ms > now_ms)
            .map(|c| Versioned {
                value: c.record.clone(),
                revision: c.revision,
            }))
    }

    async fn save_circuit(
        &self,
        key: &str,
        expected_revision: u64,
        record: &CircuitRecord,
        ttl: Duration,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let expires_at_ms = now_ms.saturating_add(duration_ms(ttl));

        match self.circuits.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let current = if stored.expires_at_ms > now_ms {
                    stored.revision
                } else {
                    0
                };
                if current != expected_revision {
                    return Ok(false);
                }
                stored.record = record.clone();
                stored.revision = current + 1;
                stored.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected_revision != 0 {
                    return Ok(false);
                }
                vacant.insert(StoredCircuit {
                    record: record.clone(),
                    revision: 1,
                    expires_at_ms,
                });
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
