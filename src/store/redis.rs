//! Redis-backed store shared by every gateway instance.
//!
//! Windows are sorted sets scored by epoch millis; circuits are hashes with a
//! `revision` field. Both composite operations run as Lua scripts so each is
//! a single atomic round trip.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, trace};

use super::{Store, StoreMode, Versioned, WindowOutcome, WindowRequest};
use crate::circuit::{CircuitRecord, CircuitState, Counts};
use crate::clock::duration_ms;
use crate::error::StoreError;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = ARGV[1]
local cutoff = ARGV[2]
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl_ms = ARGV[5]

redis.call("ZREMRANGEBYSCORE", key, "-inf", cutoff)
local count = redis.call("ZCARD", key)

if count < limit then
    redis.call("ZADD", key, now_ms, member)
    redis.call("PEXPIRE", key, ttl_ms)
    return {count, 1}
end

return {count, 0}
"#;

const SAVE_CIRCUIT_SCRIPT: &str = r#"
local key = KEYS[1]
local current = tonumber(redis.call("HGET", key, "revision") or "0")

if current ~= tonumber(ARGV[1]) then
    return 0
end

redis.call("HSET", key,
    "state", ARGV[2],
    "generation", ARGV[3],
    "requests", ARGV[4],
    "successes", ARGV[5],
    "failures", ARGV[6],
    "consecutive_successes", ARGV[7],
    "consecutive_failures", ARGV[8],
    "expiry_ms", ARGV[9])
redis.call("HINCRBY", key, "revision", 1)
redis.call("PEXPIRE", key, ARGV[10])

return 1
"#;

/// Longest key expiry handed to `PEXPIRE`. Redis rejects expiries that
/// overflow its signed millisecond clock.
const MAX_KEY_TTL_MS: u64 = i64::MAX as u64 / 2;

fn key_ttl_ms(ttl_ms: u64) -> u64 {
    ttl_ms.clamp(1, MAX_KEY_TTL_MS)
}

/// Store backed by a Redis server.
pub struct RedisStore {
    connection: ConnectionManager,
    window_script: Script,
    save_script: Script,
}

impl RedisStore {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!(url = %url, "Connected to redis store");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            save_script: Script::new(SAVE_CIRCUIT_SCRIPT),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Shared
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn sliding_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        let mut connection = self.connection.clone();
        let (count, admitted): (u64, u8) = self
            .window_script
            .key(key)
            .arg(request.now_ms)
            .arg(request.cutoff())
            .arg(request.limit)
            .arg(&request.member)
            .arg(key_ttl_ms(request.window_ms))
            .invoke_async(&mut connection)
            .await?;

        trace!(key = %key, count = count, admitted = admitted, "Redis window checked");
        Ok(WindowOutcome {
            count,
            admitted: admitted == 1,
        })
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let cutoff = now_ms.saturating_sub(window_ms);
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", cutoff))
            .arg("+inf")
            .query_async(&mut connection)
            .await?;
        Ok(count)
    }

    async fn clear_window(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut connection).await?;
        Ok(())
    }

    async fn load_circuit(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<CircuitRecord>>, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        decode_circuit(key, &fields)
    }

    async fn save_circuit(
        &self,
        key: &str,
        expected_revision: u64,
        record: &CircuitRecord,
        ttl: Duration,
        _now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let counts = &record.counts;
        let saved: i64 = self
            .save_script
            .key(key)
            .arg(expected_revision)
            .arg(record.state.as_str())
            .arg(record.generation)
            .arg(counts.requests)
            .arg(counts.successes)
            .arg(counts.failures)
            .arg(counts.consecutive_successes)
            .arg(counts.consecutive_failures)
            .arg(record.expiry_ms)
            .arg(key_ttl_ms(duration_ms(ttl)))
            .invoke_async(&mut connection)
            .await?;
        Ok(saved == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}

/// Decode a circuit hash as returned by `HGETALL`. An empty hash means the
/// record does not exist.
fn decode_circuit(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<Option<Versioned<CircuitRecord>>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let number = |name: &str| -> Result<u64, StoreError> {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field {}", name)))?
            .parse::<u64>()
            .map_err(|e| corrupt(format!("field {}: {}", name, e)))
    };
    let count = |name: &str| -> Result<u32, StoreError> {
        number(name).map(|n| n.min(u32::MAX as u64) as u32)
    };

    let state = fields
        .get("state")
        .and_then(|s| CircuitState::parse(s))
        .ok_or_else(|| corrupt("missing or unknown state".to_string()))?;

    Ok(Some(Versioned {
        value: CircuitRecord {
            state,
            generation: number("generation")?,
            counts: Counts {
                requests: count("requests")?,
                successes: count("successes")?,
                failures: count("failures")?,
                consecutive_successes: count("consecutive_successes")?,
                consecutive_failures: count("consecutive_failures")?,
            },
            expiry_ms: number("expiry_ms")?,
        },
        revision: number("revision")?,
    }))
}
