//! Sliding-window rate limiter.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::decision::RateDecision;
use super::key::RateLimitKey;
use crate::clock::{duration_ms, to_datetime, Clock};
use crate::config::{FailurePolicy, RateLimitConfig};
use crate::context::RequestContext;
use crate::error::{Result, StoreError};
use crate::metrics::AdmissionMetrics;
use crate::store::{Store, StoreMode, WindowRequest};

/// Per-key sliding-window rate limiter.
///
/// Each admitted request leaves a timestamped entry in the store; a request
/// is admitted while fewer than `limit` entries are younger than `window`.
/// The prune-count-add sequence is one atomic store operation, so concurrent
/// callers on any number of instances sharing the store can never admit more
/// than `limit` requests per window between them.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    metrics: Arc<AdmissionMetrics>,
}

impl RateLimiter {
    /// Create a rate limiter, validating its configuration.
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        if store.mode() == StoreMode::Local {
            debug!(
                store = store.name(),
                "Rate limiter uses an instance-local store, limits apply per instance"
            );
        }
        Ok(Self {
            config,
            store,
            clock,
            metrics,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether limits are enforced across instances.
    pub fn mode(&self) -> StoreMode {
        self.store.mode()
    }

    /// Check the configured quota for `key`.
    pub async fn check(&self, ctx: &RequestContext, key: &str) -> Result<RateDecision> {
        self.admit(ctx, key, self.config.limit, self.config.window())
            .await
    }

    /// Decide whether one more request under `key` fits in `limit` requests
    /// per `window`. A zero window means the configured default window; a
    /// zero limit denies everything.
    pub async fn admit(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateDecision> {
        let key = RateLimitKey::new(&self.config.key_prefix, key)?;
        let window = if window.is_zero() {
            self.config.window()
        } else {
            window
        };
        let window_ms = duration_ms(window);
        let now_ms = self.clock.now_ms();

        let decision = |allowed: bool, remaining: u64, degraded: bool| RateDecision {
            allowed,
            remaining,
            reset_at: to_datetime(now_ms.saturating_add(window_ms)),
            limit,
            window,
            degraded,
        };

        if limit == 0 {
            self.metrics.record_rate_limit(false);
            return Ok(decision(false, 0, false));
        }

        let request = WindowRequest {
            now_ms,
            window_ms,
            limit,
            member: format!("{}-{}", now_ms, Uuid::new_v4()),
        };
        let store_key = key.to_store_key();

        trace!(key = %key, limit = limit, window_ms = window_ms, "Checking rate limit");

        let result = ctx
            .bounded(
                self.config.store_timeout(),
                self.store.sliding_window(&store_key, &request),
            )
            .await;

        let decision = match result {
            Ok(outcome) if outcome.admitted => {
                decision(true, limit.saturating_sub(outcome.count + 1), false)
            }
            Ok(outcome) => {
                debug!(
                    key = %key,
                    count = outcome.count,
                    limit = limit,
                    request_id = %ctx.request_id,
                    "Rate limit exceeded"
                );
                decision(false, 0, false)
            }
            Err(e) => {
                self.metrics.record_store_failure();
                self.metrics.record_degraded();
                match self.config.failure_policy {
                    FailurePolicy::FailOpen => {
                        warn!(
                            key = %key,
                            request_id = %ctx.request_id,
                            store = self.store.name(),
                            error = %e,
                            "Rate limit store unavailable, allowing request"
                        );
                        decision(true, limit - 1, true)
                    }
                    FailurePolicy::FailClosed => {
                        warn!(
                            key = %key,
                            request_id = %ctx.request_id,
                            store = self.store.name(),
                            error = %e,
                            "Rate limit store unavailable, denying request"
                        );
                        decision(false, 0, true)
                    }
                }
            }
        };

        self.metrics.record_rate_limit(decision.allowed);
        Ok(decision)
    }

    /// Forget every entry recorded under `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let key = RateLimitKey::new(&self.config.key_prefix, key)?;
        let store_key = key.to_store_key();
        self.bounded(self.store.clear_window(&store_key)).await?;
        debug!(key = %key, "Rate limit window reset");
        Ok(())
    }

    /// Entries currently counted under `key` for a `window` (zero for the
    /// configured default).
    pub async fn count(&self, key: &str, window: Duration) -> Result<u64> {
        let key = RateLimitKey::new(&self.config.key_prefix, key)?;
        let window = if window.is_zero() {
            self.config.window()
        } else {
            window
        };
        let store_key = key.to_store_key();
        let count = self
            .bounded(self.store.window_count(
                &store_key,
                self.clock.now_ms(),
                duration_ms(window),
            ))
            .await?;
        Ok(count)
    }

    /// Bound an administrative store call by the configured store timeout.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, StoreError>>,
    ) -> Result<T> {
        let timeout = self.config.store_timeout();
        let value = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(value)
    }
}
