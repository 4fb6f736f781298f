//! Store-backed circuit breaker.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::state::{CircuitRecord, CircuitState, ReportOutcome, Transition};
use crate::clock::Clock;
use crate::config::{CircuitBreakerConfig, FailurePolicy};
use crate::context::RequestContext;
use crate::error::{GatekeeperError, Result, StoreError};
use crate::metrics::AdmissionMetrics;
use crate::store::Store;

/// Compare-and-swap attempts before giving up on a contended record.
const MAX_CAS_ATTEMPTS: u32 = 8;
/// Upper bound of the random pause between attempts, per attempt.
const CAS_BACKOFF_STEP_MICROS: u64 = 250;

/// Permission to call a resource, returned by [`CircuitBreaker::admit`].
///
/// Hand it back to [`CircuitBreaker::report`] with the outcome of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub resource: String,
    pub generation: u64,
    /// Issued without consulting the store.
    pub degraded: bool,
}

/// What happened to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// Counts were updated.
    Recorded,
    /// The ticket's generation had ended; nothing changed.
    Stale,
    /// The ticket was degraded or the store was unreachable.
    Skipped,
}

/// Per-resource circuit breaker.
///
/// Records live in the store so every instance sharing it sees the same
/// state. Within one process, calls for the same resource are serialized by
/// a per-resource mutex; across processes, writes are compare-and-swap on the
/// record revision.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    metrics: Arc<AdmissionMetrics>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CircuitBreaker {
    /// Create a circuit breaker, validating its configuration.
    pub fn new(
        config: CircuitBreakerConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        debug!(
            store = store.name(),
            trip = ?config.trip,
            timeout_ms = config.timeout_ms,
            "Circuit breaker initialized"
        );
        Ok(Self {
            config,
            store,
            clock,
            metrics,
            locks: DashMap::new(),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to call `resource`.
    ///
    /// Fails with [`GatekeeperError::CircuitOpen`] while the circuit is open
    /// or when the half-open probe budget is used up.
    pub async fn admit(&self, ctx: &RequestContext, resource: &str) -> Result<Ticket> {
        validate_resource(resource)?;
        let key = self.store_key(resource);

        let result = self
            .serialized(ctx, resource, &key, |record, now_ms| {
                record.admit(now_ms, &self.config)
            })
            .await;

        match result {
            Ok(Ok((generation, transition))) => {
                if let Some(transition) = transition {
                    self.on_transition(resource, &transition);
                }
                Ok(Ticket {
                    resource: resource.to_string(),
                    generation,
                    degraded: false,
                })
            }
            Ok(Err(state)) => {
                self.metrics.record_circuit_rejected();
                debug!(
                    resource = %resource,
                    state = %state,
                    request_id = %ctx.request_id,
                    "Circuit rejected request"
                );
                Err(GatekeeperError::CircuitOpen {
                    resource: resource.to_string(),
                    state,
                })
            }
            Err(e) => {
                self.metrics.record_store_failure();
                self.metrics.record_degraded();
                match self.config.failure_policy {
                    FailurePolicy::FailOpen => {
                        warn!(
                            resource = %resource,
                            request_id = %ctx.request_id,
                            error = %e,
                            "Circuit store unavailable, treating circuit as closed"
                        );
                        Ok(Ticket {
                            resource: resource.to_string(),
                            generation: 0,
                            degraded: true,
                        })
                    }
                    FailurePolicy::FailClosed => {
                        warn!(
                            resource = %resource,
                            request_id = %ctx.request_id,
                            error = %e,
                            "Circuit store unavailable, rejecting request"
                        );
                        Err(GatekeeperError::StoreUnavailable(e))
                    }
                }
            }
        }
    }

    /// Report the outcome of a call admitted with `ticket`.
    pub async fn report(&self, ctx: &RequestContext, ticket: &Ticket, success: bool) -> ReportStatus {
        if ticket.degraded {
            return ReportStatus::Skipped;
        }
        let key = self.store_key(&ticket.resource);

        let result = self
            .serialized(ctx, &ticket.resource, &key, |record, now_ms| {
                record.report(ticket.generation, success, now_ms, &self.config)
            })
            .await;

        match result {
            Ok(ReportOutcome::Applied(transition)) => {
                if let Some(transition) = transition {
                    self.on_transition(&ticket.resource, &transition);
                }
                ReportStatus::Recorded
            }
            Ok(ReportOutcome::Stale { current }) => {
                self.metrics.record_stale_report();
                debug!(
                    resource = %ticket.resource,
                    generation = ticket.generation,
                    current = current,
                    request_id = %ctx.request_id,
                    "Discarded stale report"
                );
                ReportStatus::Stale
            }
            Err(e) => {
                self.metrics.record_store_failure();
                warn!(
                    resource = %ticket.resource,
                    request_id = %ctx.request_id,
                    error = %e,
                    "Circuit store unavailable, report dropped"
                );
                ReportStatus::Skipped
            }
        }
    }

    /// State of `resource` as the next caller would see it.
    pub async fn state(&self, resource: &str) -> Result<CircuitState> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .snapshot(resource)
            .await?
            .map(|record| record.observed_state(now_ms))
            .unwrap_or_default())
    }

    /// The stored record for `resource`, if any.
    pub async fn snapshot(&self, resource: &str) -> Result<Option<CircuitRecord>> {
        validate_resource(resource)?;
        let key = self.store_key(resource);
        let record = tokio::time::timeout(self.config.store_timeout(), self.store.load_circuit(&key))
            .await
            .map_err(|_| StoreError::Timeout(self.config.store_timeout()))??;
        Ok(record.map(|v| v.value))
    }

    fn store_key(&self, resource: &str) -> String {
        format!("{}:cb:{}", self.config.key_prefix, resource)
    }

    /// Run `apply` against the record of `resource` while holding the
    /// resource's local lock, bounded by the request budget.
    async fn serialized<R, F>(
        &self,
        ctx: &RequestContext,
        resource: &str,
        key: &str,
        apply: F,
    ) -> std::result::Result<R, StoreError>
    where
        F: FnMut(&mut CircuitRecord, u64) -> R,
    {
        let lock = self
            .locks
            .entry(resource.to_string())
            .or_default()
            .clone();

        let result = ctx
            .bounded(self.config.store_timeout(), async {
                let _guard = lock.lock().await;
                self.update(key, apply).await
            })
            .await;

        // Only the table holds the mutex once every caller is done with it.
        drop(lock);
        self.locks
            .remove_if(resource, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Load, mutate and compare-and-swap a record, retrying on conflict.
    async fn update<R, F>(&self, key: &str, mut apply: F) -> std::result::Result<R, StoreError>
    where
        F: FnMut(&mut CircuitRecord, u64) -> R,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now_ms = self.clock.now_ms();
            let (mut record, revision) = match self.store.load_circuit(key).await? {
                Some(stored) => (stored.value, stored.revision),
                None => (CircuitRecord::new(now_ms, &self.config), 0),
            };

            let before = record.clone();
            let out = apply(&mut record, now_ms);
            if revision != 0 && record == before {
                return Ok(out);
            }

            if self
                .store
                .save_circuit(key, revision, &record, self.config.record_ttl(), now_ms)
                .await?
            {
                return Ok(out);
            }

            let pause = rand::thread_rng().gen_range(0..=CAS_BACKOFF_STEP_MICROS * attempt as u64);
            debug!(key = %key, attempt = attempt, "Circuit record changed concurrently, retrying");
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn on_transition(&self, resource: &str, transition: &Transition) {
        self.metrics.record_transition();
        if transition.to == CircuitState::Open {
            warn!(
                resource = %resource,
                from = %transition.from,
                to = %transition.to,
                generation = transition.generation,
                "Circuit opened"
            );
        } else {
            info!(
                resource = %resource,
                from = %transition.from,
                to = %transition.to,
                generation = transition.generation,
                "Circuit state changed"
            );
        }
    }
}

fn validate_resource(resource: &str) -> Result<()> {
    if resource.is_empty() {
        return Err(GatekeeperError::Config(
            "circuit resource name must not be empty".to_string(),
        ));
    }
    Ok(())
}
