//! Admission pipeline and composition root.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::response::{rate_limit_headers, Rejection};
use crate::circuit::{CircuitBreaker, ReportStatus, Ticket};
use crate::clock::{Clock, SystemClock};
use crate::config::{GatekeeperConfig, StoreBackend};
use crate::context::RequestContext;
use crate::error::{GatekeeperError, Result, StoreError};
use crate::metrics::AdmissionMetrics;
use crate::ratelimit::{RateDecision, RateLimiter, RequestIdentity};
use crate::store::{MemoryStore, Store, StoreMode};

/// A request that passed both gates.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The rate limit decision, for response headers
    pub decision: RateDecision,
    /// Ticket to report the downstream outcome with
    pub ticket: Ticket,
}

impl Admission {
    /// Rate limit headers for the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        rate_limit_headers(&self.decision)
    }
}

/// Result of running a handler behind the pipeline.
#[derive(Debug)]
pub struct Completed<T, E> {
    /// The rate limit decision, for response headers
    pub decision: RateDecision,
    /// What the handler returned
    pub outcome: std::result::Result<T, E>,
}

impl<T, E> Completed<T, E> {
    /// Rate limit headers for the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        rate_limit_headers(&self.decision)
    }
}

/// Owns the store, the rate limiter, the circuit breaker and their
/// background tasks.
///
/// Per request: resolve the key, ask the rate limiter, ask the circuit
/// breaker, run the handler, report its outcome.
pub struct AdmissionControl {
    config: GatekeeperConfig,
    store: Arc<dyn Store>,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<AdmissionMetrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionControl {
    /// Build the configured store and start background tasks.
    pub async fn start(config: GatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        match config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::with_clock(clock.clone()));
                let control = Self::with_store(config, store.clone(), clock)?;
                let cleanup = store.spawn_cleanup(
                    control.config.store.cleanup_interval(),
                    control.shutdown_tx.subscribe(),
                );
                control.tasks.lock().push(cleanup);
                info!("Admission control started with memory store");
                Ok(control)
            }
            StoreBackend::Redis => {
                let store = connect_redis(&config).await?;
                info!("Admission control started with redis store");
                Self::with_store(config, store, clock)
            }
        }
    }

    /// Build the pipeline on an existing store. No background tasks run.
    pub fn with_store(
        config: GatekeeperConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metrics = Arc::new(AdmissionMetrics::new());
        let limiter = RateLimiter::new(
            config.rate_limit.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
        )?;
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            store.clone(),
            clock,
            metrics.clone(),
        )?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            limiter,
            breaker,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Whether limits are shared across instances.
    pub fn mode(&self) -> StoreMode {
        self.store.mode()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Run both gates for a request to `resource`.
    #[instrument(skip(self, ctx, identity), fields(request_id = %ctx.request_id))]
    pub async fn admit(
        &self,
        ctx: &RequestContext,
        identity: &RequestIdentity,
        resource: &str,
    ) -> std::result::Result<Admission, Rejection> {
        let key = self
            .config
            .rate_limit
            .key_source
            .resolve(identity)
            .ok_or_else(|| {
                Rejection::new(
                    GatekeeperError::Config(format!(
                        "request identity has no {:?} to key the rate limit on",
                        self.config.rate_limit.key_source
                    )),
                    None,
                    resource,
                )
            })?;

        let decision = self
            .limiter
            .check(ctx, &key)
            .await
            .map_err(|e| Rejection::new(e, None, resource))?;
        if !decision.allowed && decision.degraded {
            let error = StoreError::Unavailable("rate limit store".to_string());
            return Err(Rejection::new(error.into(), Some(decision), resource));
        }
        let decision = match decision.clone().into_result(&key) {
            Ok(decision) => decision,
            Err(e) => return Err(Rejection::new(e, Some(decision), resource)),
        };

        match self.breaker.admit(ctx, resource).await {
            Ok(ticket) => {
                debug!(key = %key, resource = %resource, "Request admitted");
                Ok(Admission { decision, ticket })
            }
            Err(e) => Err(Rejection::new(e, Some(decision), resource)),
        }
    }

    /// Report the downstream outcome of an admitted request.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        admission: &Admission,
        success: bool,
    ) -> ReportStatus {
        self.breaker.report(ctx, &admission.ticket, success).await
    }

    /// Admit, run `handler`, and report whether it returned `Ok`.
    ///
    /// If this future is dropped while the handler is still running, the
    /// call is reported as a failure from a background task.
    pub async fn run<T, E, F>(
        &self,
        ctx: &RequestContext,
        identity: &RequestIdentity,
        resource: &str,
        handler: F,
    ) -> std::result::Result<Completed<T, E>, Rejection>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let admission = self.admit(ctx, identity, resource).await?;
        let pending = PendingReport {
            breaker: self.breaker.clone(),
            request_id: ctx.request_id.clone(),
            ticket: Some(admission.ticket.clone()),
        };
        let outcome = handler.await;
        pending.disarm();
        self.complete(ctx, &admission, outcome.is_ok()).await;
        Ok(Completed {
            decision: admission.decision,
            outcome,
        })
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed during shutdown");
            }
        }
        info!("Admission control stopped");
    }
}

/// Ticket of a handler still running inside [`AdmissionControl::run`].
struct PendingReport {
    breaker: Arc<CircuitBreaker>,
    request_id: String,
    ticket: Option<Ticket>,
}

impl PendingReport {
    fn disarm(mut self) {
        self.ticket = None;
    }
}

impl Drop for PendingReport {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        if ticket.degraded {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        debug!(
            resource = %ticket.resource,
            request_id = %self.request_id,
            "Handler cancelled, reporting failure"
        );
        // The caller's deadline has most likely passed already.
        let ctx = RequestContext::with_request_id(self.request_id.clone());
        let breaker = self.breaker.clone();
        runtime.spawn(async move {
            breaker.report(&ctx, &ticket, false).await;
        });
    }
}

#[cfg(feature = "redis-store")]
async fn connect_redis(config: &GatekeeperConfig) -> Result<Arc<dyn Store>> {
    let url = config.store.redis_url.as_deref().unwrap_or_default();
    let store = crate::store::RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn connect_redis(_config: &GatekeeperConfig) -> Result<Arc<dyn Store>> {
    Err(GatekeeperError::Config(
        "redis backend requested but gatekeeper was built without the redis-store feature"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerConfig, FailurePolicy, RateLimitConfig, TripPolicy};
    use crate::ratelimit::KeySource;
    use crate::store::testing::UnavailableStore;
    use std::net::IpAddr;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    fn test_config() -> GatekeeperConfig {
        GatekeeperConfig {
            rate_limit: RateLimitConfig {
                limit: 3,
                window_ms: 1_000,
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                trip: TripPolicy::ConsecutiveFailures { threshold: 2 },
                success_threshold: 1,
                timeout_ms: 5_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn control_with(config: GatekeeperConfig) -> (AdmissionControl, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let control = AdmissionControl::with_store(config, store, clock.clone()).unwrap();
        (control, clock)
    }

    fn client() -> RequestIdentity {
        RequestIdentity::from_addr("192.168.1.10".parse::<IpAddr>().unwrap())
    }

    #[tokio::test]
    async fn test_admitted_request_carries_headers() {
        let (control, _) = control_with(test_config());
        let ctx = RequestContext::new();

        let admission = control.admit(&ctx, &client(), "alerts").await.unwrap();
        let headers = admission.headers();
        assert_eq!(headers[0], ("X-RateLimit-Limit", "3".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "2".to_string()));
        assert_eq!(
            control.complete(&ctx, &admission, true).await,
            ReportStatus::Recorded
        );
        assert_eq!(control.mode(), StoreMode::Local);
    }

    #[tokio::test]
    async fn test_rate_limited_request_gets_429() {
        let (control, _) = control_with(test_config());
        let ctx = RequestContext::new();
        for _ in 0..3 {
            control.admit(&ctx, &client(), "alerts").await.unwrap();
        }

        let rejection = control.admit(&ctx, &client(), "alerts").await.unwrap_err();
        assert_eq!(rejection.status(), 429);
        assert_eq!(rejection.body()["limit"], 3);
        assert_eq!(rejection.body()["window"], "1s");
        assert_eq!(rejection.headers()[1], ("X-RateLimit-Remaining", "0".to_string()));
    }

    #[tokio::test]
    async fn test_rate_limit_checked_before_circuit() {
        let (control, _) = control_with(test_config());
        let ctx = RequestContext::new();
        for _ in 0..3 {
            control.admit(&ctx, &client(), "alerts").await.unwrap();
        }
        control.admit(&ctx, &client(), "alerts").await.unwrap_err();

        // the denied request never reached the breaker
        let record = control.breaker().snapshot("alerts").await.unwrap().unwrap();
        assert_eq!(record.counts.requests, 3);
    }

    #[tokio::test]
    async fn test_failing_handler_opens_circuit() {
        let (control, clock) = control_with(GatekeeperConfig {
            rate_limit: RateLimitConfig {
                limit: 100,
                ..test_config().rate_limit
            },
            ..test_config()
        });
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let completed = control
                .run(&ctx, &client(), "webhooks", async { Err::<(), _>("downstream failed") })
                .await
                .unwrap();
            assert!(completed.outcome.is_err());
        }

        let rejection = control.admit(&ctx, &client(), "webhooks").await.unwrap_err();
        assert_eq!(rejection.status(), 503);
        assert_eq!(rejection.body()["service"], "webhooks");
        assert_eq!(rejection.body()["state"], "open");
        assert_eq!(rejection.headers().len(), 3);

        clock.advance(Duration::from_secs(5));
        let completed = control
            .run(&ctx, &client(), "webhooks", async { Ok::<_, ()>(42) })
            .await
            .unwrap();
        assert_eq!(completed.outcome, Ok(42));
        assert_eq!(
            control.breaker().state("webhooks").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_cancelled_handler_counts_as_failure() {
        let (control, clock) = control_with(GatekeeperConfig {
            rate_limit: RateLimitConfig {
                limit: 100,
                ..test_config().rate_limit
            },
            ..test_config()
        });
        let ctx = RequestContext::new();
        for _ in 0..2 {
            control
                .run(&ctx, &client(), "webhooks", async { Err::<(), _>("down") })
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(5));

        // the probe's handler never finishes and its caller gives up
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            control.run(
                &ctx,
                &client(),
                "webhooks",
                std::future::pending::<std::result::Result<(), ()>>(),
            ),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            let record = control.breaker().snapshot("webhooks").await.unwrap().unwrap();
            if record.state == CircuitState::Open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cancelled probe was never reported");
    }

    #[tokio::test]
    async fn test_missing_custom_key_is_config_error() {
        let (control, _) = control_with(GatekeeperConfig {
            rate_limit: RateLimitConfig {
                key_source: KeySource::Custom,
                ..test_config().rate_limit
            },
            ..test_config()
        });

        let rejection = control
            .admit(&RequestContext::new(), &client(), "alerts")
            .await
            .unwrap_err();
        assert!(matches!(rejection.error, GatekeeperError::Config(_)));
        assert_eq!(rejection.status(), 500);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_end_to_end() {
        let control = AdmissionControl::with_store(
            test_config(),
            Arc::new(UnavailableStore),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap();
        let ctx = RequestContext::new();

        let admission = control.admit(&ctx, &client(), "alerts").await.unwrap();
        assert!(admission.decision.degraded);
        assert!(admission.ticket.degraded);
        assert_eq!(control.metrics().snapshot().degraded_decisions, 2);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_end_to_end() {
        let mut config = test_config();
        config.rate_limit.failure_policy = FailurePolicy::FailClosed;
        let control = AdmissionControl::with_store(
            config,
            Arc::new(UnavailableStore),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap();

        let rejection = control
            .admit(&RequestContext::new(), &client(), "alerts")
            .await
            .unwrap_err();
        assert_eq!(rejection.status(), 503);
        assert_eq!(rejection.body()["service"], "alerts");
    }

    #[tokio::test]
    async fn test_start_and_shutdown_memory_backend() {
        let control = AdmissionControl::start(test_config()).await.unwrap();
        assert_eq!(control.mode(), StoreMode::Local);
        assert!(control
            .admit(&RequestContext::new(), &client(), "alerts")
            .await
            .is_ok());

        tokio::time::timeout(Duration::from_secs(1), control.shutdown())
            .await
            .expect("shutdown must stop the cleanup loop");
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = test_config();
        config.rate_limit.limit = 0;
        let result = AdmissionControl::with_store(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        );
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }
}
