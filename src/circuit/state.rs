//! Circuit state machine.
//!
//! [`CircuitRecord`] holds everything that has to change together: state,
//! generation, counts and expiry. The breaker loads a record, applies one of
//! the methods below and writes it back in a single compare-and-swap, so the
//! logic here stays free of I/O and locking.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{CircuitBreakerConfig, TripPolicy};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic flows, outcomes are counted
    #[default]
    Closed,
    /// Traffic is refused until the open timeout passes
    Open,
    /// A bounded number of probes are let through
    HalfOpen,
}

impl CircuitState {
    /// Wire representation used in store hashes and response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Parse the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request outcomes counted within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.successes = self.successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Admitted requests that have not reported yet.
    pub fn in_flight(&self) -> u32 {
        self.requests
            .saturating_sub(self.successes)
            .saturating_sub(self.failures)
    }

    /// Share of failures among admitted requests.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

/// A state change, with the generation it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub generation: u64,
}

/// Result of applying a report to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Counts were updated, possibly causing a transition.
    Applied(Option<Transition>),
    /// The report belongs to an earlier generation and was dropped.
    Stale { current: u64 },
}

/// Per-resource circuit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
    /// Epoch millis when the current generation ends; 0 means never.
    /// Closed: end of the counting interval. Open: end of the open timeout.
    /// HalfOpen: deadline after which unreported probes are abandoned.
    pub expiry_ms: u64,
}

impl CircuitRecord {
    /// A fresh closed record starting at `now_ms`.
    pub fn new(now_ms: u64, config: &CircuitBreakerConfig) -> Self {
        let mut record = Self {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry_ms: 0,
        };
        record.expiry_ms = record.expiry_for(now_ms, config);
        record
    }

    fn expiry_for(&self, now_ms: u64, config: &CircuitBreakerConfig) -> u64 {
        match self.state {
            CircuitState::Closed if config.interval_ms > 0 => {
                now_ms.saturating_add(config.interval_ms)
            }
            CircuitState::Closed => 0,
            CircuitState::Open | CircuitState::HalfOpen => now_ms.saturating_add(config.timeout_ms),
        }
    }

    fn new_generation(&mut self, now_ms: u64, config: &CircuitBreakerConfig) {
        self.generation += 1;
        self.counts = Counts::default();
        self.expiry_ms = self.expiry_for(now_ms, config);
    }

    fn transition(
        &mut self,
        to: CircuitState,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> Transition {
        let from = self.state;
        self.state = to;
        self.new_generation(now_ms, config);
        Transition {
            from,
            to,
            generation: self.generation,
        }
    }

    /// Start a new counting generation if the closed interval has elapsed.
    fn roll_interval(&mut self, now_ms: u64, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::Closed && self.expiry_ms != 0 && now_ms >= self.expiry_ms {
            self.new_generation(now_ms, config);
        }
    }

    /// Abandon half-open probes that outlived their deadline. Their tickets
    /// become stale and the probe budget is free again.
    fn expire_probes(&mut self, now_ms: u64, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::HalfOpen && self.expiry_ms != 0 && now_ms >= self.expiry_ms {
            self.new_generation(now_ms, config);
        }
    }

    /// The state a caller would observe at `now_ms`, without mutating.
    pub fn observed_state(&self, now_ms: u64) -> CircuitState {
        match self.state {
            CircuitState::Open if now_ms >= self.expiry_ms => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Admit one request.
    ///
    /// On success the request is counted and the current generation returned
    /// together with any transition that happened on the way. On refusal the
    /// state that refused it is returned; the record may still have changed
    /// (interval rollover) and should be persisted either way.
    pub fn admit(
        &mut self,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> std::result::Result<(u64, Option<Transition>), CircuitState> {
        self.roll_interval(now_ms, config);
        self.expire_probes(now_ms, config);

        let mut transition = None;
        if self.state == CircuitState::Open {
            if now_ms < self.expiry_ms {
                return Err(CircuitState::Open);
            }
            transition = Some(self.transition(CircuitState::HalfOpen, now_ms, config));
        }

        if self.state == CircuitState::HalfOpen
            && self.counts.in_flight() >= config.max_half_open_requests
        {
            return Err(CircuitState::HalfOpen);
        }

        self.counts.on_request();
        Ok((self.generation, transition))
    }

    /// Apply the outcome of a request admitted under `generation`.
    pub fn report(
        &mut self,
        generation: u64,
        success: bool,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> ReportOutcome {
        self.roll_interval(now_ms, config);

        if generation != self.generation {
            return ReportOutcome::Stale {
                current: self.generation,
            };
        }

        if success {
            self.counts.on_success();
            if self.state == CircuitState::HalfOpen
                && self.counts.consecutive_successes >= config.success_threshold
            {
                return ReportOutcome::Applied(Some(self.transition(
                    CircuitState::Closed,
                    now_ms,
                    config,
                )));
            }
        } else {
            self.counts.on_failure();
            if self.state == CircuitState::HalfOpen {
                return ReportOutcome::Applied(Some(self.transition(
                    CircuitState::Open,
                    now_ms,
                    config,
                )));
            }
        }

        if self.state == CircuitState::Closed && should_trip(&self.counts, &config.trip) {
            return ReportOutcome::Applied(Some(self.transition(
                CircuitState::Open,
                now_ms,
                config,
            )));
        }

        ReportOutcome::Applied(None)
    }
}

/// Whether closed-state counts satisfy the trip policy.
///
/// The ratio policy waits for `min_samples` requests so that a single early
/// failure cannot open the circuit.
pub fn should_trip(counts: &Counts, policy: &TripPolicy) -> bool {
    match *policy {
        TripPolicy::ConsecutiveFailures { threshold } => counts.consecutive_failures >= threshold,
        TripPolicy::FailureRatio { ratio, min_samples } => {
            counts.requests >= min_samples && counts.failure_ratio() >= ratio
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;

    fn consecutive_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            trip: TripPolicy::ConsecutiveFailures { threshold: 5 },
            success_threshold: 2,
            interval_ms: 10_000,
            timeout_ms: 1_000,
            max_half_open_requests: 1,
            ..Default::default()
        }
    }

    fn call(record: &mut CircuitRecord, success: bool, now: u64, config: &CircuitBreakerConfig) -> ReportOutcome {
        let (generation, _) = record.admit(now, config).unwrap();
        record.report(generation, success, now, config)
    }

    #[test]
    fn test_new_record_is_closed() {
        let config = consecutive_config();
        let record = CircuitRecord::new(T0, &config);
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.generation, 0);
        assert_eq!(record.expiry_ms, T0 + 10_000);
    }

    #[test]
    fn test_consecutive_failures_trip() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);

        for _ in 0..4 {
            assert_eq!(call(&mut record, false, T0, &config), ReportOutcome::Applied(None));
        }
        let outcome = call(&mut record, false, T0, &config);
        assert_eq!(
            outcome,
            ReportOutcome::Applied(Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                generation: 1,
            }))
        );
        assert_eq!(record.admit(T0 + 10, &config), Err(CircuitState::Open));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);

        for _ in 0..4 {
            call(&mut record, false, T0, &config);
        }
        call(&mut record, true, T0, &config);
        for _ in 0..4 {
            call(&mut record, false, T0, &config);
        }
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.counts.failures, 8);
    }

    #[test]
    fn test_ratio_trip_on_third_report() {
        let config = CircuitBreakerConfig {
            trip: TripPolicy::FailureRatio {
                ratio: 0.6,
                min_samples: 3,
            },
            ..consecutive_config()
        };
        let mut record = CircuitRecord::new(T0, &config);

        assert_eq!(call(&mut record, false, T0, &config), ReportOutcome::Applied(None));
        assert_eq!(call(&mut record, false, T0, &config), ReportOutcome::Applied(None));
        let outcome = call(&mut record, true, T0, &config);
        assert!(matches!(
            outcome,
            ReportOutcome::Applied(Some(Transition {
                to: CircuitState::Open,
                ..
            }))
        ));
    }

    #[test]
    fn test_ratio_waits_for_min_samples() {
        let config = CircuitBreakerConfig {
            trip: TripPolicy::FailureRatio {
                ratio: 0.5,
                min_samples: 10,
            },
            ..consecutive_config()
        };
        let mut record = CircuitRecord::new(T0, &config);
        for _ in 0..9 {
            call(&mut record, false, T0, &config);
        }
        assert_eq!(record.state, CircuitState::Closed);
        call(&mut record, false, T0, &config);
        assert_eq!(record.state, CircuitState::Open);
    }

    #[test]
    fn test_open_to_half_open_to_closed() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);
        for _ in 0..5 {
            call(&mut record, false, T0, &config);
        }
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.observed_state(T0 + 999), CircuitState::Open);
        assert_eq!(record.observed_state(T0 + 1_000), CircuitState::HalfOpen);

        let later = T0 + 1_000;
        let (generation, transition) = record.admit(later, &config).unwrap();
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::HalfOpen));

        // single probe budget
        assert_eq!(record.admit(later, &config), Err(CircuitState::HalfOpen));

        assert_eq!(record.report(generation, true, later, &config), ReportOutcome::Applied(None));
        let outcome = call(&mut record, true, later, &config);
        assert!(matches!(
            outcome,
            ReportOutcome::Applied(Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed,
                ..
            }))
        ));
        assert_eq!(record.counts, Counts::default());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);
        for _ in 0..5 {
            call(&mut record, false, T0, &config);
        }
        let later = T0 + 2_000;
        let outcome = call(&mut record, false, later, &config);
        assert!(matches!(
            outcome,
            ReportOutcome::Applied(Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Open,
                ..
            }))
        ));
        assert_eq!(record.expiry_ms, later + 1_000);
    }

    #[test]
    fn test_interval_rollover_clears_counts() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);
        for _ in 0..4 {
            call(&mut record, false, T0, &config);
        }
        let later = T0 + 10_000;
        call(&mut record, false, later, &config);
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.generation, 1);
        assert_eq!(record.counts.consecutive_failures, 1);
    }

    #[test]
    fn test_zero_interval_never_rolls() {
        let config = CircuitBreakerConfig {
            interval_ms: 0,
            ..consecutive_config()
        };
        let mut record = CircuitRecord::new(T0, &config);
        assert_eq!(record.expiry_ms, 0);
        call(&mut record, false, T0, &config);
        call(&mut record, false, T0 + 10_000_000, &config);
        assert_eq!(record.generation, 0);
        assert_eq!(record.counts.consecutive_failures, 2);
    }

    #[test]
    fn test_stale_report_is_dropped() {
        let config = consecutive_config();
        let mut record = CircuitRecord::new(T0, &config);
        let (old_generation, _) = record.admit(T0, &config).unwrap();
        for _ in 0..5 {
            call(&mut record, false, T0, &config);
        }
        assert_eq!(record.state, CircuitState::Open);
        let before = record.clone();

        let outcome = record.report(old_generation, true, T0, &config);
        assert_eq!(outcome, ReportOutcome::Stale { current: 1 });
        assert_eq!(record, before);
    }

    #[test]
    fn test_state_wire_format() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CircuitState::parse("ajar"), None);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    fn tripped(config: &CircuitBreakerConfig) -> CircuitRecord {
        let mut record = CircuitRecord::new(T0, config);
        for _ in 0..5 {
            call(&mut record, false, T0, config);
        }
        record
    }

    #[test]
    fn test_unreported_probe_is_abandoned_after_timeout() {
        let config = consecutive_config();
        let mut record = tripped(&config);

        let probe_at = T0 + 1_000;
        let (lost, _) = record.admit(probe_at, &config).unwrap();
        assert_eq!(record.expiry_ms, probe_at + 1_000);
        assert_eq!(record.admit(probe_at + 999, &config), Err(CircuitState::HalfOpen));

        let (generation, transition) = record.admit(probe_at + 1_000, &config).unwrap();
        assert!(transition.is_none());
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert_eq!(generation, lost + 1);
        assert_eq!(record.expiry_ms, probe_at + 2_000);

        // the lost probe reporting late changes nothing
        let now = probe_at + 1_500;
        assert_eq!(
            record.report(lost, false, now, &config),
            ReportOutcome::Stale { current: generation }
        );
        assert_eq!(record.report(generation, true, now, &config), ReportOutcome::Applied(None));
        assert_eq!(record.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let config = CircuitBreakerConfig {
            interval_ms: u64::MAX,
            timeout_ms: u64::MAX,
            record_ttl_ms: u64::MAX,
            ..consecutive_config()
        };
        let mut record = tripped(&config);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.expiry_ms, u64::MAX);
        assert_eq!(record.admit(u64::MAX - 1, &config), Err(CircuitState::Open));
    }
}
