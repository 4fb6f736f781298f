//! HTTP-facing contract of the admission pipeline.
//!
//! The gateway owns routing and serialization; this module only decides the
//! status code, the rate limit headers and the JSON body of each outcome.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::circuit::CircuitState;
use crate::error::GatekeeperError;
use crate::ratelimit::RateDecision;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Rate limit headers carried by every response.
pub fn rate_limit_headers(decision: &RateDecision) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_LIMIT, decision.limit.to_string()),
        (HEADER_REMAINING, decision.remaining.to_string()),
        (HEADER_RESET, decision.reset_epoch_secs().to_string()),
    ]
}

/// Render a window the way it appears in response bodies: `1s`, `90s`, `250ms`.
pub fn format_window(window: Duration) -> String {
    let millis = window.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

#[derive(Debug, Serialize)]
struct RateLimitedBody<'a> {
    error: &'a str,
    limit: u64,
    remaining: u64,
    reset_time: i64,
    window: String,
}

#[derive(Debug, Serialize)]
struct CircuitOpenBody<'a> {
    error: &'a str,
    service: &'a str,
    state: CircuitState,
}

#[derive(Debug, Serialize)]
struct UnavailableBody<'a> {
    error: &'a str,
    service: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// A request turned away by the admission pipeline.
#[derive(Debug)]
pub struct Rejection {
    /// Why the request was rejected
    pub error: GatekeeperError,
    /// The rate limit decision, when the limiter got to run
    pub decision: Option<RateDecision>,
    /// Resource the request was meant for
    pub resource: String,
}

impl Rejection {
    pub(crate) fn new(
        error: GatekeeperError,
        decision: Option<RateDecision>,
        resource: &str,
    ) -> Self {
        Self {
            error,
            decision,
            resource: resource.to_string(),
        }
    }

    /// HTTP status for this rejection.
    pub fn status(&self) -> u16 {
        match self.error {
            GatekeeperError::LimitExceeded { .. } => STATUS_TOO_MANY_REQUESTS,
            GatekeeperError::CircuitOpen { .. } | GatekeeperError::StoreUnavailable(_) => {
                STATUS_SERVICE_UNAVAILABLE
            }
            _ => STATUS_INTERNAL_ERROR,
        }
    }

    /// Headers to add to the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.decision
            .as_ref()
            .map(rate_limit_headers)
            .unwrap_or_default()
    }

    /// JSON response body.
    pub fn body(&self) -> Value {
        let body = match (&self.error, &self.decision) {
            (GatekeeperError::LimitExceeded { limit, window, .. }, decision) => {
                serde_json::to_value(RateLimitedBody {
                    error: "Rate limit exceeded",
                    limit: *limit,
                    remaining: 0,
                    reset_time: decision.as_ref().map_or(0, |d| d.reset_epoch_secs()),
                    window: format_window(*window),
                })
            }
            (GatekeeperError::CircuitOpen { resource, state }, _) => {
                serde_json::to_value(CircuitOpenBody {
                    error: "Service temporarily unavailable",
                    service: resource,
                    state: *state,
                })
            }
            (GatekeeperError::StoreUnavailable(_), _) => serde_json::to_value(UnavailableBody {
                error: "Admission control unavailable",
                service: &self.resource,
            }),
            (error, _) => serde_json::to_value(ErrorBody {
                error: &error.to_string(),
            }),
        };
        body.unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.status())
    }
}
