//! Per-request context carried through admission calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;

/// Correlation id and deadline of the request being admitted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id used to correlate log lines
    pub request_id: String,
    /// Point in time after which the caller no longer waits
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with a fresh request id and no deadline.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    /// A context for an existing request id.
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
        }
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// The smaller of `limit` and the time left before the deadline.
    pub fn budget(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(limit),
            None => limit,
        }
    }

    /// Run a store call bounded by this context's budget.
    pub async fn bounded<T, F>(&self, limit: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let budget = self.budget(limit);
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(budget)),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_without_deadline() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.budget(Duration::from_millis(50)), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_budget_capped_by_deadline() {
        let ctx = RequestContext::with_request_id("req-1").with_timeout(Duration::from_millis(10));
        assert!(ctx.budget(Duration::from_secs(5)) <= Duration::from_millis(10));
        assert_eq!(ctx.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let ctx = RequestContext::new();
        let result: Result<(), StoreError> = ctx
            .bounded(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let ctx = RequestContext::new();
        let result = ctx
            .bounded(Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
