//! Bounded fixed-interval retries that honor cancellation

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::models::{DiscoveryError, DiscoveryResult};

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Single attempt, no sleeping
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts or `cancel` fires.
    ///
    /// Cancellation is terminal for this call and surfaces as
    /// [`DiscoveryError::Interrupted`].
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> DiscoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DiscoveryResult<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Interrupted(what.to_string()));
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DiscoveryError::Interrupted(what.to_string())),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    trace!(attempt, attempts = self.attempts, error = %e, "{} failed", what);
                    last_error = Some(e);
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DiscoveryError::Interrupted(what.to_string())),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());

        Err(DiscoveryError::Network(format!(
            "{} attempt(s) to {} failed. Last failure: {}",
            self.attempts, what, reason
        )))
    }
}
