//! Bounded retry for upstream transport failures.
//!
//! Only failures to get a response at all go through here; an HTTP response of
//! any status is a result, not an error. Cancellation of the inbound request
//! ends the loop immediately, whether it happens mid-attempt or mid-backoff.

use crate::config::{RetrySection, Route};
use crate::context::RequestContext;
use crate::logging::{LogLevel, SharedLogger};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The inbound request was cancelled; nothing more was attempted.
    Cancelled,
    /// Every attempt failed; carries the last error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed in a way another attempt cannot fix.
    Permanent { attempts: u32, error: E },
}

/// Run `op` until it succeeds, the policy runs out, `ctx` is cancelled, or
/// `is_retryable` rejects an error.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    ctx: &RequestContext,
    route: Route,
    logger: &SharedLogger,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        if ctx.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            outcome = op() => outcome,
            () = ctx.cancelled() => return Err(RetryError::Cancelled),
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(e) if ctx.is_cancelled() => {
                tracing::debug!(route = %route, error = %e, "Attempt failed after cancellation");
                return Err(RetryError::Cancelled);
            }
            Err(e) if !is_retryable(&e) => {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.backoff(attempt);
        logger.route_event(
            LogLevel::Warn,
            "retry",
            route,
            format!(
                "Upstream attempt {} failed, retrying in {}ms: {}",
                attempt,
                delay.as_millis(),
                error
            ),
            serde_json::json!({
                "request_id": ctx.id().to_string(),
                "attempt": attempt,
                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "error": error.to_string(),
            }),
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancelled() => return Err(RetryError::Cancelled),
        }
    }
}
