//! Per-request identity and deadline.
//!
//! The deadline is the inbound cancellation signal: admission waits, upstream
//! sends and retry sleeps all race against [`RequestContext::cancelled`]. A client
//! disconnect drops the handler future, which cancels the same work by drop.

use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    id: Uuid,
    deadline: Option<Instant>,
}

impl RequestContext {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the deadline passes; never resolves without one.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels() {
        let ctx = RequestContext::new(Some(Duration::from_millis(50)));
        assert!(!ctx.is_cancelled());
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_never_cancels() {
        let ctx = RequestContext::new(None);
        let raced = tokio::time::timeout(Duration::from_secs(3600), ctx.cancelled()).await;
        assert!(raced.is_err());
        assert!(!ctx.is_cancelled());
    }
}
