//! Admission control for completion requests.
//!
//! A single token bucket is shared by every completion route. Tokens accrue
//! continuously at `rate` per second up to `burst`; each admitted request takes
//! one. Waiters never reserve a token, so a waiter that gives up leaves the
//! bucket exactly as it found it.

use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Wait for one permit, or fail once `ctx` is cancelled.
    async fn acquire(&self, ctx: &RequestContext) -> Result<()>;

    /// Stop admitting; pending and future acquisitions fail.
    fn close(&self);
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TokenBucket {
    /// Bucket that starts full.
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate_per_sec.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Take a token if one is available now, otherwise report how long until one is.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    /// Tokens currently in the bucket, after replenishment.
    pub fn available(&self) -> f64 {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.refilled_at = now;
    }
}

#[async_trait]
impl AdmissionControl for TokenBucket {
    async fn acquire(&self, ctx: &RequestContext) -> Result<()> {
        loop {
            // Registered before the flag check so a concurrent close() cannot be missed.
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(ProxyError::ShuttingDown);
            }
            if ctx.is_cancelled() {
                return Err(ProxyError::RequestTimeout);
            }
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = ctx.cancelled() => return Err(ProxyError::RequestTimeout),
                () = &mut shutdown => return Err(ProxyError::ShuttingDown),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_one_then_steady_rate() {
        let bucket = TokenBucket::new(10.0, 1);
        let ctx = RequestContext::new(None);

        bucket.acquire(&ctx).await.unwrap();
        assert!(bucket.try_acquire().is_err());

        let start = Instant::now();
        bucket.acquire(&ctx).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(99), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(110), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_consumes_nothing() {
        let bucket = TokenBucket::new(1.0, 1);
        bucket.acquire(&RequestContext::new(None)).await.unwrap();

        let ctx = RequestContext::new(Some(Duration::from_millis(300)));
        let err = bucket.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, ProxyError::RequestTimeout));

        // The cancelled waiter left the partial refill in place.
        let available = bucket.available();
        assert!((0.29..0.31).contains(&available), "available {available}");

        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(bucket.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_context_is_rejected() {
        let bucket = TokenBucket::new(100.0, 1);
        let ctx = RequestContext::with_deadline(Instant::now());
        assert!(matches!(
            bucket.acquire(&ctx).await,
            Err(ProxyError::RequestTimeout)
        ));
        assert!((bucket.available() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_do_not_double_spend() {
        let bucket = Arc::new(TokenBucket::new(20.0, 1));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                tokio::spawn(async move {
                    bucket.acquire(&RequestContext::new(None)).await.unwrap();
                    Instant::now()
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        // Five permits at 20/s with a burst of one need at least 200ms.
        let last = admitted.iter().max().unwrap();
        assert!(last.duration_since(start) >= Duration::from_millis(199));
    }

    #[tokio::test]
    async fn test_closed_bucket_rejects() {
        let bucket = TokenBucket::new(100.0, 1);
        bucket.close();
        assert!(matches!(
            bucket.acquire(&RequestContext::new(None)).await,
            Err(ProxyError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_pending_waiter() {
        let bucket = Arc::new(TokenBucket::new(0.1, 1));
        bucket.acquire(&RequestContext::new(None)).await.unwrap();

        let start = Instant::now();
        let waiter = {
            let bucket = Arc::clone(&bucket);
            tokio::spawn(async move { bucket.acquire(&RequestContext::new(None)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bucket.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ProxyError::ShuttingDown)));
        // The next token was ten seconds away; close() must not wait for it.
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }
}
