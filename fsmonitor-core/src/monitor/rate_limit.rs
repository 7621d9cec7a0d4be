//! Token-bucket throttle for the processing loop
//!
//! Bounds how fast events are dequeued for processing. Producer speed is
//! governed by queue capacity, not by this limiter.

use crate::monitor::RateLimitOptions;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    /// Sustained tokens per second; zero or below disables limiting.
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(options: RateLimitOptions) -> Self {
        let burst = f64::from(options.max_burst.max(1));
        Self {
            rate: options.events_per_second,
            burst,
            // Start full so an initial burst goes through unthrottled.
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
        }
    }

    /// Take one token, suspending until one refills.
    ///
    /// Returns `false` if cancellation fired before a token was available.
    pub async fn wait_for_token(&self, cancel: &CancellationToken) -> bool {
        if self.rate <= 0.0 {
            return !cancel.is_cancelled();
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            trace!(?wait, "rate limiter exhausted, waiting for refill");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_passes_without_waiting() {
        let limiter =
            RateLimiter::new(RateLimitOptions { events_per_second: 1.0, max_burst: 5 });
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.wait_for_token(&cancel).await);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sustained_rate_bounds_throughput() {
        let limiter =
            RateLimiter::new(RateLimitOptions { events_per_second: 50.0, max_burst: 1 });
        let cancel = CancellationToken::new();

        // Bucket starts with one token; the next 4 refill at 20ms each.
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.wait_for_token(&cancel).await);
        }
        assert!(start.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let limiter =
            RateLimiter::new(RateLimitOptions { events_per_second: 0.1, max_burst: 1 });
        let cancel = CancellationToken::new();

        assert!(limiter.wait_for_token(&cancel).await);

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait_for_token(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_rate_means_unlimited() {
        let limiter =
            RateLimiter::new(RateLimitOptions { events_per_second: 0.0, max_burst: 1 });
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            assert!(limiter.wait_for_token(&cancel).await);
        }
    }
}
