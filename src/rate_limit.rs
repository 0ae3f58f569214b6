//! Per-backend rate limiting
//!
//! Token bucket with a configured sustained rate and burst. The wait is
//! asynchronous and cancelled by the proxy shutdown token, so a stalled
//! connection never outlives `Proxy::stop`. A configured rate of zero
//! means the bucket never refills: callers block until cancellation.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::errors::Error;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub enum RateLimiter {
    /// No limit configured.
    Unlimited,
    /// Standard token bucket.
    Bucket(DirectLimiter),
    /// Rate 0: admits nothing, waits for cancellation.
    Stalled,
}

impl RateLimiter {
    pub fn from_config(cfg: Option<&RateLimitConfig>) -> Self {
        match cfg {
            None => RateLimiter::Unlimited,
            Some(rl) => match NonZeroU32::new(rl.rps) {
                None => RateLimiter::Stalled,
                Some(rps) => {
                    let burst = NonZeroU32::new(rl.burst.max(1)).unwrap();
                    RateLimiter::Bucket(governor::RateLimiter::direct(
                        Quota::per_second(rps).allow_burst(burst),
                    ))
                }
            },
        }
    }

    /// Wait for a token. Returns `Error::Shutdown` when the proxy stops
    /// before a token becomes available.
    pub async fn wait(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        match self {
            RateLimiter::Unlimited => Ok(()),
            RateLimiter::Bucket(limiter) => {
                tokio::select! {
                    _ = limiter.until_ready() => Ok(()),
                    _ = shutdown.cancelled() => Err(Error::Shutdown),
                }
            }
            RateLimiter::Stalled => {
                shutdown.cancelled().await;
                Err(Error::Shutdown)
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimiter::Unlimited => f.write_str("RateLimiter::Unlimited"),
            RateLimiter::Bucket(_) => f.write_str("RateLimiter::Bucket"),
            RateLimiter::Stalled => f.write_str("RateLimiter::Stalled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::from_config(None);
        let token = CancellationToken::new();
        for _ in 0..100 {
            limiter.wait(&token).await.unwrap();
        }
    }

    #[tokio::test]
    async fn bucket_admits_burst_immediately() {
        let limiter = RateLimiter::from_config(Some(&RateLimitConfig { rps: 10, burst: 3 }));
        let token = CancellationToken::new();
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.wait(&token).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn zero_rate_blocks_until_cancelled() {
        let limiter = RateLimiter::from_config(Some(&RateLimitConfig { rps: 0, burst: 1 }));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = limiter.wait(&token).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn bucket_wait_is_cancellable() {
        // Burst of one: the second waiter has to sit out most of a second,
        // long enough for the cancellation to win the race.
        let limiter = RateLimiter::from_config(Some(&RateLimitConfig { rps: 1, burst: 1 }));
        let token = CancellationToken::new();
        limiter.wait(&token).await.unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = limiter.wait(&token).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
