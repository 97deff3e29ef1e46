//! Run-wide request rate limiting

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};

/// Token-bucket limiter shared by every executor in a run. Token takes are
/// serialized internally; `take()` suspends until a permit is available.
pub struct RateLimiter {
    inner: Option<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `rps` requests per second. `rps == 0`
    /// disables limiting.
    pub fn per_second(rps: u32) -> Self {
        let inner = NonZeroU32::new(rps)
            .map(|rps| GovernorRateLimiter::direct(Quota::per_second(rps)));
        Self { inner }
    }

    /// An unlimited limiter.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Takes one permit, waiting as long as needed.
    pub async fn take(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..1000 {
            limiter.take().await;
        }
    }

    #[tokio::test]
    async fn limiter_grants_within_quota() {
        let limiter = RateLimiter::per_second(100);
        limiter.take().await;
    }
}
