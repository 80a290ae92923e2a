use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;

/// Leaky-bucket limiter capping requests per minute towards the cloud
/// API. Every request waits on the limiter before sending; the wait is
/// cancelled along with the caller's future.
pub struct ApiRateLimiter {
    inner: governor::DefaultDirectRateLimiter,
}

impl ApiRateLimiter {
    /// Builds a limiter admitting `rpm` requests per minute. A zero cap
    /// is clamped to one request per minute instead of deadlocking.
    pub fn new(rpm: u32) -> Self {
        let per_minute = NonZeroU32::new(rpm).unwrap_or(nonzero!(1u32));
        ApiRateLimiter {
            inner: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    /// Waits until a slot is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generous_quota_admits_immediately() {
        let limiter = ApiRateLimiter::new(6000);
        // Must not block the test for any observable amount of time.
        tokio::time::timeout(std::time::Duration::from_millis(100), async {
            limiter.acquire().await;
            limiter.acquire().await;
        })
        .await
        .expect("limiter stalled on a generous quota");
    }

    #[test]
    fn zero_cap_is_clamped() {
        // Constructing with 0 must not panic.
        let _ = ApiRateLimiter::new(0);
    }
}
