use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::provider::ProviderLimits;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-provider request budget: a requests-per-minute limiter plus a cap on
/// in-flight calls.
#[derive(Clone)]
pub struct ThrottlingQueue {
    limiter: Option<Arc<DirectRateLimiter>>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ThrottlingQueue {
    pub fn new(limits: &ProviderLimits) -> Self {
        let limiter = (limits.requests_per_minute > 0)
            .then(|| Arc::new(RateLimiter::direct(per_minute_quota(limits.requests_per_minute))));
        let max_concurrent = if limits.max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            limits.max_concurrent as usize
        };

        Self {
            limiter,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&ProviderLimits::unlimited())
    }

    /// Take one unit of rate budget, or report how long until one frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    /// Wait up to `wait` for a concurrency slot. The slot is released when the
    /// permit drops.
    pub async fn acquire_slot(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(wait, Arc::clone(&self.slots).acquire_owned())
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl std::fmt::Debug for ThrottlingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlingQueue")
            .field("rate_limited", &self.limiter.is_some())
            .field("max_concurrent", &self.max_concurrent)
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

fn per_minute_quota(requests_per_minute: u32) -> Quota {
    let burst = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(burst).allow_burst(burst)
}
