use std::sync::Arc;
use std::time::Duration;

use crate::cache::{cache_key, TtlCache};
use crate::error::TrapResult;

/// Length of the fixed counting window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Fixed-window per-IP request counter.
///
/// The window opens on the first request and is not extended by later ones, so a
/// burst straddling two windows can exceed the limit briefly. That trade-off is kept.
pub struct RateLimiter {
    cache: Arc<dyn TtlCache>,
    limit: u64,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn TtlCache>, limit: u64) -> Self {
        Self { cache, limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Count this request and return the running total for the window
    pub async fn increment(&self, ip: &str) -> TrapResult<u64> {
        self.cache
            .incr_with_ttl(&cache_key("rate", ip), RATE_WINDOW)
            .await
    }

    pub fn is_exceeded(&self, count: u64) -> bool {
        count > self.limit
    }

    pub fn ban_reason(count: u64) -> String {
        format!("Rate limit exceeded ({}/min)", count)
    }
}
