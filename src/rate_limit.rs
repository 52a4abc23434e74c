use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Policy consulted before every call to the upstream gateway.
#[async_trait]
pub trait CallLimiter: Send + Sync {
    /// Wait until the next call is allowed.
    async fn acquire(&self);
}

/// Enforces a minimum interval between consecutive calls.
///
/// Slots are reserved under the lock and waited for outside it, so
/// concurrent callers queue up one interval apart instead of bursting.
pub struct MinIntervalLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CallLimiter for MinIntervalLimiter {
    async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!("Rate limit: waiting {:?} before next gateway call", wait);
            tokio::time::sleep_until(slot).await;
        }
    }
}
