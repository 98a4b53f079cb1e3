use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Spaces provider calls at least `60s / requests_per_minute` apart. Shared
/// by every worker that holds a clone of the `Arc`. A reserved slot is
/// consumed even if the caller gives up waiting.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `0` means unlimited.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let interval = (requests_per_minute > 0)
            .then(|| Duration::from_secs(60) / requests_per_minute);
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::per_minute(0)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait for the next free slot and reserve it.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
