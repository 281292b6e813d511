use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Enforces a minimum spacing between the starts of consecutive operations.
/// Completion times are not tracked, so a slow operation does not delay the
/// next one beyond `min_delay` after its start.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_start: Mutex::new(None),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        operation().await
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut last = self
                    .last_start
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                match *last {
                    Some(previous) if now.duration_since(previous) < self.min_delay => {
                        self.min_delay - now.duration_since(previous)
                    }
                    _ => {
                        *last = Some(now);
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}
