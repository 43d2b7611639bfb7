use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Sliding-window limiter: at most `max_requests` acquisitions inside any
/// `window`. A caller that would exceed the ceiling sleeps until the oldest
/// timestamp leaves the window.
///
/// The lock is held while sleeping, so waiters queue up behind each other
/// instead of racing for the same freed slot.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_window(requests_per_second, Duration::from_secs(1))
    }

    pub fn with_window(max_requests: u32, window: Duration) -> Self {
        let max_requests = max_requests.max(1) as usize;
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub async fn acquire(&self) {
        let mut timestamps = self.timestamps.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = timestamps.front() {
                if now.duration_since(oldest) >= self.window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }

            if timestamps.len() < self.max_requests {
                timestamps.push_back(now);
                return;
            }

            if let Some(&oldest) = timestamps.front() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_three_windows_take_at_least_two_seconds() {
        let n = 10;
        let limiter = RateLimiter::new(n);
        let start = Instant::now();

        for _ in 0..(3 * n) {
            limiter.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_under_ceiling_does_not_wait() {
        let limiter = RateLimiter::new(40);
        let start = Instant::now();
        for _ in 0..40 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_ceiling() {
        let n = 5;
        let limiter = Arc::new(RateLimiter::new(n));
        let start = Instant::now();

        let tasks: Vec<_> = (0..(3 * n))
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_zero_ceiling_is_clamped() {
        assert_eq!(RateLimiter::new(0).max_requests(), 1);
    }
}
