// Standard library imports
use std::{sync::Mutex, time::Duration};

// Third party imports
use tokio::time::Instant;

/// Paces submissions to `throughput` per slot window, one at a time without bursts
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

struct LimiterState {
    throughput: u64,
    slot: Duration,
    interval: Option<Duration>,
    next: Instant,
}

fn interval_for(throughput: u64, slot: Duration) -> Option<Duration> {
    (throughput > 0).then(|| slot.div_f64(throughput as f64))
}

impl RateLimiter {
    /// `throughput = 0` never waits
    pub fn new(throughput: u64, slot: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                throughput,
                slot,
                interval: interval_for(throughput, slot),
                next: Instant::now(),
            }),
        }
    }

    pub fn throughput(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).throughput
    }

    pub fn set_throughput(&self, throughput: u64) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.throughput = throughput;
        state.interval = interval_for(throughput, state.slot);
    }

    /// Waits for the next submission time
    pub async fn acquire(&self) {
        let target = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(interval) = state.interval else {
                return;
            };
            let at = state.next.max(Instant::now());
            state.next = at + interval;
            at
        };
        tokio::time::sleep_until(target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paces_to_throughput() {
        let limiter = RateLimiter::new(12, Duration::from_secs(12));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_and_raised_rate() {
        let limiter = RateLimiter::new(0, Duration::from_secs(12));
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.set_throughput(24);
        assert_eq!(limiter.throughput(), 24);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
