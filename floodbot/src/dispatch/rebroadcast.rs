// Standard library imports
use std::time::Duration;

// Third party imports
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};

/// Resubmission policy for unconfirmed transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebroadcastConfig {
    /// Delay before the first rebroadcast (seconds)
    pub base_interval: u64,
    /// Growth factor between consecutive rebroadcasts
    pub multiplier: f64,
    /// Upper bound of the delay (seconds)
    pub max_interval: u64,
    /// Rebroadcasts before the entry completes with a confirmation timeout
    pub max_attempts: u32,
    /// Fee increase per rebroadcast in percent, 0 resends the identical transaction
    pub fee_bump_percent: u64,
    /// Endpoints a rebroadcast is sent to
    pub fanout: usize,
    /// Lowest pending nonces per account eligible for rebroadcast
    pub window: usize,
}

impl Default for RebroadcastConfig {
    fn default() -> Self {
        Self {
            base_interval: 20,
            multiplier: 1.5,
            max_interval: 300,
            max_attempts: 10,
            fee_bump_percent: 0,
            fanout: 5,
            window: 2,
        }
    }
}

impl RebroadcastConfig {
    /// Fresh schedule for one pending entry
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(self.base_interval))
            .with_multiplier(self.multiplier.max(1.0))
            .with_max_interval(Duration::from_secs(self.max_interval.max(self.base_interval)))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_schedule_grows_to_cap() {
        let config = RebroadcastConfig {
            base_interval: 20,
            multiplier: 2.0,
            max_interval: 60,
            ..Default::default()
        };
        let mut backoff = config.backoff();
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_backoff().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![20, 40, 60, 60]);
    }

    #[test]
    fn test_schedule_never_ends() {
        let mut backoff = RebroadcastConfig::default().backoff();
        for _ in 0..50 {
            assert!(backoff.next_backoff().is_some());
        }
    }
}
