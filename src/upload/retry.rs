use std::time::Duration;

use rand::Rng;

use crate::settings::UploadSettings;

/// Exponential backoff with up to 20% jitter, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
        )
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter_cap = base.as_millis() as u64 / 5;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(1000), Duration::from_secs(10));

        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1200));

        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(4000) && third <= Duration::from_millis(4800));

        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
