use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
pub const DEFAULT_JITTER: f64 = 0.25;

/// Exponential reconnect delay with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the random extra, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt-1), max)` for attempts counted from 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rng.gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test_timeout::timeout]
    fn doubles_up_to_the_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (1..=7).map(|attempt| policy.base_delay(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(8));
    }

    #[test_timeout::timeout]
    fn jitter_stays_within_a_quarter() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt, &mut rng);
            assert!(delay >= base);
            assert!(delay <= base + base / 4);
        }
    }

    #[test_timeout::timeout]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(3, &mut rng), Duration::from_secs(2));
    }
}
