use std::{
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use crate::config::RetryConfig;

/// Exponential backoff with jitter derived from a caller-provided seed, so the
/// same job/attempt pair always gets the same delay.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `base * 2^(attempt-1)` capped at the configured maximum.
    pub fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = (attempt.saturating_sub(1)) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    pub fn delay_ms<S: Hash>(&self, attempt: u16, seed: S) -> u64 {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor as f64 - jitter_span);
        let upper = (anchor as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(&seed, attempt);
        (lower + (upper - lower) * unit).round() as u64
    }

    pub fn delay<S: Hash>(&self, attempt: u16, seed: S) -> Duration {
        Duration::from_millis(self.delay_ms(attempt, seed))
    }

    /// True while another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: u16) -> bool {
        attempts < self.config.max_attempts.max(1)
    }
}

fn deterministic_unit<S: Hash>(seed: &S, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    seed.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 100,
        }
    }

    #[test]
    fn base_delay_doubles_and_caps() {
        let backoff = Backoff::new(config());
        assert_eq!(backoff.base_delay_ms(0), 0);
        assert_eq!(backoff.base_delay_ms(1), 1_000);
        assert_eq!(backoff.base_delay_ms(2), 2_000);
        assert_eq!(backoff.base_delay_ms(4), 8_000);
        assert_eq!(backoff.base_delay_ms(9), 10_000);
    }

    #[test]
    fn jitter_is_bounded_and_stable() {
        let backoff = Backoff::new(config());
        for attempt in 1..=6u16 {
            let anchor = backoff.base_delay_ms(attempt) as f64;
            let span = (anchor * 0.25).max(100.0);
            let delay = backoff.delay_ms(attempt, "job-a") as f64;
            assert!(delay >= (anchor - span).max(0.0) - 1.0);
            assert!(delay <= (anchor + span).min(10_000.0) + 1.0);
            assert_eq!(
                backoff.delay_ms(attempt, "job-a"),
                backoff.delay_ms(attempt, "job-a")
            );
        }
    }

    #[test]
    fn retry_allowance_tracks_max_attempts() {
        let backoff = Backoff::new(config());
        assert!(backoff.allows_retry(4));
        assert!(!backoff.allows_retry(5));
    }
}
