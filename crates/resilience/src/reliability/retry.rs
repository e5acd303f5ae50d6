//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, PlatformConfig};

/// Delay before retry number `retry_count`, in milliseconds
///
/// `min(max_delay, base_delay * 2^retry_count)` plus uniform jitter in
/// `[0, jitter_factor * delay)`, never exceeding `max_delay_ms`.
///
/// # Example
///
/// ```
/// use dispatch_resilience::reliability::backoff_millis;
///
/// // First retry after ~1 second, then ~2s, ~4s, ...
/// let delay = backoff_millis(0, 1_000, 300_000, 0.1);
/// assert!((1_000..1_100).contains(&delay));
/// ```
pub fn backoff_millis(retry_count: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> u64 {
    backoff_millis_with(&mut rand::thread_rng(), retry_count, base_delay_ms, max_delay_ms, jitter_factor)
}

/// [`backoff_millis`] with an explicit random source
pub fn backoff_millis_with<R: Rng + ?Sized>(
    rng: &mut R,
    retry_count: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> u64 {
    let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let delay = base_delay_ms.saturating_mul(multiplier).min(max_delay_ms);

    let jitter_factor = jitter_factor.clamp(0.0, 1.0);
    let jitter_range = delay as f64 * jitter_factor;
    let jitter = if jitter_range >= 1.0 {
        rng.gen_range(0.0..jitter_range) as u64
    } else {
        0
    };

    delay.saturating_add(jitter).min(max_delay_ms)
}

/// Backoff bounds for one platform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Fraction of the delay added as jitter
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl From<&PlatformConfig> for BackoffPolicy {
    fn from(config: &PlatformConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl BackoffPolicy {
    /// Disable jitter, for predictable delays
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before retry number `retry_count`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        Duration::from_millis(backoff_millis(
            retry_count,
            self.base_delay.as_millis() as u64,
            self.max_delay.as_millis() as u64,
            self.jitter_factor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_delay_doubles_without_jitter() {
        assert_eq!(backoff_millis(0, 1_000, 300_000, 0.0), 1_000);
        assert_eq!(backoff_millis(1, 1_000, 300_000, 0.0), 2_000);
        assert_eq!(backoff_millis(2, 1_000, 300_000, 0.0), 4_000);
        assert_eq!(backoff_millis(3, 1_000, 300_000, 0.0), 8_000);
    }

    #[test]
    fn test_max_delay_cap() {
        assert_eq!(backoff_millis(9, 1_000, 300_000, 0.0), 300_000);
        assert_eq!(backoff_millis(20, 1_000, 5_000, 0.0), 5_000);
        // Shift overflow saturates instead of wrapping
        assert_eq!(backoff_millis(80, 1_000, 300_000, 0.0), 300_000);
    }

    #[test]
    fn test_bounds_hold_for_all_small_retry_counts() {
        let mut rng = StdRng::seed_from_u64(7);
        let (base, max, jitter) = (1_000u64, 300_000u64, 0.1);

        for _ in 0..200 {
            for retry_count in 0..=10u32 {
                let delay = backoff_millis_with(&mut rng, retry_count, base, max, jitter);
                let floor = (base << retry_count).min(max);

                assert!(delay <= max, "retry {} exceeded max: {}", retry_count, delay);
                assert!(delay >= floor, "retry {} below floor: {}", retry_count, delay);
                assert!(
                    (delay as f64) < floor as f64 * (1.0 + jitter) + 1.0,
                    "retry {} jitter too large: {}",
                    retry_count,
                    delay
                );
            }
        }
    }

    #[test]
    fn test_mean_delay_is_non_decreasing() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples = 500;

        let means: Vec<f64> = (0..=10u32)
            .map(|retry_count| {
                let total: u64 = (0..samples)
                    .map(|_| backoff_millis_with(&mut rng, retry_count, 1_000, 300_000, 0.1))
                    .sum();
                total as f64 / samples as f64
            })
            .collect();

        for pair in means.windows(2) {
            assert!(pair[1] >= pair[0], "mean decreased: {:?}", pair);
        }
    }

    #[test]
    fn test_policy_from_platform_config() {
        let config = PlatformConfig::default()
            .with_base_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(10));
        let policy = BackoffPolicy::from(&config).without_jitter();

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(10));
    }
}
