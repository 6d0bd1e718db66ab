//! Retry backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with an optional uniform jitter.
///
/// The delay before retry attempt `n` (1-based over failures) is
/// `min(max_delay, base_delay * exponential_base^(n-1))`, jittered uniformly
/// in `[0.5, 1.5]` of that value when `jitter` is set.
///
/// # Example
///
/// ```
/// use visflow_durable::reliability::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default().with_jitter(false);
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier applied per additional failure.
    pub exponential_base: f64,

    /// Randomize each delay uniformly in `[0.5, 1.5]` of its nominal value.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-interval policy (no growth, no jitter).
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base_delay: interval,
            max_delay: interval,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before the retry following failure number `attempt`
    /// (1-based: the first failure yields `base_delay`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let nominal = self.base_delay.as_secs_f64()
            * self.exponential_base.powi(attempt as i32 - 1);
        let capped = nominal.min(self.max_delay.as_secs_f64());

        let delayed = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.5)
        } else {
            capped
        };

        Duration::from_secs_f64(delayed)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.exponential_base, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let policy = BackoffPolicy::default().with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn max_delay_caps_growth() {
        let policy = BackoffPolicy::default()
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::default();

        for attempt in 1..6 {
            let nominal = BackoffPolicy::default()
                .with_jitter(false)
                .delay_for_attempt(attempt)
                .as_secs_f64();
            let jittered = policy.delay_for_attempt(attempt).as_secs_f64();
            assert!(jittered >= nominal * 0.5);
            assert!(jittered <= nominal * 1.5);
        }
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(3));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3));
    }

    #[test]
    fn serialization_round_trip() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(250))
            .with_jitter(false);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
