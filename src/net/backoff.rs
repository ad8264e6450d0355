//! Reconnect backoff

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnect delay: `min(max_interval, interval * rate^attempt)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub rate: f64,
    /// Retries before giving up, 0 = unlimited
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval),
            max_interval: Duration::from_millis(config.max_interval),
            rate: config.delay,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.rate.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.interval.as_millis() as f64 * factor;
        let max_millis = self.max_interval.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            self.max_interval
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Whether `attempts` retries use up the allowed attempts
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(7_500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(11_250));
        assert_eq!(policy.delay_for(100), Duration::from_millis(300_000));
    }

    #[test]
    fn test_delays_monotonic_and_capped() {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(30),
            rate: 1.7,
            max_attempts: 0,
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..2_000 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt} went down");
            assert!(delay <= policy.max_interval);
            previous = delay;
        }
        assert_eq!(previous, policy.max_interval);
    }

    #[test]
    fn test_constant_rate() {
        let policy = ReconnectPolicy {
            rate: 1.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(0), policy.delay_for(50));
    }

    #[test]
    fn test_exhausted() {
        let unlimited = ReconnectPolicy::default();
        assert!(!unlimited.exhausted(u32::MAX));

        let limited = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(!limited.exhausted(2));
        assert!(limited.exhausted(3));
    }
}
