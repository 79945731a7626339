//! Reconnect policy: fixed delay by default, optional growth and attempt cap.

use std::time::Duration;

/// Configuration for reconnecting after an abnormal close.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reconnect at all. When `false` an abnormal close ends in `Disconnected`.
    pub auto_reconnect: bool,
    /// Wait before the first reconnect attempt.
    pub delay: Duration,
    /// Multiplier applied to the delay on each further attempt (1.0 = fixed).
    pub multiplier: f64,
    /// Cap for the grown delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Auto-reconnect with a fixed delay and no attempt cap.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            auto_reconnect: true,
            delay,
            ..Default::default()
        }
    }
}

/// Stateless reconnect policy: computes the delay given the attempt number.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th reconnect (1-based).
    /// Returns `None` if reconnecting is disabled or the attempts are used up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let growth = self.config.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base_ms = self.config.delay.as_millis() as f64 * growth;
        let cap_ms = self.config.max_delay.as_millis().max(self.config.delay.as_millis()) as f64;
        Some(Duration::from_millis(base_ms.min(cap_ms) as u64))
    }

    /// Returns `true` if another reconnect may be attempted after `attempt - 1` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.config.auto_reconnect
            && self.config.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_never_grows() {
        let policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(250)));
        for attempt in 1..50 {
            assert_eq!(policy.next_delay(attempt), Some(Duration::from_millis(250)));
        }
    }

    #[test]
    fn disabled_policy_never_reconnects() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default());
        assert!(policy.next_delay(1).is_none());
    }

    #[test]
    fn growth_is_capped() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            auto_reconnect: true,
            delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts: None,
        });
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert_eq!(policy.next_delay(4).unwrap().as_millis(), 500);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::fixed(Duration::from_millis(10))
        });
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(policy.next_delay(3).is_none());
    }
}
