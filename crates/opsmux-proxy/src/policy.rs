//! Reconnection policy: attempt limits, cooldown and exponential backoff.

use std::time::Duration;

use opsmux_core::config::ReconnectSettings;
use tokio::time::Instant;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(30_000);
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5_000);

/// Whether another reconnection attempt is permitted.
///
/// Refused once `attempt_count` reaches `max_attempts`, and while less than
/// `cooldown` has passed since `last_attempt`. Elapsed time equal to the
/// cooldown is allowed.
pub fn should_attempt_reconnection(
    attempt_count: u32,
    last_attempt: Option<Instant>,
    max_attempts: u32,
    cooldown: Duration,
    now: Instant,
) -> bool {
    if attempt_count >= max_attempts {
        return false;
    }
    match last_attempt {
        Some(last) => now.saturating_duration_since(last) >= cooldown,
        None => true,
    }
}

/// What the scheduler should do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Schedule(Duration),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: DEFAULT_COOLDOWN,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            cooldown: Duration::from_millis(settings.cooldown_ms),
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// `base_delay * 2^attempt`, saturating.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        match 2u32.checked_pow(attempt) {
            Some(factor) => self.base_delay.saturating_mul(factor),
            None => Duration::MAX,
        }
    }

    pub fn should_attempt(&self, attempt_count: u32, last_attempt: Option<Instant>, now: Instant) -> bool {
        should_attempt_reconnection(
            attempt_count,
            last_attempt,
            self.max_attempts,
            self.cooldown,
            now,
        )
    }

    /// Decide the next step for a provider that just failed.
    ///
    /// A provider still inside its cooldown is not given up on: the timer is
    /// stretched so it fires once the cooldown has passed. With the defaults
    /// this yields delays of 5s, 30s, 30s instead of the plain `5s * 2^n`
    /// backoff, which would always land inside the cooldown and never retry.
    pub fn decide(&self, attempt_count: u32, last_attempt: Option<Instant>, now: Instant) -> ReconnectDecision {
        if attempt_count >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }

        let backoff = self.backoff_delay(attempt_count);
        let delay = match last_attempt {
            Some(last) if !self.should_attempt(attempt_count, last_attempt, now) => {
                let remaining = self.cooldown.saturating_sub(now.saturating_duration_since(last));
                backoff.max(remaining)
            }
            _ => backoff,
        };
        ReconnectDecision::Schedule(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_limit() {
        let now = Instant::now();
        for attempts in 3..10 {
            assert!(!should_attempt_reconnection(
                attempts,
                None,
                3,
                DEFAULT_COOLDOWN,
                now
            ));
        }
        assert!(should_attempt_reconnection(2, None, 3, DEFAULT_COOLDOWN, now));
    }

    #[test]
    fn test_cooldown_boundary_is_inclusive() {
        let last = Instant::now();
        let cooldown = Duration::from_millis(30_000);

        let at_boundary = last + cooldown;
        assert!(should_attempt_reconnection(1, Some(last), 3, cooldown, at_boundary));

        let just_before = last + cooldown - Duration::from_millis(1);
        assert!(!should_attempt_reconnection(1, Some(last), 3, cooldown, just_before));
    }

    #[test]
    fn test_first_attempt_ignores_cooldown() {
        let now = Instant::now();
        assert!(should_attempt_reconnection(0, None, 3, Duration::from_secs(3600), now));
    }

    #[test]
    fn test_backoff_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(5_000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10_000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(20_000));
        // saturates instead of overflowing
        assert_eq!(policy.backoff_delay(200), Duration::MAX);
    }

    #[test]
    fn test_decide() {
        let policy = ReconnectPolicy::default();
        let now = Instant::now();

        assert_eq!(
            policy.decide(0, None, now),
            ReconnectDecision::Schedule(Duration::from_millis(5_000))
        );
        assert_eq!(policy.decide(3, None, now), ReconnectDecision::Exhausted);

        // 10s into a 30s cooldown: wait out the remaining 20s rather than 10s backoff
        let last = now - Duration::from_secs(10);
        assert_eq!(
            policy.decide(1, Some(last), now),
            ReconnectDecision::Schedule(Duration::from_secs(20))
        );

        // cooldown passed: plain backoff
        let last = now - Duration::from_secs(40);
        assert_eq!(
            policy.decide(2, Some(last), now),
            ReconnectDecision::Schedule(Duration::from_secs(20))
        );
    }

    #[test]
    fn test_from_settings() {
        let settings = ReconnectSettings {
            max_attempts: 5,
            cooldown_ms: 1_000,
            base_delay_ms: 200,
        };
        let policy = ReconnectPolicy::from(&settings);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(400));
    }
}
