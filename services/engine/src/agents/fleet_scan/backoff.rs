//! Retry Backoff Policy
//!
//! Pure retry decisions for classified failures. The credential cache and the
//! paginated enumerator both consult this policy; nothing else retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_SERVER_ERROR_ATTEMPTS: u32 = 2;

/// Classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Throttling,
    TransientNetwork,
    AuthExpired,
    PermanentClientError,
    PermanentServerError,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Throttling => write!(f, "throttling"),
            ErrorClass::TransientNetwork => write!(f, "transient_network"),
            ErrorClass::AuthExpired => write!(f, "auth_expired"),
            ErrorClass::PermanentClientError => write!(f, "permanent_client_error"),
            ErrorClass::PermanentServerError => write!(f, "permanent_server_error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
    /// Give up on this call, refresh the credential and restart the unit of work
    RefreshCredential,
}

/// Exponential backoff with full jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    max_server_error_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_server_error_attempts: DEFAULT_MAX_SERVER_ERROR_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_attempts,
            max_server_error_attempts: DEFAULT_MAX_SERVER_ERROR_ATTEMPTS.min(max_attempts),
        }
    }

    pub fn with_server_error_attempts(mut self, attempts: u32) -> Self {
        self.max_server_error_attempts = attempts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Retry ceiling for a retryable class
    pub fn attempt_limit(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::PermanentServerError => self.max_server_error_attempts.min(self.max_attempts),
            _ => self.max_attempts,
        }
    }

    /// Delay before jitter: `base * 2^(attempt-1)`, capped at `max_delay`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        self.decide_with_rng(attempt, class, &mut rand::thread_rng())
    }

    pub fn decide_with_rng<R: Rng + ?Sized>(&self, attempt: u32, class: ErrorClass, rng: &mut R) -> RetryDecision {
        match class {
            ErrorClass::PermanentClientError => RetryDecision::GiveUp,
            ErrorClass::AuthExpired => RetryDecision::RefreshCredential,
            ErrorClass::Throttling | ErrorClass::TransientNetwork | ErrorClass::PermanentServerError => {
                if attempt > self.attempt_limit(class) {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::RetryAfter(full_jitter(self.base_delay(attempt.max(1)), rng))
            }
        }
    }
}

fn full_jitter<R: Rng + ?Sized>(ceiling: Duration, rng: &mut R) -> Duration {
    let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..=nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_client_error_gives_up_immediately() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.decide(1, ErrorClass::PermanentClientError), RetryDecision::GiveUp);
    }

    #[test]
    fn test_auth_expired_requests_refresh() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.decide(1, ErrorClass::AuthExpired), RetryDecision::RefreshCredential);
        assert_eq!(policy.decide(4, ErrorClass::AuthExpired), RetryDecision::RefreshCredential);
    }

    #[test]
    fn test_base_delay_strictly_increases_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2), 10);
        let delays: Vec<Duration> = (1..=10).map(|attempt| policy.base_delay(attempt)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[4], Duration::from_millis(1600));
        for pair in delays.windows(2) {
            if pair[0] < Duration::from_secs(2) {
                assert!(pair[1] > pair[0]);
            } else {
                assert_eq!(pair[1], pair[0]);
            }
        }
        assert_eq!(delays[9], Duration::from_secs(2));
    }

    #[test]
    fn test_base_delay_saturates_on_huge_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX);
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_base_delay() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(5), 6);
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..=6 {
            for _ in 0..50 {
                match policy.decide_with_rng(attempt, ErrorClass::Throttling, &mut rng) {
                    RetryDecision::RetryAfter(delay) => assert!(delay <= policy.base_delay(attempt)),
                    other => panic!("unexpected decision {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(matches!(
            policy.decide(DEFAULT_MAX_ATTEMPTS, ErrorClass::TransientNetwork),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.decide(DEFAULT_MAX_ATTEMPTS + 1, ErrorClass::TransientNetwork),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_server_errors_have_lower_ceiling() {
        let policy = BackoffPolicy::default();
        assert!(matches!(
            policy.decide(2, ErrorClass::PermanentServerError),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.decide(3, ErrorClass::PermanentServerError), RetryDecision::GiveUp);
        assert!(matches!(policy.decide(3, ErrorClass::Throttling), RetryDecision::RetryAfter(_)));
    }
}
