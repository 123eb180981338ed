//! Fixed-attempt retry with a validity predicate.
//!
//! Instruments behind a relay sometimes answer with an out-of-range
//! placeholder (a negative temperature, a zero pressure) while they settle.
//! The client re-asks a fixed number of times with a fixed delay, and
//! reports exhaustion as an error instead of passing the placeholder on.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Which values count as a real reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Any,
    Finite,
    NonNegative,
    /// Inclusive bounds
    Range { min: f32, max: f32 },
}

impl Validity {
    /// Whether `value` counts as a real reading.
    pub fn accepts(&self, value: f32) -> bool {
        match *self {
            Validity::Any => true,
            Validity::Finite => value.is_finite(),
            Validity::NonNegative => value.is_finite() && value >= 0.0,
            Validity::Range { min, max } => value >= min && value <= max,
        }
    }
}

/// A value that passed validation, and how many attempts it took.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measured {
    pub value: f32,
    pub attempts: u32,
}

/// Run `attempt` until it yields a value `validity` accepts.
///
/// Transient errors ([`RelayError::is_transient`]) and rejected values are
/// retried; any other error is returned at once. After `max_attempts` the
/// result is [`RelayError::RetriesExhausted`] carrying the last value seen.
pub async fn retry_until_valid<F, Fut>(
    policy: &RetryPolicy,
    validity: Validity,
    mut attempt: F,
) -> RelayResult<Measured>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RelayResult<f32>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_value = None;

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) if validity.accepts(value) => {
                return Ok(Measured { value, attempts: n });
            }
            Ok(value) => {
                debug!(attempt = n, value, ?validity, "Rejected reading");
                last_value = Some(value);
            }
            Err(e) if e.is_transient() => {
                debug!(attempt = n, error = %e, "Transient failure");
            }
            Err(e) => return Err(e),
        }
        if n < max_attempts {
            sleep(policy.retry_delay).await;
        }
    }

    warn!(attempts = max_attempts, ?last_value, "Giving up");
    Err(RelayError::RetriesExhausted {
        attempts: max_attempts,
        last_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_until_valid(&policy(3), Validity::NonNegative, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n < 2 { -1.0 } else { 4.2 }) }
        })
        .await
        .unwrap();
        assert_eq!(result, Measured { value: 4.2, attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_logic_fails_after_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = retry_until_valid(&policy(4), Validity::NonNegative, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(-1.0) }
        })
        .await;
        assert!(matches!(
            result,
            Err(RelayError::RetriesExhausted { attempts: 4, last_value: Some(v) }) if v == -1.0
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(logs_contain("Giving up"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let result = retry_until_valid(&policy(3), Validity::Any, |n| async move {
            if n == 1 {
                Err(RelayError::EmptyReply)
            } else {
                Ok(1.0)
            }
        })
        .await
        .unwrap();
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result = retry_until_valid(&policy(5), Validity::Any, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RelayError::Unrecognized("Q".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::Unrecognized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let result = retry_until_valid(&policy(0), Validity::Any, |_| async { Ok(0.0) })
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_validity_predicates() {
        assert!(Validity::Any.accepts(f32::NAN));
        assert!(!Validity::Finite.accepts(f32::INFINITY));
        assert!(Validity::NonNegative.accepts(0.0));
        assert!(!Validity::NonNegative.accepts(-1.0e-9));
        let range = Validity::Range { min: 1.0, max: 2.0 };
        assert!(range.accepts(1.0) && range.accepts(2.0));
        assert!(!range.accepts(2.5));
    }

    #[test]
    fn test_validity_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            validity: Validity,
        }
        let w: Wrapper = toml::from_str(r#"validity = "non_negative""#).unwrap();
        assert_eq!(w.validity, Validity::NonNegative);
        let w: Wrapper = toml::from_str("validity = { range = { min = 0.0, max = 400.0 } }").unwrap();
        assert_eq!(w.validity, Validity::Range { min: 0.0, max: 400.0 });
    }
}
