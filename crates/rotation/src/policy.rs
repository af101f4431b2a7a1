//! Failure policies
//!
//! A job's [`RotationPolicy`] decides what happens after its rotate callback
//! fails: retry soon with exponential backoff, or wait for the regular
//! schedule.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// On-failure behaviour of one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    /// Retry for the first few failures, then behave like [`Fail`](Self::Fail)
    #[default]
    Default,
    /// Always retry with backoff
    Retry,
    /// Never retry before the next regular fire
    Fail,
}

/// What the dispatcher does with a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Cool down and retry after a backoff
    Retry,
    /// Keep the regular schedule
    Reschedule,
}

impl RotationPolicy {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }

    /// Action after the `consecutive_failures`-th failure in a row
    ///
    /// `default_retries` is how many failures [`Default`](Self::Default)
    /// retries before it degrades to [`Fail`](Self::Fail).
    pub fn on_failure(self, consecutive_failures: u32, default_retries: u32) -> FailureAction {
        match self {
            Self::Retry => FailureAction::Retry,
            Self::Fail => FailureAction::Reschedule,
            Self::Default if consecutive_failures <= default_retries => FailureAction::Retry,
            Self::Default => FailureAction::Reschedule,
        }
    }
}

impl FromStr for RotationPolicy {
    type Err = FieldError;

    /// Empty input selects [`Default`](Self::Default); names must match exactly
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(Self::Default),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(FieldError::InvalidPolicy {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff for retried rotations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound before jitter
    pub cap: Duration,
}

impl RetryBackoff {
    /// Backoff with the given base and cap
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// `min(base * 2^(n-1), cap)` for the `n`-th consecutive failure
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// [`delay`](Self::delay) plus jitter in `[0, base)`
    pub fn jittered(&self, failures: u32) -> Duration {
        use rand::Rng;

        let base_ms = self.base.as_millis() as u64;
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..base_ms)
        };
        self.delay(failures) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", RotationPolicy::Default)]
    #[case("default", RotationPolicy::Default)]
    #[case("retry", RotationPolicy::Retry)]
    #[case("fail", RotationPolicy::Fail)]
    fn test_parse(#[case] raw: &str, #[case] expected: RotationPolicy) {
        assert_eq!(raw.parse::<RotationPolicy>().unwrap(), expected);
    }

    #[rstest]
    #[case("sometimes")]
    #[case(" fail ")]
    #[case("Retry")]
    #[case(" ")]
    fn test_parse_rejects_unknown(#[case] raw: &str) {
        let err = raw.parse::<RotationPolicy>().unwrap_err();
        assert!(err.to_string().starts_with("invalid rotation_policy"));
    }

    #[test]
    fn test_default_degrades_after_configured_retries() {
        let actions: Vec<_> = (1..=4)
            .map(|n| RotationPolicy::Default.on_failure(n, 2))
            .collect();
        assert_eq!(
            actions,
            [
                FailureAction::Retry,
                FailureAction::Retry,
                FailureAction::Reschedule,
                FailureAction::Reschedule,
            ]
        );
        assert_eq!(RotationPolicy::Retry.on_failure(100, 2), FailureAction::Retry);
        assert_eq!(RotationPolicy::Fail.on_failure(1, 2), FailureAction::Reschedule);
    }

    #[rstest]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(3, 120)]
    #[case(5, 480)]
    #[case(6, 600)]
    #[case(60, 600)]
    fn test_backoff_doubles_until_cap(#[case] failures: u32, #[case] expected_secs: u64) {
        let backoff = RetryBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        assert_eq!(backoff.delay(failures), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_jitter_is_below_base() {
        let backoff = RetryBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        for _ in 0..200 {
            let d = backoff.jittered(2);
            assert!(d >= Duration::from_secs(60) && d < Duration::from_secs(90), "{d:?}");
        }
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&RotationPolicy::Retry).unwrap(), r#""retry""#);
    }
}
