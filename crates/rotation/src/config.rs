//! Rotation manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RotationError, RotationResult};
use crate::policy::RetryBackoff;

/// Prefix of the environment overrides read by [`RotationConfig::from_env`]
pub const ENV_PREFIX: &str = "TUMBLER_ROTATION_";

/// Rotation manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Run automated rotation on this node; `false` is community mode
    pub enabled: bool,
    /// Size of the worker pool calling backends
    pub workers: usize,
    /// Deadline of one rotate callback, unless the mount overrides it
    #[serde(with = "humantime_serde")]
    pub rotation_timeout: Duration,
    /// How long shutdown waits for in-flight rotations
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
    /// Longest retry delay before jitter
    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,
    /// Failures the `default` policy retries before keeping the regular schedule
    pub default_policy_retries: u32,
    /// Buffered rotation events per subscriber
    pub event_capacity: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 8,
            rotation_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(600),
            default_policy_retries: 2,
            event_capacity: 256,
        }
    }
}

impl RotationConfig {
    /// Community mode: registration is refused
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Override the worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override the rotate callback deadline
    #[must_use]
    pub fn with_rotation_timeout(mut self, timeout: Duration) -> Self {
        self.rotation_timeout = timeout;
        self
    }

    /// Override retry base and cap
    #[must_use]
    pub fn with_retry(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self
    }

    /// Backoff derived from `retry_base` and `retry_cap`
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.retry_base, self.retry_cap)
    }

    /// Reject values the dispatcher cannot run with
    pub fn validate(&self) -> RotationResult<()> {
        let invalid = |reason: &str| {
            Err(RotationError::Config {
                reason: reason.to_string(),
            })
        };
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.rotation_timeout.is_zero() {
            return invalid("rotation_timeout must be non-zero");
        }
        if self.retry_base.is_zero() {
            return invalid("retry_base must be non-zero");
        }
        if self.retry_cap < self.retry_base {
            return invalid("retry_cap must not be below retry_base");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be at least 1");
        }
        Ok(())
    }

    /// Defaults overlaid with `TUMBLER_ROTATION_*` variables
    pub fn from_env() -> RotationResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RotationConfig::from_env`] with a caller-provided variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RotationResult<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(raw) = var("ENABLED") {
            config.enabled = parse(&raw, "ENABLED", |s| s.parse::<bool>().ok())?;
        }
        if let Some(raw) = var("WORKERS") {
            config.workers = parse(&raw, "WORKERS", |s| s.parse().ok())?;
        }
        if let Some(raw) = var("TIMEOUT") {
            config.rotation_timeout = parse(&raw, "TIMEOUT", duration)?;
        }
        if let Some(raw) = var("SHUTDOWN_GRACE") {
            config.shutdown_grace = parse(&raw, "SHUTDOWN_GRACE", duration)?;
        }
        if let Some(raw) = var("RETRY_BASE") {
            config.retry_base = parse(&raw, "RETRY_BASE", duration)?;
        }
        if let Some(raw) = var("RETRY_CAP") {
            config.retry_cap = parse(&raw, "RETRY_CAP", duration)?;
        }
        if let Some(raw) = var("DEFAULT_POLICY_RETRIES") {
            config.default_policy_retries = parse(&raw, "DEFAULT_POLICY_RETRIES", |s| s.parse().ok())?;
        }
        if let Some(raw) = var("EVENT_CAPACITY") {
            config.event_capacity = parse(&raw, "EVENT_CAPACITY", |s| s.parse().ok())?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn duration(raw: &str) -> Option<Duration> {
    humantime_serde::re::humantime::parse_duration(raw).ok()
}

fn parse<T>(raw: &str, name: &str, f: impl Fn(&str) -> Option<T>) -> RotationResult<T> {
    f(raw.trim()).ok_or_else(|| RotationError::Config {
        reason: format!("{ENV_PREFIX}{name}: cannot parse `{raw}`"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_validate() {
        let config = RotationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.rotation_timeout, Duration::from_secs(60));
        assert_eq!(config.retry_cap, Duration::from_secs(600));
    }

    #[test]
    fn test_from_lookup_overlays() {
        let env: HashMap<&str, &str> = [
            ("TUMBLER_ROTATION_WORKERS", "2"),
            ("TUMBLER_ROTATION_TIMEOUT", "5s"),
            ("TUMBLER_ROTATION_ENABLED", "false"),
        ]
        .into();
        let config =
            RotationConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.rotation_timeout, Duration::from_secs(5));
        assert!(!config.enabled);
        assert_eq!(config.retry_base, Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = RotationConfig::from_lookup(|k| {
            (k == "TUMBLER_ROTATION_RETRY_BASE").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("TUMBLER_ROTATION_RETRY_BASE"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        assert!(RotationConfig::default().with_workers(0).validate().is_err());
    }

    #[test]
    fn test_serde_humantime() {
        let config: RotationConfig =
            serde_json::from_str(r#"{"rotation_timeout":"2m","retry_base":"1s"}"#).unwrap();
        assert_eq!(config.rotation_timeout, Duration::from_secs(120));
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.workers, 8);
    }
}
