//! Session configuration

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// Session client configuration
///
/// The access token is accepted when deserializing but never serialized or printed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service name announced in the handshake
    pub service: String,
    /// Resource announced in the handshake
    pub resource: String,
    /// Bearer token presented to the broker
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
    /// Base delay between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Upper bound (exclusive) of the random delay added to `reconnect_backoff`
    #[serde(with = "humantime_serde")]
    pub reconnect_jitter: Duration,
    /// Delay before going terminal after a no-retry disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_delay: Duration,
    /// Deadline for connect + acknowledgement
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Fraction of the remaining session lifetime after which to re-handshake
    pub refresh_ratio: f64,
    /// Capacity of the driver action channel
    pub action_buffer: usize,
    /// Capacity of each listener queue
    pub listener_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            resource: String::new(),
            access_token: SecretString::from(String::new()),
            reconnect_backoff: Duration::from_secs(10),
            reconnect_jitter: Duration::from_secs(10),
            disconnect_delay: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(30),
            refresh_ratio: 0.9,
            action_buffer: 16,
            listener_buffer: 32,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("service", &self.service)
            .field("resource", &self.resource)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("disconnect_delay", &self.disconnect_delay)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("refresh_ratio", &self.refresh_ratio)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Configuration for `service` on `resource` authenticated by `access_token`
    pub fn new(
        service: impl Into<String>,
        resource: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            resource: resource.into(),
            access_token: SecretString::from(access_token.into()),
            ..Self::default()
        }
    }

    /// Override reconnect backoff and jitter
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration, jitter: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self.reconnect_jitter = jitter;
        self
    }

    /// Override the handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Clamp values that would stall the driver
    pub(crate) fn normalized(mut self) -> Self {
        if !(self.refresh_ratio > 0.0 && self.refresh_ratio <= 1.0) {
            self.refresh_ratio = 0.9;
        }
        self.action_buffer = self.action_buffer.max(1);
        self.listener_buffer = self.listener_buffer.max(1);
        self
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(10));
        assert_eq!(cfg.reconnect_jitter, Duration::from_secs(10));
        assert_eq!(cfg.disconnect_delay, Duration::from_secs(1));
        assert!((cfg.refresh_ratio - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_token_is_read_but_never_written() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"service":"vault","resource":"n1","access_token":"tok","reconnect_backoff":"5s"}"#,
        )
        .unwrap();
        assert_eq!(cfg.access_token.expose_secret(), "tok");
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(5));

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("tok\""));
        assert!(!format!("{cfg:?}").contains("tok\""));
    }

    #[test]
    fn test_normalized_repairs_ratio() {
        let cfg = SessionConfig {
            refresh_ratio: 0.0,
            action_buffer: 0,
            ..SessionConfig::default()
        }
        .normalized();
        assert!((cfg.refresh_ratio - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.action_buffer, 1);
    }
}
