//! Configuration presets for common scenarios

use super::{Config, Format};

/// Primary filter variable
pub const LOG_ENV: &str = "TUMBLER_LOG";
/// Format selector variable
pub const LOG_FORMAT_ENV: &str = "TUMBLER_LOG_FORMAT";

impl Config {
    /// Create configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a caller-provided variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // TUMBLER_LOG wins over RUST_LOG
        if let Some(level) = lookup(LOG_ENV).or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }

        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.format = format.parse().unwrap_or_default();
        }

        if config.format == Format::Json {
            config.ansi = false;
        }

        config
    }

    /// Development configuration (pretty, debug level)
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            ansi: true,
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level)
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            ansi: false,
            with_thread_ids: true,
            ..Self::default()
        }
    }

    /// Test configuration (captured by libtest)
    #[must_use]
    pub fn test() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Compact,
            ansi: false,
            test_writer: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_tumbler_log_takes_precedence() {
        let cfg = Config::from_lookup(env(&[("TUMBLER_LOG", "debug"), ("RUST_LOG", "warn")]));
        assert_eq!(cfg.level, "debug");
    }

    #[test]
    fn test_rust_log_fallback() {
        let cfg = Config::from_lookup(env(&[("RUST_LOG", "warn")]));
        assert_eq!(cfg.level, "warn");
    }

    #[test]
    fn test_json_format_disables_ansi() {
        let cfg = Config::from_lookup(env(&[("TUMBLER_LOG_FORMAT", "json")]));
        assert_eq!(cfg.format, Format::Json);
        assert!(!cfg.ansi);
    }

    #[test]
    fn test_unknown_format_falls_back_to_compact() {
        let cfg = Config::from_lookup(env(&[("TUMBLER_LOG_FORMAT", "xml")]));
        assert_eq!(cfg.format, Format::Compact);
    }

    #[test]
    fn test_presets() {
        assert_eq!(Config::development().format, Format::Pretty);
        assert_eq!(Config::production().format, Format::Json);
        assert!(Config::test().test_writer);
    }
}
