//! Logger builder implementation

use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{Config, Format};
use crate::error::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard returned by [`LoggerBuilder::build`]
///
/// Keep it alive for the lifetime of the process; it records what was installed.
#[derive(Debug)]
pub struct LoggerGuard {
    format: Format,
    level: String,
}

impl LoggerGuard {
    /// Format of the installed layer
    pub fn format(&self) -> Format {
        self.format
    }

    /// Filter directive of the installed layer
    pub fn level(&self) -> &str {
        &self.level
    }
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Parse the configured filter without installing anything
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Filter`] when the directive does not parse.
    pub fn filter(&self) -> LogResult<EnvFilter> {
        EnvFilter::try_new(&self.config.level).map_err(|e| LogError::Filter {
            directive: self.config.level.clone(),
            reason: e.to_string(),
        })
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Filter string cannot be parsed
    /// - A global subscriber is already installed
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = self.filter()?;

        Registry::default()
            .with(filter)
            .with(fmt_layer(&self.config))
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized)?;

        tracing::debug!(
            level = %self.config.level,
            format = %self.config.format,
            "logger initialized"
        );

        Ok(LoggerGuard {
            format: self.config.format,
            level: self.config.level,
        })
    }
}

fn fmt_layer<S>(config: &Config) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi && config.format != Format::Json)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    match (config.format, config.test_writer) {
        (Format::Pretty, false) => base.pretty().boxed(),
        (Format::Pretty, true) => base.pretty().with_test_writer().boxed(),
        (Format::Compact, false) => base.compact().boxed(),
        (Format::Compact, true) => base.compact().with_test_writer().boxed(),
        (Format::Json, false) => base.json().boxed(),
        (Format::Json, true) => base.json().with_test_writer().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let builder = LoggerBuilder::from_config(Config::default().with_level("info,=[{"));
        let err = builder.build().unwrap_err();
        assert!(matches!(err, LogError::Filter { .. }), "got {err:?}");
    }

    #[test]
    fn test_valid_filter_parses() {
        let builder =
            LoggerBuilder::from_config(Config::default().with_level("info,tumbler_rotation=debug"));
        assert!(builder.filter().is_ok());
    }
}
