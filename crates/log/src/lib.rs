//! # tumbler-log
//!
//! Logging bootstrap shared by every tumbler binary and test suite.
//!
//! Library crates only emit `tracing` events; the host decides where they go
//! by installing a subscriber through this crate:
//!
//! ```no_run
//! use tumbler_log::{Config, LoggerBuilder};
//!
//! # fn main() -> Result<(), tumbler_log::LogError> {
//! let _guard = LoggerBuilder::from_config(Config::from_env()).build()?;
//! tracing::info!("rotation service starting");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, Format};
pub use error::{LogError, LogResult};

/// Re-export of the `tracing` macros so callers do not need a direct dependency.
pub use tracing::{debug, error, info, trace, warn};

/// Initialize logging from the environment (`TUMBLER_LOG`, `RUST_LOG`, `TUMBLER_LOG_FORMAT`).
///
/// # Errors
///
/// Returns [`LogError`] when the filter is invalid or a subscriber is already installed.
pub fn init() -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(Config::from_env()).build()
}

/// Initialize logging with an explicit configuration.
///
/// # Errors
///
/// Returns [`LogError`] when the filter is invalid or a subscriber is already installed.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Install a test-friendly subscriber. Safe to call from every test: a second
/// installation is silently ignored.
pub fn init_test() {
    let _ = LoggerBuilder::from_config(Config::test()).build();
}
