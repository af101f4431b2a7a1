//! Logging errors

use thiserror::Error;

/// Errors raised while installing the global subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// The filter directive could not be parsed
    #[error("invalid log filter `{directive}`: {reason}")]
    Filter {
        /// Directive as supplied by the caller
        directive: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber has already been installed in this process
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Result alias for logging setup
pub type LogResult<T> = Result<T, LogError>;
