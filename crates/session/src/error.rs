//! Session errors

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tumbler_core::BoxError;

/// Classification exposed through `LastError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// The broker rejected our access token
    InvalidCredentials,
    /// The broker refused the session (for example a no-retry disconnect)
    PermissionDenied,
    /// Network, framing or timeout failure
    TransportError,
}

/// Errors raised by the session client and its transports
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake acknowledged with `authenticated = false`
    #[error("broker rejected credentials: {reason}")]
    InvalidCredentials {
        /// Reason reported by the broker
        reason: String,
    },

    /// Broker refused service
    #[error("broker denied access: {reason}")]
    PermissionDenied {
        /// Reason reported by the broker
        reason: String,
    },

    /// I/O or connection failure
    #[error("transport error: {message}")]
    Transport {
        /// Human readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// A frame could not be encoded or decoded
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    /// No acknowledgement within the handshake timeout
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

impl SessionError {
    /// Transport error with an optional cause
    pub fn transport(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Transport {
            message: message.into(),
            source,
        }
    }

    /// Transport error wrapping an I/O failure
    pub fn io(context: &str, error: std::io::Error) -> Self {
        Self::transport(format!("{context}: {error}"), Some(Box::new(error)))
    }

    /// Classification for `LastError`
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::InvalidCredentials { .. } => SessionErrorKind::InvalidCredentials,
            Self::PermissionDenied { .. } => SessionErrorKind::PermissionDenied,
            Self::Transport { .. } | Self::Codec(_) | Self::HandshakeTimeout(_) => {
                SessionErrorKind::TransportError
            }
        }
    }
}

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
