//! Observable session state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionErrorKind;

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Not running, or stopped for good
    #[default]
    Disconnected,
    /// Opening a transport and handshaking
    Connecting,
    /// Handshake acknowledged
    Connected,
    /// Backing off before the next attempt
    Waiting,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Waiting => "waiting",
        })
    }
}

/// Most recent session failure, cleared by the next successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// When the failure was observed
    pub at: DateTime<Utc>,
    /// Classification
    pub kind: SessionErrorKind,
    /// Rendered error
    pub message: String,
}
