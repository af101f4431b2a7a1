//! Rotation error types
//!
//! Every error carries a machine readable [`ErrorKind`] so the RPC layer can
//! return `{ "kind": ..., "message": ... }` instead of parsing messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tumbler_core::BoxError;
use tumbler_session::{SessionError, SessionErrorKind};

use crate::job::JobState;

/// Minimum accepted `rotation_window`, in seconds
pub const MIN_ROTATION_WINDOW_SECS: u64 = 3600;

/// Caller-facing message for a missing mount point
pub const MOUNT_POINT_REQUIRED: &str = "MountPoint is required";
/// Caller-facing message for a missing request path
pub const REQ_PATH_REQUIRED: &str = "ReqPath is required";
/// Caller-facing message when neither schedule nor period is set
pub const TIMING_REQUIRED: &str = "RotationSchedule or RotationPeriod is required to set up rotation job";

/// Validation failures of rotation fields. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// Both a schedule and a period were supplied
    #[error(
        "mutually exclusive fields rotation_period and rotation_schedule were both specified; only one of them can be provided"
    )]
    MutuallyExclusiveFields,

    /// A window was supplied together with a period
    #[error("rotation_window is invalid with use of rotation_period")]
    WindowWithPeriod,

    /// A window was supplied without a schedule
    #[error("rotation_window requires rotation_schedule")]
    WindowWithoutSchedule,

    /// Window shorter than the minimum
    #[error("rotation_window must be {minimum_secs} seconds or more")]
    WindowTooSmall {
        /// Minimum in seconds
        minimum_secs: u64,
    },

    /// The schedule expression did not parse
    #[error("could not parse rotation_schedule `{expression}`: {reason}")]
    InvalidSchedule {
        /// Expression as supplied
        expression: String,
        /// Parser message
        reason: String,
    },

    /// Unknown policy name
    #[error("invalid rotation_policy `{value}`; expected one of default, retry, fail")]
    InvalidPolicy {
        /// Value as supplied
        value: String,
    },

    /// A field had the wrong type or an out-of-range value
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },
}

/// Errors raised by a [`crate::Store`]
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage backend failed
    #[error("storage backend error: {message}")]
    Backend {
        /// Description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// A value could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record is structurally valid JSON but not a usable job
    #[error("corrupt record at `{key}`: {reason}")]
    Corrupt {
        /// Storage key
        key: String,
        /// What was wrong
        reason: String,
    },
}

impl StorageError {
    /// Backend failure without a typed cause
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Top-level rotation error
#[derive(Debug, Error)]
pub enum RotationError {
    /// Field validation failed
    #[error(transparent)]
    Field(#[from] FieldError),

    /// A required request field is missing or empty
    #[error("{reason}")]
    InvalidRequest {
        /// Message returned to the caller
        reason: String,
    },

    /// No job at `(mount, path)`
    #[error("no rotation job registered at {mount}/{path}")]
    NotRegistered {
        /// Qualified mount
        mount: String,
        /// Request path
        path: String,
    },

    /// This node does not run automated rotation
    #[error("automated rotation is not supported: {reason}")]
    UnsupportedCapability {
        /// Why the capability is missing
        reason: String,
    },

    /// Registration refused because `disable_automated_rotation` is set
    #[error("automated rotation is disabled for {mount}/{path}")]
    AutomatedRotationDisabled {
        /// Qualified mount
        mount: String,
        /// Request path
        path: String,
    },

    /// The backend's rotate callback failed
    #[error("backend rotation failed: {source}")]
    TransientBackend {
        /// Error returned by the backend
        #[source]
        source: BoxError,
    },

    /// The backend's rotate callback exceeded its deadline
    #[error("rotation timed out after {timeout:?}")]
    Timeout {
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Broker session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Caller namespace differs from the backend's namespace
    #[error("namespace mismatch: backend is mounted in {expected}, caller is in {actual}")]
    NamespaceMismatch {
        /// Backend namespace
        expected: String,
        /// Caller namespace
        actual: String,
    },

    /// Illegal job state change
    #[error("invalid job state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// Invalid configuration
    #[error("invalid rotation configuration: {reason}")]
    Config {
        /// What was wrong
        reason: String,
    },

    /// The manager is shutting down
    #[error("rotation manager is shutting down")]
    Shutdown,
}

/// Result alias for rotation operations
pub type RotationResult<T> = Result<T, RotationError>;

/// Machine readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`FieldError::MutuallyExclusiveFields`]
    MutuallyExclusiveFields,
    /// See [`FieldError::WindowWithPeriod`]
    WindowWithPeriod,
    /// See [`FieldError::WindowWithoutSchedule`]
    WindowWithoutSchedule,
    /// See [`FieldError::WindowTooSmall`]
    WindowTooSmall,
    /// See [`FieldError::InvalidSchedule`]
    InvalidSchedule,
    /// See [`FieldError::InvalidPolicy`]
    InvalidPolicy,
    /// See [`FieldError::InvalidValue`]
    InvalidValue,
    /// Missing or empty request field
    InvalidRequest,
    /// Unknown `(mount, path)`
    NotRegistered,
    /// Rotation unsupported on this node
    UnsupportedCapability,
    /// Registration refused by the disable flag
    AutomatedRotationDisabled,
    /// Backend callback error
    TransientBackendError,
    /// Backend callback deadline
    Timeout,
    /// Broker rejected credentials
    InvalidCredentials,
    /// Broker refused service
    PermissionDenied,
    /// Broker transport failure
    TransportError,
    /// Persistence failure
    StorageError,
    /// Namespace mismatch
    NamespaceMismatch,
    /// Illegal state change
    InvalidTransition,
    /// Invalid configuration
    ConfigError,
    /// Shutting down
    Shutdown,
}

impl FieldError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MutuallyExclusiveFields => ErrorKind::MutuallyExclusiveFields,
            Self::WindowWithPeriod => ErrorKind::WindowWithPeriod,
            Self::WindowWithoutSchedule => ErrorKind::WindowWithoutSchedule,
            Self::WindowTooSmall { .. } => ErrorKind::WindowTooSmall,
            Self::InvalidSchedule { .. } => ErrorKind::InvalidSchedule,
            Self::InvalidPolicy { .. } => ErrorKind::InvalidPolicy,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
        }
    }
}

impl RotationError {
    /// Required-field error with the exact caller-facing message
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Field(e) => e.kind(),
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::NotRegistered { .. } => ErrorKind::NotRegistered,
            Self::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            Self::AutomatedRotationDisabled { .. } => ErrorKind::AutomatedRotationDisabled,
            Self::TransientBackend { .. } => ErrorKind::TransientBackendError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Session(e) => match e.kind() {
                SessionErrorKind::InvalidCredentials => ErrorKind::InvalidCredentials,
                SessionErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                SessionErrorKind::TransportError => ErrorKind::TransportError,
            },
            Self::Storage(_) => ErrorKind::StorageError,
            Self::NamespaceMismatch { .. } => ErrorKind::NamespaceMismatch,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Whether the caller supplied bad input (4xx-style)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Field(_)
                | Self::InvalidRequest { .. }
                | Self::AutomatedRotationDisabled { .. }
                | Self::NamespaceMismatch { .. }
        )
    }
}
