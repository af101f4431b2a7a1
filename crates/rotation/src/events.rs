//! Rotation lifecycle events
//!
//! Published on a broadcast channel by the manager (see
//! [`RotationManager::subscribe`](crate::RotationManager::subscribe)) next to
//! the structured log lines, so hosts can react without scraping logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::job::JobId;

/// Something that happened to a rotation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotationEvent {
    /// A job was created or its parameters replaced
    Registered {
        /// Job id
        id: JobId,
        /// Qualified mount
        mount: String,
        /// Request path
        path: String,
        /// Planned rotation
        next: DateTime<Utc>,
        /// `true` when an existing job was updated
        updated: bool,
    },

    /// A job was removed
    Deregistered {
        /// Job id
        id: JobId,
        /// Qualified mount
        mount: String,
        /// Request path
        path: String,
    },

    /// A worker is about to call the backend
    Started {
        /// Job id
        id: JobId,
        /// Attempt number since the last success, starting at 1
        attempt: u32,
    },

    /// The backend rotated the credential
    Succeeded {
        /// Job id
        id: JobId,
        /// Recorded rotation time
        rotated_at: DateTime<Utc>,
        /// Next regular rotation
        next: DateTime<Utc>,
    },

    /// The backend call failed or timed out
    Failed {
        /// Job id
        id: JobId,
        /// Error classification
        kind: ErrorKind,
        /// Error message
        error: String,
        /// Failures since the last success
        consecutive_failures: u32,
        /// When the job runs again
        next: DateTime<Utc>,
        /// Whether the job is cooling down for a retry
        retrying: bool,
    },

    /// A fire was dropped because its window had closed
    WindowSkipped {
        /// Job id
        id: JobId,
        /// Skipped fire
        missed: DateTime<Utc>,
        /// Replacement fire
        next: DateTime<Utc>,
    },

    /// A due job was pushed back because its mount has no backend
    Deferred {
        /// Job id
        id: JobId,
        /// Qualified mount
        mount: String,
        /// Retry time
        next: DateTime<Utc>,
    },

    /// A finished rotation was ignored because its job was deregistered
    Discarded {
        /// Job id
        id: JobId,
    },

    /// Job state could not be written; memory stays authoritative
    PersistFailed {
        /// Job id
        id: JobId,
        /// Storage error message
        error: String,
    },
}

impl RotationEvent {
    /// Job the event is about
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Registered { id, .. }
            | Self::Deregistered { id, .. }
            | Self::Started { id, .. }
            | Self::Succeeded { id, .. }
            | Self::Failed { id, .. }
            | Self::WindowSkipped { id, .. }
            | Self::Deferred { id, .. }
            | Self::Discarded { id }
            | Self::PersistFailed { id, .. } => *id,
        }
    }

    /// Snake-case event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Deregistered { .. } => "deregistered",
            Self::Started { .. } => "started",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::WindowSkipped { .. } => "window_skipped",
            Self::Deferred { .. } => "deferred",
            Self::Discarded { .. } => "discarded",
            Self::PersistFailed { .. } => "persist_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_tagged_serialization() {
        let event = RotationEvent::WindowSkipped {
            id: JobId::from_uuid(Uuid::nil()),
            missed: Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap(),
            next: Utc.with_ymd_and_hms(2025, 1, 1, 14, 0, 0).unwrap(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.name());
        assert_eq!(event.job_id(), JobId::from_uuid(Uuid::nil()));
    }
}
