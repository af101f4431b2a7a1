//! Rotation jobs
//!
//! A [`RotationJob`] is one registered credential, identified by its
//! `(mount, path)` [`JobKey`] and addressed internally by a [`JobId`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tumbler_core::Namespace;
use tumbler_core::context::normalize_mount;
use uuid::Uuid;

use crate::error::{RotationError, StorageError};
use crate::params::{ParsedFields, RotationParams};
use crate::time_format;

/// Storage prefix of every job record
pub const STORAGE_PREFIX: &str = "rotation/";

/// Opaque job identifier
///
/// UUIDv7 stamped with the registration time, so ids sort by creation and
/// survive restarts through the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// New id for a job created at `at`
    pub fn new(at: DateTime<Utc>) -> Self {
        let secs = u64::try_from(at.timestamp()).unwrap_or(0);
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, secs, at.timestamp_subsec_nanos());
        Self(Uuid::new_v7(ts))
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A backend mount inside a namespace
///
/// Compared field by field, so a root mount named `team-a/db` and mount `db`
/// of namespace `team-a` stay distinct even though both display as
/// `team-a/db`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountKey {
    /// Namespace the mount lives in
    pub namespace: Namespace,
    /// Backend-relative mount point, without surrounding slashes
    pub mount: String,
}

impl MountKey {
    /// Key for `mount` in `namespace`
    pub fn new(namespace: &Namespace, mount: &str) -> Self {
        Self {
            namespace: namespace.clone(),
            mount: normalize_mount(mount).to_string(),
        }
    }
}

impl fmt::Display for MountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace.qualify(&self.mount))
    }
}

/// Identity of a job: namespaced mount plus request path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Mount the job belongs to
    pub mount: MountKey,
    /// Backend-relative request path
    pub path: String,
}

impl JobKey {
    /// Key for `path` under `mount` in `namespace`
    pub fn new(namespace: &Namespace, mount: &str, path: &str) -> Self {
        Self {
            mount: MountKey::new(namespace, mount),
            path: path.trim().trim_start_matches('/').to_string(),
        }
    }

    /// Store key of the job's record
    ///
    /// Root jobs live at `rotation/<mount>/<path>`, namespaced ones at
    /// `rotation/@<namespace>/<mount>/<path>`. The namespace and the mount
    /// are single escaped segments (`%`, `/` and `@` percent-encoded), so
    /// distinct keys never share a record.
    pub fn storage_key(&self) -> String {
        let mut key = String::from(STORAGE_PREFIX);
        if !self.mount.namespace.is_root() {
            key.push('@');
            escape_segment(&mut key, self.mount.namespace.as_str().trim_end_matches('/'));
            key.push('/');
        }
        escape_segment(&mut key, &self.mount.mount);
        key.push('/');
        key.push_str(&self.path);
        key
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mount, self.path)
    }
}

fn escape_segment(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '@' => out.push_str("%40"),
            c => out.push(c),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its next regular fire
    #[default]
    Scheduled,
    /// A worker is calling the backend
    Running,
    /// Waiting out a retry backoff
    CoolingDown,
    /// Deregistered; about to be dropped
    Disabled,
}

impl JobState {
    /// Whether a job may move from `self` to `next`
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Scheduled | CoolingDown, Running)
                | (Running | CoolingDown, Scheduled)
                | (Running, CoolingDown)
                | (Scheduled | Running | CoolingDown, Disabled)
        )
    }

    /// Snake-case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::CoolingDown => "cooling_down",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationJob {
    /// Job id
    pub id: JobId,
    /// Namespace the backend is mounted in
    pub namespace: Namespace,
    /// Backend-relative mount point
    pub mount_point: String,
    /// Request path of the credential
    pub req_path: String,
    /// Validated rotation settings
    pub params: RotationParams,
    /// Last successful rotation; `None` until the first one
    pub last_vault_rotation: Option<DateTime<Utc>>,
    /// Next planned rotation
    pub next_vault_rotation: DateTime<Utc>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Lifecycle state
    pub state: JobState,
}

impl RotationJob {
    /// Identity key
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.mount_point, &self.req_path)
    }

    /// Move to `next`, refusing illegal changes
    pub fn transition(&mut self, next: JobState) -> Result<(), RotationError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(RotationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Read-only projection at `now`
    pub fn info(&self, now: DateTime<Utc>) -> RotationInfo {
        let ttl = (self.next_vault_rotation - now).num_seconds().max(0);
        RotationInfo {
            rotation_id: self.id,
            next_vault_rotation: self.next_vault_rotation,
            last_vault_rotation: self.last_vault_rotation,
            ttl: ttl as u64,
        }
    }
}

/// What a backend may see of its job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationInfo {
    /// Job id, present from registration on
    pub rotation_id: JobId,
    /// Next planned rotation
    #[serde(with = "time_format::seconds")]
    pub next_vault_rotation: DateTime<Utc>,
    /// Last successful rotation
    #[serde(with = "time_format::zero_or_seconds")]
    pub last_vault_rotation: Option<DateTime<Utc>>,
    /// Whole seconds until the next rotation, never negative
    pub ttl: u64,
}

impl RotationInfo {
    /// `ttl` as a [`Duration`]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// Persisted form of a job, stored at [`JobKey::storage_key`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id
    pub id: JobId,
    /// Cron expression, empty when unused
    #[serde(default)]
    pub rotation_schedule: String,
    /// Window in seconds
    #[serde(default)]
    pub rotation_window: u64,
    /// Period in seconds
    #[serde(default)]
    pub rotation_period: u64,
    /// Failure policy name
    #[serde(default)]
    pub rotation_policy: String,
    /// Next planned rotation
    #[serde(with = "time_format::seconds")]
    pub next_vault_rotation: DateTime<Utc>,
    /// Last success, zero instant when never
    #[serde(with = "time_format::zero_or_seconds", default)]
    pub last_vault_rotation: Option<DateTime<Utc>>,
    /// Failures since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Backend-relative mount point
    pub mount_point: String,
    /// Request path
    pub req_path: String,
    /// Namespace of the mount
    #[serde(default)]
    pub namespace: Namespace,
    /// Lifecycle state at the time of the write
    #[serde(default)]
    pub state: JobState,
}

impl From<&RotationJob> for JobRecord {
    fn from(job: &RotationJob) -> Self {
        Self {
            id: job.id,
            rotation_schedule: job
                .params
                .schedule()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            rotation_window: job.params.window().as_secs(),
            rotation_period: job.params.period().as_secs(),
            rotation_policy: job.params.policy().as_str().to_string(),
            next_vault_rotation: job.next_vault_rotation,
            last_vault_rotation: job.last_vault_rotation,
            consecutive_failures: job.consecutive_failures,
            mount_point: job.mount_point.clone(),
            req_path: job.req_path.clone(),
            namespace: job.namespace.clone(),
            state: job.state,
        }
    }
}

impl JobRecord {
    /// Rebuild the job, re-validating its parameters
    ///
    /// A job persisted mid-rotation comes back as scheduled.
    pub fn into_job(self, key: &str) -> Result<RotationJob, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let params = ParsedFields {
            rotation_schedule: Some(self.rotation_schedule),
            rotation_window: Some(Duration::from_secs(self.rotation_window)),
            rotation_period: Some(Duration::from_secs(self.rotation_period)),
            rotation_policy: Some(self.rotation_policy),
            disable_automated_rotation: None,
        }
        .validate()
        .map_err(|e| corrupt(e.to_string()))?;
        if !params.has_nonzero() {
            return Err(corrupt("record has neither schedule nor period".to_string()));
        }
        let state = match self.state {
            JobState::Running | JobState::Disabled => JobState::Scheduled,
            other => other,
        };
        Ok(RotationJob {
            id: self.id,
            namespace: self.namespace,
            mount_point: self.mount_point,
            req_path: self.req_path,
            params,
            last_vault_rotation: self.last_vault_rotation,
            next_vault_rotation: self.next_vault_rotation,
            consecutive_failures: self.consecutive_failures,
            state,
        })
    }
}
