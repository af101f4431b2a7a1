//! Backend rotate callback

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tumbler_core::{BoxError, Namespace};
use uuid::Uuid;

use crate::job::JobId;

/// Implemented by every backend that supports automated rotation
///
/// The manager calls [`rotate_credential`](Self::rotate_credential) from a
/// worker when a job is due. Errors are fed to the job's failure policy and
/// never reach the caller that registered the job.
#[async_trait]
pub trait CredentialRotator: Send + Sync + 'static {
    /// Rotate the credential at `req_path` under `mount_point`
    ///
    /// `ctx.cancellation` fires when the rotation deadline passes or the
    /// manager shuts down.
    async fn rotate_credential(
        &self,
        ctx: &RotationContext,
        mount_point: &str,
        req_path: &str,
    ) -> Result<(), BoxError>;
}

/// Audit and cancellation context of one rotate call
#[derive(Debug, Clone)]
pub struct RotationContext {
    /// Namespace the backend is mounted in
    pub namespace: Namespace,
    /// Backend-relative mount
    pub mount_point: String,
    /// Credential path
    pub req_path: String,
    /// Job being rotated
    pub job_id: JobId,
    /// Trace id for this attempt
    pub trace_id: Uuid,
    /// Attempt number since the last success, starting at 1
    pub attempt: u32,
    /// Cancelled on timeout or shutdown
    pub cancellation: CancellationToken,
}

impl RotationContext {
    /// Whether the rotation should stop early
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
