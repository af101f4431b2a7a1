//! Per-mount rotation surface handed to backends

use tumbler_core::{Namespace, RequestContext};

use crate::error::{RotationError, RotationResult};
use crate::job::{JobId, RotationInfo};
use crate::manager::{RegisterRequest, RotationManager};
use crate::params::RotationParams;

/// A backend's handle on the rotation manager
///
/// Bound to one namespaced mount. Every call checks that the caller's
/// namespace is the mount's namespace, so a backend can never see or touch
/// jobs of another namespace.
#[derive(Debug, Clone)]
pub struct BackendView {
    manager: RotationManager,
    namespace: Namespace,
    mount_point: String,
}

impl BackendView {
    pub(crate) fn new(manager: RotationManager, namespace: Namespace, mount_point: &str) -> Self {
        Self {
            manager,
            namespace,
            mount_point: mount_point.to_string(),
        }
    }

    /// Namespace of the mount
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Backend-relative mount point
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Register or update the job for `path`
    pub async fn register(
        &self,
        ctx: &RequestContext,
        path: &str,
        params: RotationParams,
    ) -> RotationResult<(JobId, RotationInfo)> {
        self.check(ctx)?;
        self.manager
            .register(RegisterRequest::new(
                self.namespace.clone(),
                self.mount_point.clone(),
                path,
                params,
            ))
            .await
    }

    /// Remove the job for `path`; unknown paths succeed
    pub async fn deregister(&self, ctx: &RequestContext, path: &str) -> RotationResult<()> {
        self.check(ctx)?;
        self.manager
            .deregister(&self.namespace, &self.mount_point, path)
            .await
    }

    /// Rotation info for `path`, `None` if it has no job
    pub async fn get_info(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> RotationResult<Option<RotationInfo>> {
        self.check(ctx)?;
        Ok(self
            .manager
            .get_info(&self.namespace, &self.mount_point, path)
            .await)
    }

    /// Write-path helper: register when the params ask for rotation,
    /// deregister otherwise
    ///
    /// Returns the job's info after registering, `None` after deregistering.
    pub async fn apply(
        &self,
        ctx: &RequestContext,
        path: &str,
        params: &RotationParams,
    ) -> RotationResult<Option<RotationInfo>> {
        if params.should_register() {
            let (_, info) = self.register(ctx, path, params.clone()).await?;
            return Ok(Some(info));
        }
        self.deregister(ctx, path).await?;
        Ok(None)
    }

    /// Make the job for `path` due immediately
    pub async fn rotate_now(&self, ctx: &RequestContext, path: &str) -> RotationResult<RotationInfo> {
        self.check(ctx)?;
        self.manager
            .rotate_now(&self.namespace, &self.mount_point, path)
            .await
    }

    fn check(&self, ctx: &RequestContext) -> RotationResult<()> {
        if ctx.namespace != self.namespace {
            return Err(RotationError::NamespaceMismatch {
                expected: self.namespace.to_string(),
                actual: ctx.namespace.to_string(),
            });
        }
        Ok(())
    }
}
