//! Backend-facing RPC surface
//!
//! JSON request and response bodies carried by the host's plugin framework.
//! Errors travel as an [`ErrorEnvelope`] with an explicit `kind`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use tumbler_core::RequestContext;

use crate::error::{
    ErrorKind, MOUNT_POINT_REQUIRED, REQ_PATH_REQUIRED, RotationError, RotationResult,
    TIMING_REQUIRED,
};
use crate::job::{JobId, RotationInfo};
use crate::manager::{RegisterRequest, RotationManager};
use crate::params::ParsedFields;

/// Create or update a rotation job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationJobConfigureRequest {
    /// Backend-relative mount
    pub mount_point: String,
    /// Credential path
    pub req_path: String,
    /// Cron expression
    pub rotation_schedule: String,
    /// Window in seconds
    pub rotation_window: u64,
    /// Period in seconds
    pub rotation_period: u64,
    /// `default`, `retry` or `fail`
    pub rotation_policy: String,
}

/// Response to [`RotationJobConfigureRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// Job id
    pub rotation_id: JobId,
}

/// Remove a rotation job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationJobDeregisterRequest {
    /// Backend-relative mount
    pub mount_point: String,
    /// Credential path
    pub req_path: String,
}

/// Read a job's rotation info; the mount comes from the request context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationInfoRequest {
    /// Credential path
    pub req_path: String,
}

/// Error body: machine readable kind plus human message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Classification
    pub kind: ErrorKind,
    /// Display form of the error
    pub message: String,
}

impl From<&RotationError> for ErrorEnvelope {
    fn from(error: &RotationError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<RotationError> for ErrorEnvelope {
    fn from(error: RotationError) -> Self {
        Self::from(&error)
    }
}

/// RPC handlers over a [`RotationManager`]
#[derive(Debug, Clone)]
pub struct RotationRpc {
    manager: RotationManager,
}

impl RotationRpc {
    /// Handlers for `manager`
    pub fn new(manager: RotationManager) -> Self {
        Self { manager }
    }

    /// Register or update the job described by `request` in the caller's namespace
    pub async fn configure(
        &self,
        ctx: &RequestContext,
        request: RotationJobConfigureRequest,
    ) -> RotationResult<ConfigureResponse> {
        require(&request.mount_point, &request.req_path)?;
        if request.rotation_schedule.trim().is_empty() && request.rotation_period == 0 {
            return Err(RotationError::invalid_request(TIMING_REQUIRED));
        }
        let params = ParsedFields {
            rotation_schedule: Some(request.rotation_schedule),
            rotation_window: Some(Duration::from_secs(request.rotation_window)),
            rotation_period: Some(Duration::from_secs(request.rotation_period)),
            rotation_policy: Some(request.rotation_policy),
            disable_automated_rotation: None,
        }
        .validate()?;
        let (rotation_id, _) = self
            .manager
            .register(RegisterRequest::new(
                ctx.namespace.clone(),
                request.mount_point,
                request.req_path,
                params,
            ))
            .await?;
        Ok(ConfigureResponse { rotation_id })
    }

    /// Remove the job; unknown jobs succeed
    pub async fn deregister(
        &self,
        ctx: &RequestContext,
        request: RotationJobDeregisterRequest,
    ) -> RotationResult<()> {
        require(&request.mount_point, &request.req_path)?;
        self.manager
            .deregister(&ctx.namespace, &request.mount_point, &request.req_path)
            .await
    }

    /// Info for `req_path` under the context's mount
    pub async fn info(
        &self,
        ctx: &RequestContext,
        request: RotationInfoRequest,
    ) -> RotationResult<Option<RotationInfo>> {
        let mount = ctx.mount.as_deref().unwrap_or_default();
        require(mount, &request.req_path)?;
        Ok(self
            .manager
            .get_info(&ctx.namespace, mount, &request.req_path)
            .await)
    }

    /// Dispatch a JSON request by operation name
    ///
    /// Operations: `configure`, `deregister`, `info`. `info` answers `null`
    /// for an unknown path; `deregister` answers `{}`.
    pub async fn handle_json(
        &self,
        ctx: &RequestContext,
        operation: &str,
        body: Value,
    ) -> Result<Value, ErrorEnvelope> {
        debug!(operation, namespace = %ctx.namespace, "rotation rpc");
        let result = match operation {
            "configure" => {
                let request = decode(body)?;
                self.configure(ctx, request).await.and_then(encode)
            }
            "deregister" => {
                let request = decode(body)?;
                self.deregister(ctx, request)
                    .await
                    .map(|()| Value::Object(serde_json::Map::new()))
            }
            "info" => {
                let request = decode(body)?;
                self.info(ctx, request).await.and_then(encode)
            }
            other => Err(RotationError::invalid_request(format!(
                "unknown rotation operation `{other}`"
            ))),
        };
        result.map_err(ErrorEnvelope::from)
    }
}

fn require(mount_point: &str, req_path: &str) -> RotationResult<()> {
    if mount_point.trim().trim_matches('/').is_empty() {
        return Err(RotationError::invalid_request(MOUNT_POINT_REQUIRED));
    }
    if req_path.trim().trim_start_matches('/').is_empty() {
        return Err(RotationError::invalid_request(REQ_PATH_REQUIRED));
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ErrorEnvelope> {
    serde_json::from_value(body).map_err(|e| ErrorEnvelope {
        kind: ErrorKind::InvalidRequest,
        message: format!("malformed request body: {e}"),
    })
}

fn encode<T: Serialize>(value: T) -> RotationResult<Value> {
    serde_json::to_value(value).map_err(|e| RotationError::invalid_request(e.to_string()))
}
