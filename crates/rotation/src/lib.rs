//! # tumbler-rotation
//!
//! Automated credential rotation between a secrets server and its backends.
//!
//! A backend hands its rotation settings to a [`BackendView`]; the
//! [`RotationManager`] persists the job, keeps it in a [`RotationQueue`]
//! ordered by next fire time and calls the backend's
//! [`CredentialRotator`] when the job is due, applying the job's
//! [`RotationPolicy`] on failure.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tumbler_core::{BoxError, Namespace, RequestContext};
//! use tumbler_rotation::prelude::*;
//!
//! struct DatabaseRotator;
//!
//! #[async_trait]
//! impl CredentialRotator for DatabaseRotator {
//!     async fn rotate_credential(
//!         &self,
//!         _ctx: &RotationContext,
//!         _mount_point: &str,
//!         _req_path: &str,
//!     ) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> RotationResult<()> {
//! let manager = RotationManager::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//! manager.start().await?;
//!
//! let view = manager.mount_backend(Namespace::root(), "db", Arc::new(DatabaseRotator));
//! let params = ParsedFields::new().schedule("0 0 * * * *").validate()?;
//! view.register(&RequestContext::root(), "config", params).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod params;
pub mod policy;
pub mod queue;
pub mod rotator;
pub mod rpc;
pub mod schedule;
pub mod store;
pub mod view;

mod time_format;

pub use config::RotationConfig;
pub use error::{ErrorKind, FieldError, RotationError, RotationResult, StorageError, StorageResult};
pub use events::RotationEvent;
pub use job::{JobId, JobKey, JobRecord, JobState, MountKey, RotationInfo, RotationJob};
pub use manager::{
    MountOptions, ROTATION_CAPABILITY, RegisterRequest, RotationManager, RotationManagerBuilder,
};
pub use params::{ParsedFields, RotationParams};
pub use policy::RotationPolicy;
pub use queue::{QueueEntry, RotationQueue};
pub use rotator::{CredentialRotator, RotationContext};
pub use rpc::{
    ConfigureResponse, ErrorEnvelope, RotationInfoRequest, RotationJobConfigureRequest,
    RotationJobDeregisterRequest, RotationRpc,
};
pub use schedule::Schedule;
pub use store::{MemoryStore, Store};
pub use view::BackendView;

/// Common imports for backends
pub mod prelude {
    pub use crate::{
        BackendView, CredentialRotator, ErrorKind, MemoryStore, ParsedFields, RotationConfig,
        RotationContext, RotationError, RotationEvent, RotationInfo, RotationManager,
        RotationParams, RotationPolicy, RotationResult, Schedule, Store,
    };
}
