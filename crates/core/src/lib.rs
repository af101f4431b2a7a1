//! # tumbler-core
//!
//! Types shared by every tumbler crate:
//!
//! - [`Clock`]: the only way the rest of the workspace observes or waits on time.
//! - [`Namespace`] and [`RequestContext`]: caller identity passed through
//!   rotation calls for scoping and audit.

#![forbid(unsafe_code)]

pub mod clock;
pub mod context;

pub use clock::{Clock, SystemClock, add_duration, truncate_to_second};
#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use context::{Namespace, NamespaceError, RequestContext};

/// Boxed error returned across plugin boundaries
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
