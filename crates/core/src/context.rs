//! Request context
//!
//! Carries the caller's namespace and tracing metadata through rotation
//! calls so they can be scoped and audited.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Namespace validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    /// Path segment is empty or a relative component
    #[error("invalid namespace segment in `{path}`")]
    InvalidSegment {
        /// Offending path
        path: String,
    },
}

/// Hierarchical namespace path
///
/// The root namespace is the empty path. Non-root paths are stored
/// normalized with a single trailing slash (`team-a/`, `team-a/dev/`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Root namespace
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse and normalize a namespace path
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::InvalidSegment`] for `.`/`..` or empty inner segments.
    pub fn new(path: impl AsRef<str>) -> Result<Self, NamespaceError> {
        let raw = path.as_ref().trim().trim_matches('/');
        if raw.is_empty() {
            return Ok(Self::root());
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(NamespaceError::InvalidSegment {
                path: path.as_ref().to_string(),
            });
        }
        Ok(Self(format!("{raw}/")))
    }

    /// Whether this is the root namespace
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Normalized path (`""` for root)
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix a mount point with this namespace: `team-a/` + `db` = `team-a/db`
    ///
    /// For display only: a root mount `team-a/db` qualifies to the same text.
    pub fn qualify(&self, mount: &str) -> String {
        format!("{}{}", self.0, normalize_mount(mount))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = NamespaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.0
    }
}

/// Trim surrounding slashes and whitespace from a mount point
pub fn normalize_mount(mount: &str) -> &str {
    mount.trim().trim_matches('/')
}

/// Request context for rotation operations
///
/// # Examples
///
/// ```
/// use tumbler_core::{Namespace, RequestContext};
///
/// let ctx = RequestContext::new(Namespace::new("team-a").unwrap()).with_mount("db");
/// assert_eq!(ctx.namespace.as_str(), "team-a/");
/// assert_eq!(ctx.mount.as_deref(), Some("db"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller namespace
    pub namespace: Namespace,

    /// Backend-relative mount the request was routed to, when known
    pub mount: Option<String>,

    /// Trace ID for distributed tracing
    pub trace_id: Uuid,
}

impl RequestContext {
    /// Context in `namespace` with a fresh trace id
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            mount: None,
            trace_id: Uuid::new_v4(),
        }
    }

    /// Context in the root namespace
    pub fn root() -> Self {
        Self::new(Namespace::root())
    }

    /// Set the routed mount (builder pattern)
    pub fn with_mount(mut self, mount: impl AsRef<str>) -> Self {
        self.mount = Some(normalize_mount(mount.as_ref()).to_string());
        self
    }

    /// Set trace ID (builder pattern)
    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }
}
