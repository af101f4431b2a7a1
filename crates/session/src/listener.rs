//! Capability listeners

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::client::Shared;

/// Inbound invocation routed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Capability the broker addressed
    pub capability: String,
    /// Caller metadata
    pub meta: BTreeMap<String, String>,
    /// Severity label
    pub severity: String,
    /// Opaque payload
    pub message: String,
    /// Local receive time
    pub received_at: DateTime<Utc>,
}

/// Receives invocations for one capability
///
/// Survives reconnects and `stop`/`start` of the owning client. The
/// capability is withdrawn from the broker only by [`Listener::close`].
#[derive(Debug)]
pub struct Listener {
    capability: String,
    id: u64,
    rx: mpsc::Receiver<Invocation>,
    shared: Arc<Shared>,
}

impl Listener {
    pub(crate) fn new(
        capability: String,
        id: u64,
        rx: mpsc::Receiver<Invocation>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            capability,
            id,
            rx,
            shared,
        }
    }

    /// Capability this listener serves
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Next invocation; `None` after the listener was replaced by a newer
    /// `listen` call for the same capability
    pub async fn accept(&mut self) -> Option<Invocation> {
        self.rx.recv().await
    }

    /// Withdraw the capability and trigger a re-handshake
    pub fn close(self) {
        self.shared.unlisten(&self.capability, self.id);
    }
}
