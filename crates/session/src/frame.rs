//! Broker wire frames
//!
//! Every frame is a JSON object `{"type": <kind>, "payload": {...}}`. On a
//! byte stream each frame is prefixed with its length as a 4-byte big-endian
//! integer (see [`crate::transport::FramedTransport`]).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionResult;

/// Frame exchanged with the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Client opens or renews a session
    Handshake(Handshake),
    /// Broker answers a handshake
    HandshakeAck(HandshakeAck),
    /// Broker routes an inbound invocation to a capability
    Connect(Connect),
    /// Broker asks the client to drop the connection
    Disconnect(Disconnect),
}

impl Frame {
    /// Encode to the JSON body of a frame
    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON frame body
    pub fn decode(bytes: &[u8]) -> SessionResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::HandshakeAck(_) => "handshake_ack",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
        }
    }
}

/// Session request sent on every (re)handshake
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Service name of this node
    pub service: String,
    /// Resource the session is bound to
    pub resource: String,
    /// Bearer token presented to the broker
    pub access_token: String,
    /// Capabilities this node listens on
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form node metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("service", &self.service)
            .field("resource", &self.resource)
            .field("access_token", &"[REDACTED]")
            .field("capabilities", &self.capabilities)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Broker answer to a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// Broker-assigned session id
    pub session_id: String,
    /// Session expiry, unix seconds
    pub expiry_unix: i64,
    /// Whether the access token was accepted
    pub authenticated: bool,
    /// Rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Inbound invocation for a capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Target capability
    pub capability: String,
    /// Caller metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Broker-assigned severity label
    #[serde(default)]
    pub severity: String,
    /// Opaque payload
    #[serde(default)]
    pub message: String,
}

/// Broker-directed disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Never reconnect until restarted explicitly
    #[serde(default)]
    pub no_retry: bool,
    /// Backoff override for the next attempt, 0 = default
    #[serde(default)]
    pub backoff_seconds: u64,
    /// Reason reported by the broker
    #[serde(default)]
    pub reason: String,
}
