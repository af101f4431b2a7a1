//! # tumbler-session
//!
//! Long-lived connection from a node to the control-plane broker.
//!
//! The [`SessionClient`] is an explicit state machine driven by a single task:
//!
//! ```text
//! disconnected -> connecting -> connected -> waiting -> connecting -> ...
//! ```
//!
//! It performs the handshake, refreshes the session at a fraction of its
//! expiry, reconnects with jittered backoff, obeys broker `disconnect`
//! directives and routes inbound `connect` frames to capability
//! [`Listener`]s. It never drives rotation timing.

#![forbid(unsafe_code)]

mod client;
pub mod config;
mod driver;
pub mod error;
pub mod frame;
mod listener;
mod status;
pub mod transport;

pub use client::SessionClient;
pub use config::SessionConfig;
pub use error::{SessionError, SessionErrorKind, SessionResult};
pub use frame::{Connect, Disconnect, Frame, Handshake, HandshakeAck};
pub use listener::{Invocation, Listener};
pub use status::{LastError, SessionStatus};
pub use transport::{
    BrokerEndpoint, Connector, FramedTransport, MemoryConnector, MemoryTransport, TcpConnector,
    Transport, memory_broker,
};
