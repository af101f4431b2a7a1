//! Frame transports
//!
//! The driver only sees [`Transport`] and [`Connector`]; concrete transports
//! are a length-delimited TCP stream and an in-memory channel pair.

mod framed;
mod memory;

use std::fmt;

use async_trait::async_trait;

pub use framed::{FramedTransport, MAX_FRAME_LENGTH, TcpConnector};
pub use memory::{BrokerEndpoint, MemoryConnector, MemoryTransport, memory_broker};

use crate::error::SessionResult;
use crate::frame::Frame;

/// Bidirectional frame stream to the broker
///
/// `recv` must be cancel-safe: the driver polls it inside `select!`.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Send one frame
    async fn send(&mut self, frame: Frame) -> SessionResult<()>;

    /// Next frame, or `None` once the peer closed the stream
    async fn recv(&mut self) -> SessionResult<Option<Frame>>;

    /// Flush and close the write half
    async fn close(&mut self) -> SessionResult<()>;
}

/// Opens new transports to the broker
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Open a fresh transport
    async fn connect(&self) -> SessionResult<Box<dyn Transport>>;
}
