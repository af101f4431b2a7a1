//! In-process transport for embedded brokers and tests

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Transport};
use crate::error::{SessionError, SessionResult};
use crate::frame::Frame;

const FRAME_BUFFER: usize = 64;

/// One end of an in-memory frame pipe
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(FRAME_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(FRAME_BUFFER);
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> SessionResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::transport("transport closed", None))?;
        tx.send(frame)
            .await
            .map_err(|_| SessionError::transport("peer hung up", None))
    }

    async fn recv(&mut self) -> SessionResult<Option<Frame>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.tx = None;
        Ok(())
    }
}

/// Client-side connector paired with a [`BrokerEndpoint`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming: mpsc::Sender<MemoryTransport>,
}

/// Broker side: yields the server end of every client connection
#[derive(Debug)]
pub struct BrokerEndpoint {
    incoming: mpsc::Receiver<MemoryTransport>,
}

impl BrokerEndpoint {
    /// Next connection opened by a client, `None` once every connector is dropped
    pub async fn accept(&mut self) -> Option<MemoryTransport> {
        self.incoming.recv().await
    }
}

/// Connector/endpoint pair. Dropping the endpoint makes every later connect fail.
pub fn memory_broker() -> (MemoryConnector, BrokerEndpoint) {
    let (tx, rx) = mpsc::channel(8);
    (
        MemoryConnector { incoming: tx },
        BrokerEndpoint { incoming: rx },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SessionResult<Box<dyn Transport>> {
        let (client, server) = MemoryTransport::pair();
        self.incoming
            .send(server)
            .await
            .map_err(|_| SessionError::transport("broker endpoint is gone", None))?;
        Ok(Box::new(client))
    }
}
