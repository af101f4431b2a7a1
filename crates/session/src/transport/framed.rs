//! Length-delimited JSON frames over any byte stream

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::{Connector, Transport};
use crate::error::{SessionError, SessionResult};
use crate::frame::Frame;

/// Largest accepted frame body
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Frames over an `AsyncRead + AsyncWrite` stream with a 4-byte big-endian length prefix
pub struct FramedTransport<T> {
    inner: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream
    pub fn new(io: T) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            inner: Framed::new(io, codec),
        }
    }
}

impl<T> fmt::Debug for FramedTransport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> Transport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> SessionResult<()> {
        let body = Bytes::from(frame.encode()?);
        self.inner
            .send(body)
            .await
            .map_err(|e| SessionError::io("write frame", e))
    }

    async fn recv(&mut self) -> SessionResult<Option<Frame>> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(SessionError::io("read frame", e)),
            Some(Ok(body)) => Frame::decode(&body).map(Some),
        }
    }

    async fn close(&mut self) -> SessionResult<()> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| SessionError::io("close stream", e))
    }
}

/// Connects to the broker over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connector for `host:port`
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> SessionResult<Box<dyn Transport>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SessionError::io(&format!("connect {}", self.addr), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SessionError::io("set_nodelay", e))?;
        debug!(addr = %self.addr, "broker transport connected");
        Ok(Box::new(FramedTransport::new(stream)))
    }
}
