//! Channel seams and the production TCP implementation.
//!
//! The RPC client and the subscriber never touch sockets directly; they
//! speak to boxed [`RequestTransport`] / [`StreamTransport`] objects minted
//! by a [`Connector`]. Production uses one TCP stream per channel with
//! 4-byte length-prefix framing; tests inject in-memory transports.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Frame size cap for the length-delimited codec. Generous: the protocol
/// does no chunking of its own, so the transport sets the only bound.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Strict send-then-receive message transport for the command channel.
/// One outstanding exchange at a time; interleaving is the caller's bug.
#[async_trait]
pub trait RequestTransport: Send {
    /// Send one framed message.
    async fn send(&mut self, payload: Bytes) -> io::Result<()>;
    /// Receive one framed message.
    async fn recv(&mut self) -> io::Result<Bytes>;
}

/// Receive-only message transport for the streaming channel.
#[async_trait]
pub trait StreamTransport: Send {
    /// Receive one framed message.
    async fn recv(&mut self) -> io::Result<Bytes>;
}

/// Factory for the two channels of a session. Injected into the connection
/// orchestrator so tests can script both sides of the wire.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the request/response channel.
    async fn connect_request(&self) -> io::Result<Box<dyn RequestTransport>>;
    /// Open the streaming channel.
    async fn connect_stream(&self) -> io::Result<Box<dyn StreamTransport>>;
}

/// Length-delimited framing over one TCP stream.
pub struct FramedTcp {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl FramedTcp {
    fn new(stream: TcpStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }
}

#[async_trait]
impl RequestTransport for FramedTcp {
    async fn send(&mut self, payload: Bytes) -> io::Result<()> {
        self.framed.send(payload).await
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        match self.framed.next().await {
            Some(frame) => Ok(frame?.freeze()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
        }
    }
}

#[async_trait]
impl StreamTransport for FramedTcp {
    async fn recv(&mut self) -> io::Result<Bytes> {
        RequestTransport::recv(self).await
    }
}

/// Production connector: TCP to `server:sync_port` for requests and
/// `server:async_port` for the stream.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    server: String,
    sync_port: u16,
    async_port: u16,
}

impl TcpConnector {
    /// Connector for the given endpoints.
    pub fn new(server: impl Into<String>, sync_port: u16, async_port: u16) -> Self {
        Self {
            server: server.into(),
            sync_port,
            async_port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect_request(&self) -> io::Result<Box<dyn RequestTransport>> {
        let stream = TcpStream::connect((self.server.as_str(), self.sync_port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(FramedTcp::new(stream)))
    }

    async fn connect_stream(&self) -> io::Result<Box<dyn StreamTransport>> {
        let stream = TcpStream::connect((self.server.as_str(), self.async_port)).await?;
        Ok(Box::new(FramedTcp::new(stream)))
    }
}
