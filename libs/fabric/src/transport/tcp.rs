use std::net::SocketAddr;
use std::time::Duration;

use meridian_core::BasicStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::{Acceptor, Connector, Transceiver, TransceiverReader, TransceiverWriter};

/// TCP transceiver
///
/// Framing is done by the connection; this type only moves bytes.
pub struct TcpTransceiver {
    stream: TcpStream,
    description: String,
}

impl TcpTransceiver {
    /// Create from an existing TcpStream
    pub fn from_stream(stream: TcpStream) -> Self {
        let description = describe(stream.local_addr().ok(), stream.peer_addr().ok());
        Self {
            stream,
            description,
        }
    }

    /// Get the remote address of this connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr().map_err(Into::into)
    }
}

fn describe(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> String {
    let fmt = |addr: Option<SocketAddr>| addr.map_or_else(|| "<not available>".into(), |a| a.to_string());
    format!("local address = {}\nremote address = {}", fmt(local), fmt(remote))
}

impl Transceiver for TcpTransceiver {
    fn datagram(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn TransceiverReader>, Box<dyn TransceiverWriter>) {
        let (read, write) = self.stream.into_split();
        (Box::new(TcpReader { read }), Box::new(TcpWriter { write }))
    }
}

struct TcpReader {
    read: OwnedReadHalf,
}

#[async_trait::async_trait]
impl TransceiverReader for TcpReader {
    async fn read(&mut self, buf: &mut BasicStream) -> Result<()> {
        let end = buf.len();
        self.read.read_exact(buf.unread_mut()).await?;
        buf.set_pos(end);
        Ok(())
    }
}

struct TcpWriter {
    write: OwnedWriteHalf,
}

#[async_trait::async_trait]
impl TransceiverWriter for TcpWriter {
    async fn write(&mut self, buf: &BasicStream) -> Result<()> {
        self.write.write_all(buf.as_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

/// Connects to a TCP endpoint
pub struct TcpConnector {
    endpoint: Endpoint,
}

impl TcpConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, timeout: Duration) -> Result<Box<dyn Transceiver>> {
        let address = self.endpoint.address();
        debug!(target: "meridian::network", "trying to establish tcp connection to {address}");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::ConnectFailed {
                endpoint: address.clone(),
                reason: "connect timeout exceeded".into(),
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(address.clone()),
                _ => Error::ConnectFailed {
                    endpoint: address.clone(),
                    reason: e.to_string(),
                },
            })?;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpTransceiver::from_stream(stream)))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// TCP listener for accepting incoming connections
pub struct TcpAcceptor {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl TcpAcceptor {
    /// Bind to the endpoint's address; port 0 picks an ephemeral port
    pub async fn bind(endpoint: Endpoint) -> Result<Self> {
        let listener = TcpListener::bind(endpoint.address()).await?;
        let port = listener.local_addr()?.port();
        debug!(target: "meridian::network", "accepting tcp connections at {}:{port}", endpoint.host);
        Ok(Self {
            listener,
            endpoint: endpoint.with_port(port),
        })
    }
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn Transceiver>> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransceiver::from_stream(stream)))
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
