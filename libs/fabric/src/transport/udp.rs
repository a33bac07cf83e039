use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::BasicStream;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::{
    Connector, Transceiver, TransceiverReader, TransceiverWriter, MAX_DATAGRAM_SIZE,
};

/// UDP transceiver
///
/// Client sockets are connected to their server. Server sockets are bound
/// and send to whichever peer they last received from.
pub struct UdpTransceiver {
    socket: Arc<UdpSocket>,
    connected: bool,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
}

impl UdpTransceiver {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let address = endpoint.address();
        let remote = tokio::net::lookup_host(&address)
            .await?
            .next()
            .ok_or_else(|| Error::ConnectFailed {
                endpoint: address.clone(),
                reason: "host did not resolve".into(),
            })?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(target: "meridian::network", "starting to send udp packets to {remote}");
        Ok(Self {
            socket: Arc::new(socket),
            connected: true,
            last_peer: Arc::new(Mutex::new(Some(remote))),
        })
    }

    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let socket = UdpSocket::bind(endpoint.address()).await?;
        debug!(target: "meridian::network", "starting to receive udp packets at {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            connected: false,
            last_peer: Arc::new(Mutex::new(None)),
        })
    }

    /// `endpoint` with the port actually bound
    pub fn local_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let port = self.socket.local_addr()?.port();
        Ok(endpoint.clone().with_port(port))
    }
}

impl Transceiver for UdpTransceiver {
    fn datagram(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        let local = self
            .socket
            .local_addr()
            .map_or_else(|_| "<not available>".into(), |a| a.to_string());
        let remote = self
            .last_peer
            .lock()
            .map_or_else(|| "<not connected>".into(), |a| a.to_string());
        format!("local address = {local}\nremote address = {remote}")
    }

    fn split(self: Box<Self>) -> (Box<dyn TransceiverReader>, Box<dyn TransceiverWriter>) {
        let reader = UdpReader {
            socket: self.socket.clone(),
            last_peer: self.last_peer.clone(),
            scratch: vec![0u8; MAX_DATAGRAM_SIZE],
        };
        let writer = UdpWriter {
            socket: self.socket,
            connected: self.connected,
            last_peer: self.last_peer,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct UdpReader {
    socket: Arc<UdpSocket>,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    scratch: Vec<u8>,
}

#[async_trait::async_trait]
impl TransceiverReader for UdpReader {
    async fn read(&mut self, buf: &mut BasicStream) -> Result<()> {
        let (len, peer) = self.socket.recv_from(&mut self.scratch).await?;
        *self.last_peer.lock() = Some(peer);
        buf.reset();
        buf.write_blob(&self.scratch[..len]);
        buf.set_pos(len);
        Ok(())
    }
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    connected: bool,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
}

#[async_trait::async_trait]
impl TransceiverWriter for UdpWriter {
    async fn write(&mut self, buf: &BasicStream) -> Result<()> {
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::DatagramLimit { size: buf.len() });
        }
        if self.connected {
            self.socket.send(buf.as_bytes()).await?;
        } else {
            let peer = *self.last_peer.lock();
            let peer = peer.ok_or_else(|| Error::Protocol("no peer to send datagram to".into()))?;
            self.socket.send_to(buf.as_bytes(), peer).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// "Connects" a UDP socket to a datagram endpoint
pub struct UdpConnector {
    endpoint: Endpoint,
}

impl UdpConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl Connector for UdpConnector {
    async fn connect(&self, timeout: Duration) -> Result<Box<dyn Transceiver>> {
        let transceiver = tokio::time::timeout(timeout, UdpTransceiver::connect(&self.endpoint))
            .await
            .map_err(|_| Error::ConnectFailed {
                endpoint: self.endpoint.address(),
                reason: "connect timeout exceeded".into(),
            })??;
        Ok(Box::new(transceiver))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
