//! Byte transport abstraction
//!
//! The connection layer only ever sees these traits; concrete socket types
//! stay inside `tcp` and `udp`.

use std::time::Duration;

use meridian_core::BasicStream;

use crate::endpoint::Endpoint;
use crate::error::Result;

pub mod tcp;
pub mod udp;

pub use self::tcp::{TcpAcceptor, TcpConnector, TcpTransceiver};
pub use self::udp::{UdpConnector, UdpTransceiver};

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// One established transport connection
///
/// Split into halves so a connection can read and write concurrently.
pub trait Transceiver: Send + Sync {
    /// Whether messages are datagrams (no stream, no validation, no replies)
    fn datagram(&self) -> bool;

    /// Human readable local/remote address pair
    fn description(&self) -> String;

    fn split(self: Box<Self>) -> (Box<dyn TransceiverReader>, Box<dyn TransceiverWriter>);
}

#[async_trait::async_trait]
pub trait TransceiverReader: Send {
    /// Fill `buf` from its read position to its end, then move the position
    /// to the end.
    ///
    /// Datagram transceivers instead replace the contents of `buf` with the
    /// next datagram.
    async fn read(&mut self, buf: &mut BasicStream) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TransceiverWriter: Send {
    /// Write every byte of `buf`
    async fn write(&mut self, buf: &BasicStream) -> Result<()>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}

/// Establishes outgoing transceivers for one endpoint
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, timeout: Duration) -> Result<Box<dyn Transceiver>>;

    fn endpoint(&self) -> &Endpoint;
}

/// Listens for incoming transceivers on one endpoint
#[async_trait::async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Transceiver>>;

    /// Endpoint actually bound, with any ephemeral port resolved
    fn local_endpoint(&self) -> &Endpoint;
}
