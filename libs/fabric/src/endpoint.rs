use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::tcp::{TcpAcceptor, TcpConnector};
use crate::transport::udp::{UdpConnector, UdpTransceiver};
use crate::transport::{Acceptor, Connector, Transceiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

/// Address of a server-side transport plus per-endpoint overrides
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// Overrides the configured connect and invocation timeouts
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportKind::Tcp,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportKind::Udp,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn datagram(&self) -> bool {
        self.transport == TransportKind::Udp
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn connector(&self) -> Box<dyn Connector> {
        match self.transport {
            TransportKind::Tcp => Box::new(TcpConnector::new(self.clone())),
            TransportKind::Udp => Box::new(UdpConnector::new(self.clone())),
        }
    }

    /// Bind a listening acceptor; only stream transports accept connections
    pub(crate) async fn acceptor(&self) -> Result<Box<dyn Acceptor>> {
        match self.transport {
            TransportKind::Tcp => Ok(Box::new(TcpAcceptor::bind(self.clone()).await?)),
            TransportKind::Udp => Err(Error::FeatureNotSupported(format!(
                "{} endpoints do not accept connections",
                self.transport.as_str()
            ))),
        }
    }

    /// Bind the server side of a datagram endpoint
    pub(crate) async fn bind_datagram(&self) -> Result<(Box<dyn Transceiver>, Endpoint)> {
        let transceiver = UdpTransceiver::bind(self).await?;
        let endpoint = transceiver.local_endpoint(self)?;
        Ok((Box::new(transceiver), endpoint))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -h {} -p {}",
            self.transport.as_str(),
            self.host,
            self.port
        )?;
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        Ok(())
    }
}
