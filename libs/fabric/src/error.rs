use std::sync::Arc;

use meridian_core::Identity;
use thiserror::Error;

/// Target of a request the server could not route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailed {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl std::fmt::Display for RequestFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "identity `{}`", self.identity)?;
        if !self.facet.is_empty() {
            write!(f, " facet `{}`", self.facet)?;
        }
        write!(f, " operation `{}`", self.operation)
    }
}

/// Failure of an invocation or of the runtime carrying it
///
/// Failures are shared: one broken connection fails every request pending on
/// it, so the type is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Transport and connection failures
    #[error("socket error: {0}")]
    Socket(Arc<std::io::Error>),

    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("connection to {0} refused")]
    ConnectionRefused(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("connection closed gracefully by peer")]
    CloseConnection,

    #[error("connection forcefully closed")]
    ForcedCloseConnection,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("timed out closing connection")]
    CloseTimeout,

    #[error("invocation timed out")]
    Timeout,

    #[error("datagram of {size} bytes exceeds the datagram limit")]
    DatagramLimit { size: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    // Lifecycle
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    #[error("object adapter `{0}` deactivated")]
    ObjectAdapterDeactivated(String),

    #[error("object adapter `{0}` already registered")]
    AlreadyRegistered(String),

    #[error("no suitable endpoint for `{0}`")]
    NoEndpoint(String),

    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    // Marshaling
    #[error("marshal error: {0}")]
    Marshal(#[from] meridian_core::Error),

    // Remote structured failures
    #[error("object does not exist: {0}")]
    ObjectNotExist(RequestFailed),

    #[error("facet does not exist: {0}")]
    FacetNotExist(RequestFailed),

    #[error("operation does not exist: {0}")]
    OperationNotExist(RequestFailed),

    // Remote opaque failures
    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    #[error("unknown exception: {0}")]
    Unknown(String),

    /// A user exception raised by the servant, still encoded
    #[error("user exception ({} bytes)", .0.len())]
    UserException(Vec<u8>),

    /// The request may have reached the server: repeating it could execute
    /// the operation twice.
    #[error("{0} (request may have been executed)")]
    NonRepeatable(Box<Error>),
}

impl Error {
    /// Wrap a failure observed after the request bytes may have left the
    /// process. A graceful close from the peer guarantees the request was not
    /// dispatched and is never wrapped.
    pub fn non_repeatable(self) -> Self {
        match self {
            Error::CloseConnection | Error::NonRepeatable(_) => self,
            other => Error::NonRepeatable(Box::new(other)),
        }
    }

    /// The failure with any `NonRepeatable` wrapper removed
    pub fn cause(&self) -> &Error {
        match self {
            Error::NonRepeatable(inner) => inner.cause(),
            other => other,
        }
    }

    pub fn into_cause(self) -> Error {
        match self {
            Error::NonRepeatable(inner) => inner.into_cause(),
            other => other,
        }
    }

    pub fn is_non_repeatable(&self) -> bool {
        matches!(self, Error::NonRepeatable(_))
    }

    /// Whether a failure that certainly did not execute the request may be
    /// retried on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Socket(_)
                | Error::ConnectFailed { .. }
                | Error::ConnectionRefused(_)
                | Error::ConnectionLost
                | Error::CloseConnection
                | Error::ConnectionTimeout
                | Error::CloseTimeout
        )
    }

    /// Shutdown-related failures are expected and not worth a warning
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Error::CloseConnection
                | Error::ForcedCloseConnection
                | Error::CommunicatorDestroyed
                | Error::ObjectAdapterDeactivated(_)
                | Error::ConnectionTimeout
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Error::ConnectionLost,
            _ => Error::Socket(Arc::new(e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
