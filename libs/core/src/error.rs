use thiserror::Error;

/// Marshaling and framing failures.
///
/// These are process-local programming or protocol errors: an invocation that
/// hits one of them is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unmarshal out of bounds: need {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("encapsulation error: {0}")]
    Encapsulation(String),

    #[error("negative size: {0}")]
    NegativeSize(i32),

    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    #[error("unsupported encoding version {major}.{minor}")]
    UnsupportedEncoding { major: u8, minor: u8 },

    #[error("illegal message size: {0}")]
    IllegalMessageSize(i32),

    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MemoryLimit { size: usize, max: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("unknown reply status: {0}")]
    UnknownReplyStatus(u8),

    #[error("invalid operation mode: {0}")]
    InvalidOperationMode(u8),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
