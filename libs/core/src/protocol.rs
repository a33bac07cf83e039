//! Wire framing
//!
//! Every message starts with a fixed 14-byte header:
//!
//! ```text
//! magic:4 | protocol major:1 minor:1 | encoding major:1 minor:1 | type:1 | compression:1 | size:4
//! ```
//!
//! `size` is the little-endian total frame size, header included. Request
//! frames follow the header with an `i32` request id (0 for oneways), batch
//! frames with an `i32` request count, and reply frames with the id of the
//! request they answer.

use crate::error::{Error, Result};
use crate::identity::{Context, Identity};
use crate::stream::BasicStream;

pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;
pub const ENCODING_MAJOR: u8 = 1;
pub const ENCODING_MINOR: u8 = 0;

pub const HEADER_SIZE: usize = 14;
/// Offset of the message size field within the header
pub const SIZE_OFFSET: usize = 10;
/// Request id (or batch request count) immediately follows the header
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_COMPRESSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Request,
            1 => Self::RequestBatch,
            2 => Self::Reply,
            3 => Self::ValidateConnection,
            4 => Self::CloseConnection,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::RequestBatch => "batch request",
            Self::Reply => "reply",
            Self::ValidateConnection => "validate connection",
            Self::CloseConnection => "close connection",
        };
        f.write_str(name)
    }
}

/// Status byte opening every reply body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::UserException,
            2 => Self::ObjectNotExist,
            3 => Self::FacetNotExist,
            4 => Self::OperationNotExist,
            5 => Self::UnknownLocalException,
            6 => Self::UnknownUserException,
            7 => Self::UnknownException,
            other => return Err(Error::UnknownReplyStatus(other)),
        })
    }
}

/// Declared idempotency of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    /// Whether running the operation twice is harmless
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Normal,
            1 => Self::Nonmutating,
            2 => Self::Idempotent,
            other => return Err(Error::InvalidOperationMode(other)),
        })
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub compression: u8,
    pub size: usize,
}

impl Header {
    /// Append a header with a zero size placeholder to `os`.
    ///
    /// The size is patched by [`finish_message`] once the body is written.
    pub fn write(message_type: MessageType, os: &mut BasicStream) {
        os.write_blob(&MAGIC);
        os.write_u8(PROTOCOL_MAJOR);
        os.write_u8(PROTOCOL_MINOR);
        os.write_u8(ENCODING_MAJOR);
        os.write_u8(ENCODING_MINOR);
        os.write_u8(message_type as u8);
        os.write_u8(COMPRESSION_NONE);
        os.write_i32(0);
    }

    /// Validate and decode the first [`HEADER_SIZE`] bytes of a frame.
    ///
    /// Nothing past the header is looked at; a frame whose declared size is
    /// below the header size or above `max_size` is rejected.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::OutOfBounds {
                needed: HEADER_SIZE,
                remaining: bytes.len(),
            });
        }
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }
        if bytes[4] != PROTOCOL_MAJOR || bytes[5] > PROTOCOL_MINOR {
            return Err(Error::UnsupportedProtocol {
                major: bytes[4],
                minor: bytes[5],
            });
        }
        if bytes[6] != ENCODING_MAJOR || bytes[7] > ENCODING_MINOR {
            return Err(Error::UnsupportedEncoding {
                major: bytes[6],
                minor: bytes[7],
            });
        }
        let message_type = MessageType::try_from(bytes[8])?;
        let compression = bytes[9];
        let size = i32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        if size < HEADER_SIZE as i32 {
            return Err(Error::IllegalMessageSize(size));
        }
        let size = size as usize;
        if size > max_size {
            return Err(Error::MemoryLimit {
                size,
                max: max_size,
            });
        }
        Ok(Self {
            message_type,
            compression,
            size,
        })
    }
}

/// Patch the header size field with the final frame length.
pub fn finish_message(os: &mut BasicStream) -> Result<()> {
    let len = os.len();
    let size = i32::try_from(len).map_err(|_| Error::MemoryLimit {
        size: len,
        max: i32::MAX as usize,
    })?;
    os.rewrite_i32(size, SIZE_OFFSET);
    Ok(())
}

/// A complete header-only frame (validate or close connection)
pub fn header_only(message_type: MessageType) -> BasicStream {
    let mut os = BasicStream::with_capacity(HEADER_SIZE);
    Header::write(message_type, &mut os);
    os.rewrite_i32(HEADER_SIZE as i32, SIZE_OFFSET);
    os
}

/// The part of a request every servant lookup needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
}

impl RequestHeader {
    /// Write identity, facet path, operation, mode and context.
    pub fn write(
        os: &mut BasicStream,
        identity: &Identity,
        facet: &str,
        operation: &str,
        mode: OperationMode,
        context: &Context,
    ) {
        identity.write(os);
        if facet.is_empty() {
            os.write_size(0);
        } else {
            os.write_string_seq(&[facet]);
        }
        os.write_string(operation);
        os.write_u8(mode as u8);
        crate::identity::write_context(os, context);
    }

    pub fn read(is: &mut BasicStream) -> Result<Self> {
        let identity = Identity::read(is)?;
        let mut facet_path = is.read_string_seq()?;
        let facet = match facet_path.len() {
            0 => String::new(),
            1 => facet_path.remove(0),
            n => {
                return Err(Error::custom(format!(
                    "facet path with {n} elements is not supported"
                )))
            }
        };
        let operation = is.read_string()?;
        let mode = OperationMode::try_from(is.read_u8()?)?;
        let context = crate::identity::read_context(is)?;
        Ok(Self {
            identity,
            facet,
            operation,
            mode,
            context,
        })
    }
}
