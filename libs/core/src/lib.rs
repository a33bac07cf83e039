//! Meridian Core - wire protocol and marshaling layer
//!
//! Provides the 14-byte frame header codec, the [`BasicStream`] marshaling
//! buffer with nested encapsulations, identity/context marshaling and typed
//! parameter codecs shared by clients and servers.
//!
//! # Example
//!
//! ```
//! use meridian_core::{BasicStream, codec::{BincodeCodec, Codec}};
//!
//! # fn example() -> meridian_core::Result<()> {
//! let mut os = BasicStream::new();
//! BincodeCodec.write_encaps(&mut os, &(7u32, "seven".to_string()))?;
//!
//! let mut is = BasicStream::from_vec(os.into_vec());
//! let (n, s): (u32, String) = BincodeCodec.read_encaps(&mut is)?;
//! assert_eq!((n, s.as_str()), (7, "seven"));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod stream;

// Re-exports for convenience
pub use error::{Error, Result};
pub use identity::{Context, Identity};
pub use protocol::{Header, MessageType, OperationMode, ReplyStatus, RequestHeader};
pub use stream::{BasicStream, StreamPool};
