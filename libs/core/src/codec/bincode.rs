use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Bincode with fixed-width little-endian integers, matching the byte order
/// of the surrounding frame. A payload must be consumed exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        options().serialize(value).map_err(|e| {
            Error::Codec(format!("cannot encode {}: {e}", std::any::type_name::<T>()))
        })
    }

    /// Payloads that are short, malformed or carry extra bytes do not match
    /// the expected type and surface as encapsulation errors
    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        options().deserialize(bytes).map_err(|e| {
            Error::Encapsulation(format!(
                "{} byte payload is not a {}: {e}",
                bytes.len(),
                std::any::type_name::<T>()
            ))
        })
    }
}
