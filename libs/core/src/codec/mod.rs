use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stream::BasicStream;

pub mod bincode;

pub use self::bincode::BincodeCodec;

/// Codec trait for typed operation parameters, results and user exceptions
///
/// Encoded bytes travel as the payload of an encapsulation, so a peer that
/// does not understand them can still skip the whole region.
pub trait Codec: Send + Sync {
    /// Encode a value into bytes
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a value
    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T>;

    /// Encode `value` as a complete encapsulation appended to `os`
    fn write_encaps<T: Serialize>(&self, os: &mut BasicStream, value: &T) -> Result<()> {
        let bytes = self.encode(value)?;
        os.write_encaps(&bytes)
    }

    /// Decode the next encapsulation of `is`
    fn read_encaps<T: for<'de> Deserialize<'de>>(&self, is: &mut BasicStream) -> Result<T> {
        let bytes = is.read_encaps()?;
        self.decode(&bytes)
    }
}
