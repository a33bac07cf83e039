use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{ENCODING_MAJOR, ENCODING_MINOR};

/// Size of the `i32` size plus the two encoding version bytes that open
/// every encapsulation.
pub const ENCAPS_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone)]
struct WriteEncaps {
    start: usize,
}

#[derive(Debug, Clone)]
struct ReadEncaps {
    start: usize,
    size: usize,
}

/// Growable marshaling buffer
///
/// Writes always append at the end of the buffer; reads consume from an
/// independent read position. All fixed-width primitives are little-endian.
/// Nested encapsulations bound how far a reader may go and are back-patched
/// with their size when a writer closes them.
#[derive(Debug, Clone, Default)]
pub struct BasicStream {
    buf: Vec<u8>,
    pos: usize,
    write_encaps: Vec<WriteEncaps>,
    read_encaps: Vec<ReadEncaps>,
}

impl BasicStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Wrap existing bytes, positioned for reading at the start
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self {
            buf,
            ..Self::default()
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Clear contents and bookkeeping while keeping the allocation
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.write_encaps.clear();
        self.read_encaps.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Current read position
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Grow or shrink the buffer; new bytes are zeroed.
    pub fn resize(&mut self, len: usize) {
        self.buf.resize(len, 0);
        if self.pos > len {
            self.pos = len;
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
        if self.pos > len {
            self.pos = len;
        }
    }

    /// Bytes between the read position and the end of the buffer.
    ///
    /// Transceivers fill this region and then advance the position.
    pub fn unread_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    /// Bytes a reader may still consume, honoring the innermost encapsulation
    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos)
    }

    fn limit(&self) -> usize {
        match self.read_encaps.last() {
            Some(encaps) => encaps.start + encaps.size,
            None => self.buf.len(),
        }
    }

    fn take(&mut self, needed: usize) -> Result<&[u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(Error::OutOfBounds { needed, remaining });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&self.buf[start..start + needed])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    // Writing

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite four bytes at `at` with `value`
    ///
    /// # Panics
    ///
    /// Panics if `at + 4` is past the end of the buffer.
    pub fn rewrite_i32(&mut self, value: i32, at: usize) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Sizes below 255 take one byte; larger ones a 255 marker and an `i32`.
    pub fn write_size(&mut self, size: usize) {
        debug_assert!(size <= i32::MAX as usize);
        if size < 255 {
            self.write_u8(size as u8);
        } else {
            self.write_u8(255);
            self.write_i32(size as i32);
        }
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.write_blob(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_string_seq<S: AsRef<str>>(&mut self, values: &[S]) {
        self.write_size(values.len());
        for value in values {
            self.write_string(value.as_ref());
        }
    }

    // Reading

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let byte = self.read_u8()?;
        if byte < 255 {
            return Ok(usize::from(byte));
        }
        let size = self.read_i32()?;
        if size < 0 {
            return Err(Error::NegativeSize(size));
        }
        Ok(size as usize)
    }

    pub fn read_blob(&mut self, len: usize) -> Result<&[u8]> {
        self.take(len)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_size()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::InvalidUtf8)
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let len = self.read_size()?;
        // Every string needs at least its size byte
        if len > self.remaining() {
            return Err(Error::OutOfBounds {
                needed: len,
                remaining: self.remaining(),
            });
        }
        (0..len).map(|_| self.read_string()).collect()
    }

    // Encapsulations

    pub fn start_write_encaps(&mut self) {
        self.write_encaps.push(WriteEncaps {
            start: self.buf.len(),
        });
        self.write_i32(0);
        self.write_u8(ENCODING_MAJOR);
        self.write_u8(ENCODING_MINOR);
    }

    /// Close the innermost encapsulation and back-patch its size.
    pub fn end_write_encaps(&mut self) -> Result<()> {
        let encaps = self
            .write_encaps
            .pop()
            .ok_or_else(|| Error::Encapsulation("no encapsulation to end".into()))?;
        let size = self.buf.len() - encaps.start;
        let size = i32::try_from(size).map_err(|_| Error::MemoryLimit {
            size,
            max: i32::MAX as usize,
        })?;
        self.rewrite_i32(size, encaps.start);
        Ok(())
    }

    /// Write `payload` as a complete encapsulation
    pub fn write_encaps(&mut self, payload: &[u8]) -> Result<()> {
        self.start_write_encaps();
        self.write_blob(payload);
        self.end_write_encaps()
    }

    pub fn start_read_encaps(&mut self) -> Result<()> {
        let start = self.pos;
        let size = self.read_i32()?;
        if size < ENCAPS_HEADER_SIZE as i32 {
            self.pos = start;
            return Err(Error::Encapsulation(format!(
                "encapsulation size {size} is smaller than its header"
            )));
        }
        let size = size as usize;
        let available = self.limit() - start;
        if size > available {
            self.pos = start;
            return Err(Error::OutOfBounds {
                needed: size,
                remaining: available,
            });
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        if major != ENCODING_MAJOR || minor > ENCODING_MINOR {
            return Err(Error::UnsupportedEncoding { major, minor });
        }
        self.read_encaps.push(ReadEncaps { start, size });
        Ok(())
    }

    /// Leave the innermost encapsulation; every byte of it must have been read.
    pub fn end_read_encaps(&mut self) -> Result<()> {
        let encaps = self
            .read_encaps
            .pop()
            .ok_or_else(|| Error::Encapsulation("no encapsulation to end".into()))?;
        let end = encaps.start + encaps.size;
        if self.pos != end {
            let unread = end.saturating_sub(self.pos);
            self.read_encaps.push(encaps);
            return Err(Error::Encapsulation(format!(
                "{unread} bytes left unread in encapsulation"
            )));
        }
        Ok(())
    }

    /// Bytes left in the innermost encapsulation being read
    pub fn encaps_remaining(&self) -> usize {
        match self.read_encaps.last() {
            Some(_) => self.remaining(),
            None => 0,
        }
    }

    pub fn skip_encaps(&mut self) -> Result<()> {
        let start = self.pos;
        let size = self.read_i32()?;
        if size < ENCAPS_HEADER_SIZE as i32 {
            self.pos = start;
            return Err(Error::Encapsulation(format!(
                "encapsulation size {size} is smaller than its header"
            )));
        }
        let end = start + size as usize;
        if end > self.limit() {
            self.pos = start;
            return Err(Error::OutOfBounds {
                needed: size as usize,
                remaining: self.limit() - start,
            });
        }
        self.pos = end;
        Ok(())
    }

    /// Read a whole encapsulation and return its payload
    pub fn read_encaps(&mut self) -> Result<Vec<u8>> {
        self.start_read_encaps()?;
        let len = self.remaining();
        let payload = self.take(len)?.to_vec();
        self.end_read_encaps()?;
        Ok(payload)
    }
}

/// Bounded free-list of streams so request and reply buffers are reused
/// instead of reallocated for every invocation.
#[derive(Debug)]
pub struct StreamPool {
    free: Mutex<Vec<BasicStream>>,
    max_retained: usize,
    max_capacity: usize,
}

impl StreamPool {
    pub fn new(max_retained: usize, max_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_retained)),
            max_retained,
            max_capacity,
        }
    }

    pub fn take(&self) -> BasicStream {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn give(&self, mut stream: BasicStream) {
        if stream.capacity() > self.max_capacity {
            return;
        }
        stream.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(stream);
        }
    }

    pub fn retained(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new(64, 64 * 1024)
    }
}
