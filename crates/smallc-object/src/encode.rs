//! Little-endian byte readers and writers for container encoding.

use thiserror::Error;

/// Errors that can occur while decoding a container
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("unexpected end of object data at offset {0}")]
    UnexpectedEnd(usize),

    /// Name field was not valid UTF-8
    #[error("invalid UTF-8 in name field at offset {0}")]
    InvalidUtf8(usize),
}

/// Byte-buffer writer with little-endian emission helpers.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Current offset (length of the buffer so far)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a NUL-padded fixed-width name field. Longer names are truncated.
    pub fn emit_name(&mut self, name: &str, width: usize) {
        let bytes = name.as_bytes();
        let take = bytes.len().min(width - 1);
        self.buffer.extend_from_slice(&bytes[..take]);
        self.buffer.resize(self.buffer.len() + (width - take), 0);
    }

    /// Pad with zero bytes until the buffer length is a multiple of `align`.
    pub fn align_to(&mut self, align: usize) {
        while self.buffer.len() % align != 0 {
            self.buffer.push(0);
        }
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked reader over a byte slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reposition the reader to an absolute offset.
    pub fn seek(&mut self, offset: usize) -> Result<(), DecodeError> {
        if offset > self.data.len() {
            return Err(DecodeError::UnexpectedEnd(offset));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.data.len() {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a NUL-padded fixed-width name field.
    pub fn read_name(&mut self, width: usize) -> Result<String, DecodeError> {
        let start = self.pos;
        let field = self.read_bytes(width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        std::str::from_utf8(&field[..end])
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_scalars() {
        let mut w = ByteWriter::new();
        w.emit_u8(0xAB);
        w.emit_u16(0x1234);
        w.emit_u32(0xDEADBEEF);
        w.emit_u64(0x0102030405060708);
        w.emit_i32(-7);

        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_name_field_padding_and_truncation() {
        let mut w = ByteWriter::new();
        w.emit_name(".text", 16);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..5], b".text");
        assert_eq!(bytes[5], 0);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_name(16).unwrap(), ".text");

        let mut w = ByteWriter::new();
        w.emit_name("abcdefgh", 4);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4);
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_name(4).unwrap(), "abc");
    }

    #[test]
    fn test_short_read_fails() {
        let bytes = [1u8, 2];
        let mut r = ByteReader::new(&bytes);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_align_to() {
        let mut w = ByteWriter::new();
        w.emit_bytes(b"abc");
        w.align_to(8);
        assert_eq!(w.offset(), 8);
    }
}
