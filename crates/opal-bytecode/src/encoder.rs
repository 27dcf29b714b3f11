//! Binary encoding and decoding utilities
//!
//! This module provides the low-level writer and reader used by the program
//! format. All multi-byte values are little-endian.

use thiserror::Error;

/// Errors that can occur while decoding a binary program
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Invalid opcode byte
    #[error("Invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),
}

/// Binary writer for encoding programs
pub struct ProgramWriter {
    buffer: Vec<u8>,
}

impl ProgramWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Current offset (bytes written so far)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Borrow the encoded bytes
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 32-bit unsigned integer
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit signed integer
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a length-prefixed UTF-8 string
    pub fn emit_str(&mut self, value: &str) {
        self.emit_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Emit raw bytes without a length prefix
    pub fn emit_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

impl Default for ProgramWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary reader for decoding programs
pub struct ProgramReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ProgramReader<'a> {
    /// Create a reader over a byte slice
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Current read offset
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes remaining
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Check whether all input has been consumed
    pub fn is_at_end(&self) -> bool {
        self.offset == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd(self.offset));
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    /// Read a raw byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 32-bit unsigned integer
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 64-bit signed integer
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let start = self.offset;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Read exactly `n` raw bytes
    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = ProgramWriter::new();
        w.emit_u8(0xAB);
        w.emit_u32(0xDEAD_BEEF);
        w.emit_i64(-42);
        w.emit_str("opal");

        let bytes = w.into_bytes();
        let mut r = ProgramReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i64().unwrap(), -42);
        assert_eq!(r.read_str().unwrap(), "opal");
        assert!(r.is_at_end());
    }

    #[test]
    fn test_unexpected_end() {
        let mut r = ProgramReader::new(&[1, 2]);
        assert!(matches!(r.read_u32(), Err(DecodeError::UnexpectedEnd(0))));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut w = ProgramWriter::new();
        w.emit_u32(2);
        w.emit_raw(&[0xFF, 0xFE]);
        let bytes = w.into_bytes();
        let mut r = ProgramReader::new(&bytes);
        assert!(matches!(r.read_str(), Err(DecodeError::InvalidUtf8(4))));
    }

    #[test]
    fn test_offset_tracking() {
        let mut r = ProgramReader::new(&[0; 16]);
        r.read_u32().unwrap();
        assert_eq!(r.offset(), 4);
        r.read_i64().unwrap();
        assert_eq!(r.offset(), 12);
        assert_eq!(r.remaining(), 4);
    }
}
