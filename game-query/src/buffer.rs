//! Bounds-checked reader over a response payload.
//!
//! All multi-byte integers in the supported game protocols are little-endian.
//! Every read either returns a value or a [`QueryError::Malformed`]; nothing
//! here panics on short input.

use crate::error::QueryError;

pub struct Buffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Buffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Look at the next `len` bytes without consuming them.
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        self.data.get(self.pos..end)
    }

    pub fn read(&mut self, len: usize) -> Result<&'a [u8], QueryError> {
        let bytes = self.peek(len).ok_or_else(|| {
            QueryError::Malformed(format!(
                "need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            ))
        })?;
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), QueryError> {
        self.read(len).map(|_| ())
    }

    /// Consume `prefix` if the buffer starts with it.
    pub fn expect(&mut self, prefix: &[u8]) -> Result<(), QueryError> {
        match self.peek(prefix.len()) {
            Some(head) if head == prefix => {
                self.pos += prefix.len();
                Ok(())
            }
            _ => Err(QueryError::Malformed(format!(
                "expected {:02x?} at offset {}",
                prefix, self.pos
            ))),
        }
    }

    /// Consume `prefix` if present. Returns whether it was.
    pub fn skip_prefix(&mut self, prefix: &[u8]) -> bool {
        if self.peek(prefix.len()) == Some(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, QueryError> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, QueryError> {
        let b = self.read(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, QueryError> {
        let b = self.read(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, QueryError> {
        let b = self.read(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, QueryError> {
        let b = self.read(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, QueryError> {
        Ok(f32::from_bits(self.read_u32_le()?))
    }

    /// Read up to (not including) `delim` and consume the delimiter. When the
    /// delimiter is missing the rest of the buffer is returned.
    pub fn read_until(&mut self, delim: u8) -> &'a [u8] {
        let rest = self.rest();
        match rest.iter().position(|&b| b == delim) {
            Some(idx) => {
                self.pos += idx + 1;
                &rest[..idx]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    /// NUL-terminated string, lossily decoded.
    pub fn read_cstring(&mut self) -> Result<String, QueryError> {
        let rest = self.rest();
        let idx = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            QueryError::Malformed(format!("unterminated string at offset {}", self.pos))
        })?;
        self.pos += idx + 1;
        Ok(String::from_utf8_lossy(&rest[..idx]).into_owned())
    }
}
