//! Cursor-style reader and writer for packet bodies.
//!
//! All integers are big-endian. Strings and byte slices carry a `u32` length
//! prefix. Every operation advances the cursor; there is no implicit seeking.
//! Bounding the total size of a frame is the framing layer's job, so declared
//! lengths are only checked against the bytes actually present.

use crate::error::CodecError;

/// Reads fields out of a single packet body.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    offset: usize,
    saved: Vec<usize>,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            saved: Vec::new(),
        }
    }

    /// Current position in the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Length of the whole underlying buffer
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pushes the current offset so a speculative read can be undone
    pub fn save_offset(&mut self) {
        self.saved.push(self.offset);
    }

    /// Pops the most recently saved offset and rewinds to it
    pub fn restore_offset(&mut self) -> Result<(), CodecError> {
        self.offset = self.saved.pop().ok_or(CodecError::OffsetStackEmpty)?;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::OutOfBounds {
                needed: len,
                remaining,
            });
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.buf[start..self.offset])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Length-prefixed (u32) UTF-8 string
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes_with_len()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Length-prefixed (u32) byte slice
    pub fn read_bytes_with_len(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Exactly `len` raw bytes, copied out so the frame can be dropped
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(len)?.to_vec())
    }

    /// Fixed-size raw bytes
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.take_array()
    }

    /// Consumes everything left. Only valid as the last field of a packet.
    pub fn read_remainder(&mut self) -> Vec<u8> {
        let rest = self.buf[self.offset..].to_vec();
        self.offset = self.buf.len();
        rest
    }

    /// Signed 16-bit list count
    pub fn read_count_i16(&mut self) -> Result<usize, CodecError> {
        let count = self.read_i16()?;
        usize::try_from(count).map_err(|_| CodecError::NegativeLength(count.into()))
    }

    /// Signed 32-bit list count
    pub fn read_count_i32(&mut self) -> Result<usize, CodecError> {
        let count = self.read_i32()?;
        usize::try_from(count).map_err(|_| CodecError::NegativeLength(count.into()))
    }
}

const INITIAL_CAPACITY: usize = 1024;

/// Appends fields to a growable packet body.
///
/// The backing `Vec` grows geometrically, so a long run of small writes
/// never reallocates per byte.
#[derive(Debug, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn ensure_space(&mut self, needed: usize) {
        let required = self.buf.len() + needed;
        if required > self.buf.capacity() {
            let mut capacity = self.buf.capacity().max(INITIAL_CAPACITY);
            while capacity < required {
                capacity *= 2;
            }
            self.buf.reserve_exact(capacity - self.buf.len());
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_raw(&[value]);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_raw(&value.to_be_bytes());
    }

    /// Length-prefixed (u32) UTF-8 string
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes_with_len(value.as_bytes());
    }

    /// Length-prefixed (u32) byte slice
    pub fn write_bytes_with_len(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u32::MAX as usize);
        self.ensure_space(4 + bytes.len());
        self.write_u32(bytes.len() as u32);
        self.write_raw(bytes);
    }

    /// Raw bytes with no length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.ensure_space(bytes.len());
        self.buf.extend_from_slice(bytes);
    }
}
