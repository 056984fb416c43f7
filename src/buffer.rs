//! Immutable shared byte blocks, the builder that seals them, and a cursor
//! reader over sealed blocks.
//!
//! A `BinaryBuffer` is a view into an `Arc`-backed allocation, so cloning a
//! buffer or taking a sub-range never copies bytes. Blocks flow through the
//! system by reference; their storage is released when the last view drops.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Byte threshold at which emitters seal the current builder into a block.
pub const DEFAULT_BLOCK_SIZE: usize = 32 << 10;

/// An immutable region of bytes with shared ownership.
pub struct BinaryBuffer {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl BinaryBuffer {
    /// Wraps an owned byte vector without copying it.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len();
        BinaryBuffer { data: Arc::from(data.into_boxed_slice()), start: 0, end }
    }

    /// Length of this view in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True if the view covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The bytes covered by this view.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// A sub-view of this buffer sharing the same allocation.
    ///
    /// The range is relative to this view. Out-of-bounds ranges panic, as
    /// range indexing on slices does.
    pub fn slice(&self, range: Range<usize>) -> BinaryBuffer {
        assert!(range.start <= range.end && range.end <= self.len());
        BinaryBuffer {
            data: Arc::clone(&self.data),
            start: self.start + range.start,
            end: self.start + range.end,
        }
    }
}

impl Clone for BinaryBuffer {
    fn clone(&self) -> Self {
        BinaryBuffer { data: Arc::clone(&self.data), start: self.start, end: self.end }
    }
}

impl From<Vec<u8>> for BinaryBuffer {
    fn from(data: Vec<u8>) -> Self {
        BinaryBuffer::from_vec(data)
    }
}

impl PartialEq for BinaryBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for BinaryBuffer {}

impl fmt::Debug for BinaryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryBuffer({} bytes)", self.len())
    }
}

/// A mutable byte sink that records how many records it holds.
///
/// Serializers append bytes through the `put_*` methods and call
/// [`mark_element`](BinaryBufferBuilder::mark_element) once per completed
/// record. [`detach`](BinaryBufferBuilder::detach) seals the accumulated
/// bytes into an immutable [`BinaryBuffer`] and resets the builder for reuse.
#[derive(Default)]
pub struct BinaryBufferBuilder {
    data: Vec<u8>,
    elements: usize,
}

impl BinaryBufferBuilder {
    /// A new, empty builder.
    pub fn new() -> Self {
        BinaryBufferBuilder::default()
    }

    /// A new builder with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        BinaryBufferBuilder { data: Vec::with_capacity(capacity), elements: 0 }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes have been appended since the last detach.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of complete records serialized since the last detach.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Records that one more complete record now ends at the cursor.
    pub fn mark_element(&mut self) {
        self.elements += 1;
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i8(&mut self, v: i8) {
        self.data.push(v as u8);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends a `u32` byte length followed by the string's bytes.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    /// Seals the accumulated bytes into an immutable buffer and resets the
    /// builder to empty, ready for reuse.
    pub fn detach(&mut self) -> BinaryBuffer {
        self.elements = 0;
        BinaryBuffer::from_vec(std::mem::take(&mut self.data))
    }
}

/// A [`BinaryBuffer`] with a read cursor for incremental decoding.
pub struct BufferReader {
    buffer: BinaryBuffer,
    cursor: usize,
}

impl BufferReader {
    /// A reader positioned at the start of `buffer`.
    pub fn new(buffer: BinaryBuffer) -> Self {
        BufferReader { buffer, cursor: 0 }
    }

    /// Current read position in bytes.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes remaining after the cursor.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// True if the cursor has reached the end of the buffer.
    pub fn is_empty(&self) -> bool {
        self.cursor == self.buffer.len()
    }

    /// True if at least `n` bytes remain.
    pub fn available(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    /// Resets the cursor to the start of the buffer.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Advances the cursor `n` bytes without reading them.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check_available(n)?;
        self.cursor += n;
        Ok(())
    }

    fn check_available(&self, n: usize) -> Result<()> {
        if self.available(n) {
            Ok(())
        } else {
            // A record claims more bytes than its block holds. Blocks carry
            // whole records, so this is a serializer contract bug.
            Err(Error::Invariant("record decode ran past the end of its block"))
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        self.check_available(n)?;
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.buffer.as_slice()[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Reads `n` raw bytes, advancing the cursor.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }

    /// Reads a string written by [`BinaryBufferBuilder::put_string`].
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Invariant("string record is not valid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_roundtrip() {
        let mut builder = BinaryBufferBuilder::new();
        builder.put_u32(7);
        builder.mark_element();
        builder.put_string("exchange");
        builder.mark_element();
        assert_eq!(builder.elements(), 2);

        let buffer = builder.detach();
        assert!(builder.is_empty());
        assert_eq!(builder.elements(), 0);

        let mut reader = BufferReader::new(buffer);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "exchange");
        assert!(reader.is_empty());
    }

    #[test]
    fn slices_share_storage() {
        let buffer = BinaryBuffer::from_vec(vec![0, 1, 2, 3, 4, 5]);
        let sub = buffer.slice(2..5);
        assert_eq!(sub.as_slice(), &[2, 3, 4]);
        let subsub = sub.slice(1..2);
        assert_eq!(subsub.as_slice(), &[3]);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn equality_is_structural() {
        let a = BinaryBuffer::from_vec(vec![1, 2, 3]);
        let b = BinaryBuffer::from_vec(vec![0, 1, 2, 3]).slice(1..4);
        assert_eq!(a, b);
    }

    #[test]
    fn underrun_is_detected() {
        let mut reader = BufferReader::new(BinaryBuffer::from_vec(vec![1, 2]));
        assert!(matches!(reader.read_u32(), Err(Error::Invariant(_))));
        // A failed read does not advance the cursor.
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
    }
}
