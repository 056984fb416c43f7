//! Wire frames exchanged on each point-to-point connection.
//!
//! Every frame is a fixed 20-byte little-endian header, followed by
//! `byte_length` payload bytes for `Data` frames. A `Close` frame carries no
//! payload and is each sender's end-of-stream marker for one channel.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Marks the start of every frame.
pub const MAGIC: u32 = 0x4337_4101;

/// Encoded size of a frame header in bytes.
pub const HEADER_BYTES: usize = 20;

/// Hard ceiling on a single frame's payload. Anything larger is treated as
/// a protocol violation rather than an allocation request.
pub const MAX_PAYLOAD: usize = 256 << 20;

/// The two frame flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A block of records for one channel.
    Data = 1,
    /// End-of-stream for one (channel, sender) pair.
    Close = 2,
}

/// Framing data preceding each payload.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Rank of the sending worker.
    pub src_rank: u16,
    /// Channel the payload belongs to.
    pub channel: u32,
    /// Records in the payload. Zero for `Close`.
    pub elements: u32,
    /// Payload bytes following the header. Zero for `Close`.
    pub length: u32,
}

impl FrameHeader {
    /// Header for a block of `elements` records in `length` payload bytes.
    pub fn data(channel: u32, src_rank: u16, elements: u32, length: u32) -> Self {
        FrameHeader { kind: FrameKind::Data, src_rank, channel, elements, length }
    }

    /// End-of-stream header for `src_rank` on `channel`.
    pub fn close(channel: u32, src_rank: u16) -> Self {
        FrameHeader { kind: FrameKind::Close, src_rank, channel, elements: 0, length: 0 }
    }

    /// Writes the header as binary data.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u8(self.kind as u8)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16::<LittleEndian>(self.src_rank)?;
        writer.write_u32::<LittleEndian>(self.channel)?;
        writer.write_u32::<LittleEndian>(self.elements)?;
        writer.write_u32::<LittleEndian>(self.length)?;
        Ok(())
    }

    /// Decodes and validates a header from exactly [`HEADER_BYTES`] bytes.
    pub fn read_from(bytes: &[u8; HEADER_BYTES]) -> Result<FrameHeader> {
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != MAGIC {
            return Err(Error::Protocol(format!("bad frame magic {magic:#010x}")));
        }
        let kind = match bytes[4] {
            1 => FrameKind::Data,
            2 => FrameKind::Close,
            other => {
                return Err(Error::Protocol(format!("unknown frame kind {other}")));
            }
        };
        let src_rank = LittleEndian::read_u16(&bytes[6..8]);
        let channel = LittleEndian::read_u32(&bytes[8..12]);
        let elements = LittleEndian::read_u32(&bytes[12..16]);
        let length = LittleEndian::read_u32(&bytes[16..20]);
        if length as usize > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "payload of {length} bytes exceeds the {MAX_PAYLOAD} byte ceiling"
            )));
        }
        if kind == FrameKind::Close && (length != 0 || elements != 0) {
            return Err(Error::Protocol("close frame with payload".to_string()));
        }
        Ok(FrameHeader { kind, src_rank, channel, elements, length })
    }

    /// Header plus payload size in bytes.
    pub fn required_bytes(&self) -> usize {
        HEADER_BYTES + self.length as usize
    }

    /// Encodes the header and payload into one contiguous frame.
    pub fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert_eq!(payload.len(), self.length as usize);
        let mut frame = Vec::with_capacity(self.required_bytes());
        self.write_to(&mut frame).expect("writes to a Vec cannot fail");
        frame.extend_from_slice(payload);
        frame
    }
}
