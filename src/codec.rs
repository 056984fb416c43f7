//! Typed record encoding over untyped blocks.
//!
//! Chains and the wire carry bytes only; typing lives at the emitter and
//! iterator endpoints through the [`Codec`] trait. Fixed-width integers are
//! little-endian; strings are a `u32` byte length followed by the bytes.

use crate::buffer::{BinaryBufferBuilder, BufferReader};
use crate::error::Result;

/// A record type with a fixed binary encoding.
pub trait Codec: Sized {
    /// Serializes `self` onto the end of `builder`.
    fn encode(&self, builder: &mut BinaryBufferBuilder);

    /// Deserializes one record at the reader's cursor.
    fn decode(reader: &mut BufferReader) -> Result<Self>;

    /// Advances the cursor past one record without materializing it.
    ///
    /// Used to locate record boundaries when cutting blocks. The default
    /// decodes and discards; types with a length prefix override it.
    fn skip(reader: &mut BufferReader) -> Result<()> {
        Self::decode(reader).map(|_| ())
    }
}

macro_rules! int_codec {
    ($t:ty, $put:ident, $get:ident, $width:expr) => {
        impl Codec for $t {
            fn encode(&self, builder: &mut BinaryBufferBuilder) {
                builder.$put(*self);
            }

            fn decode(reader: &mut BufferReader) -> Result<Self> {
                reader.$get()
            }

            fn skip(reader: &mut BufferReader) -> Result<()> {
                reader.skip($width)
            }
        }
    };
}

int_codec!(u8, put_u8, read_u8, 1);
int_codec!(u16, put_u16, read_u16, 2);
int_codec!(u32, put_u32, read_u32, 4);
int_codec!(u64, put_u64, read_u64, 8);
int_codec!(i8, put_i8, read_i8, 1);
int_codec!(i16, put_i16, read_i16, 2);
int_codec!(i32, put_i32, read_i32, 4);
int_codec!(i64, put_i64, read_i64, 8);

impl Codec for String {
    fn encode(&self, builder: &mut BinaryBufferBuilder) {
        builder.put_string(self);
    }

    fn decode(reader: &mut BufferReader) -> Result<Self> {
        reader.read_string()
    }

    fn skip(reader: &mut BufferReader) -> Result<()> {
        let len = reader.read_u32()? as usize;
        reader.skip(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BinaryBufferBuilder;

    #[test]
    fn ints_roundtrip() {
        let mut builder = BinaryBufferBuilder::new();
        42u32.encode(&mut builder);
        (-7i64).encode(&mut builder);
        let mut reader = BufferReader::new(builder.detach());
        assert_eq!(u32::decode(&mut reader).unwrap(), 42);
        assert_eq!(i64::decode(&mut reader).unwrap(), -7);
    }

    #[test]
    fn string_skip_matches_decode() {
        let mut builder = BinaryBufferBuilder::new();
        "breakfast".to_string().encode(&mut builder);
        "tea".to_string().encode(&mut builder);
        let buffer = builder.detach();

        let mut skipper = BufferReader::new(buffer.clone());
        String::skip(&mut skipper).unwrap();
        let boundary = skipper.cursor();

        let mut decoder = BufferReader::new(buffer);
        String::decode(&mut decoder).unwrap();
        assert_eq!(decoder.cursor(), boundary);
        assert_eq!(String::decode(&mut decoder).unwrap(), "tea");
    }
}
