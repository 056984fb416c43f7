//! Typed consumption of a chain.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::BufferReader;
use crate::chain::BufferChain;
use crate::codec::Codec;
use crate::error::{Error, Result};

/// A typed reader over a [`BufferChain`].
///
/// The iterator tracks a block index and a byte cursor within the current
/// block, and sees blocks appended after its creation. `has_next` is
/// non-blocking; callers wanting draining semantics use
/// [`wait_for_all`](ChainIterator::wait_for_all) first.
pub struct ChainIterator<T: Codec> {
    chain: Arc<BufferChain>,
    /// Index of the next block to open.
    block: usize,
    /// Reader over the block most recently opened, if any.
    reader: Option<BufferReader>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Codec> ChainIterator<T> {
    pub(crate) fn new(chain: Arc<BufferChain>) -> Self {
        ChainIterator { chain, block: 0, reader: None, _marker: PhantomData }
    }

    /// True if a record can be decoded right now: the current block has
    /// remaining bytes, or a later block is already present.
    pub fn has_next(&self) -> bool {
        if let Some(reader) = &self.reader {
            if !reader.is_empty() {
                return true;
            }
        }
        let mut index = self.block;
        while let Some(element) = self.chain.element(index) {
            if !element.buffer.is_empty() {
                return true;
            }
            index += 1;
        }
        false
    }

    /// Decodes the next record, advancing to the following block at a block
    /// boundary. Fails with [`Error::Exhausted`] if no record is available.
    pub fn next(&mut self) -> Result<T> {
        loop {
            if let Some(reader) = &mut self.reader {
                if !reader.is_empty() {
                    return T::decode(reader);
                }
            }
            match self.chain.element(self.block) {
                Some(element) => {
                    self.block += 1;
                    self.reader = Some(BufferReader::new(element.buffer));
                }
                None => return Err(Error::Exhausted),
            }
        }
    }

    /// Blocks until the chain is closed. After this returns, `has_next`
    /// reflects all data that will ever arrive.
    pub fn wait_for_all(&self) {
        self.chain.wait_until_closed();
    }

    /// True once the chain is closed and every block is fully consumed.
    pub fn is_finished(&self) -> bool {
        self.chain.is_closed() && !self.has_next()
    }

    /// True if the chain was closed by a transport failure rather than by
    /// its senders.
    pub fn is_failed(&self) -> bool {
        self.chain.is_failed()
    }

    /// Drains every remaining record into a vector. Call after
    /// [`wait_for_all`](ChainIterator::wait_for_all) for the full sequence.
    pub fn collect_remaining(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BinaryBufferBuilder;

    fn chain_of(batches: &[&[&str]]) -> Arc<BufferChain> {
        let chain = Arc::new(BufferChain::new());
        let mut builder = BinaryBufferBuilder::new();
        for batch in batches {
            for record in *batch {
                record.to_string().encode(&mut builder);
                builder.mark_element();
            }
            chain.append_builder(&mut builder).unwrap();
        }
        chain
    }

    #[test]
    fn emit_then_iterate_preserves_order() {
        let chain = chain_of(&[&["foo", "bar"], &["baz"]]);
        chain.close();
        let mut it = ChainIterator::<String>::new(chain);
        assert!(it.has_next());
        assert_eq!(it.next().unwrap(), "foo");
        assert_eq!(it.next().unwrap(), "bar");
        assert_eq!(it.next().unwrap(), "baz");
        assert!(!it.has_next());
        assert!(it.is_finished());
    }

    #[test]
    fn next_without_elements_is_exhausted() {
        let chain = Arc::new(BufferChain::new());
        let mut it = ChainIterator::<u32>::new(chain);
        assert!(matches!(it.next(), Err(Error::Exhausted)));
    }

    #[test]
    fn not_finished_while_open() {
        let chain = chain_of(&[&["only"]]);
        let mut it = ChainIterator::<String>::new(Arc::clone(&chain));
        assert_eq!(it.next().unwrap(), "only");
        // Drained but the chain could still grow.
        assert!(!it.is_finished());
        chain.close();
        assert!(it.is_finished());
    }

    #[test]
    fn sees_blocks_appended_after_creation() {
        let chain = chain_of(&[&["a"]]);
        let mut it = ChainIterator::<String>::new(Arc::clone(&chain));
        assert_eq!(it.next().unwrap(), "a");
        assert!(!it.has_next());

        let mut builder = BinaryBufferBuilder::new();
        "b".to_string().encode(&mut builder);
        builder.mark_element();
        chain.append_builder(&mut builder).unwrap();

        assert!(it.has_next());
        assert_eq!(it.next().unwrap(), "b");
    }

    #[test]
    fn failed_chain_finishes_with_flag() {
        let chain = chain_of(&[&["partial"]]);
        let mut it = ChainIterator::<String>::new(Arc::clone(&chain));
        chain.fail();
        // Data received before the failure is still readable.
        assert_eq!(it.next().unwrap(), "partial");
        assert!(it.is_finished());
        assert!(it.is_failed());
    }
}
