//! Typed production of blocks.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BinaryBufferBuilder, DEFAULT_BLOCK_SIZE};
use crate::chain::BufferChain;
use crate::channel::{ChannelId, Multiplexer};
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::net::dispatcher::FrameSender;
use crate::net::frame::FrameHeader;

/// Where a sealed block goes when an emitter flushes.
pub(crate) enum EmitterDest {
    /// Append to a local chain; closing the emitter closes the chain.
    Chain(Arc<BufferChain>),
    /// Loop back into the local multiplexer as if received from the wire.
    Loopback { mux: Arc<Multiplexer>, channel: ChannelId },
    /// Frame and queue for the dispatcher to send to a remote worker.
    Network { queue: FrameSender, channel: ChannelId, src: usize, dst: usize },
}

/// A typed producer that accumulates records and flushes whole blocks.
///
/// Records emitted through one emitter arrive in emission order. Across
/// emitters on the same channel no order is implied.
pub struct Emitter<T: Codec> {
    builder: BinaryBufferBuilder,
    dest: EmitterDest,
    block_size: usize,
    closed: bool,
    /// First error hit on an automatic flush, surfaced by the next
    /// fallible call.
    pending: Option<Error>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Codec> Emitter<T> {
    pub(crate) fn new(dest: EmitterDest) -> Self {
        Emitter {
            builder: BinaryBufferBuilder::with_capacity(DEFAULT_BLOCK_SIZE),
            dest,
            block_size: DEFAULT_BLOCK_SIZE,
            closed: false,
            pending: None,
            _marker: PhantomData,
        }
    }

    /// Overrides the block threshold, mostly to force small blocks in tests.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Serializes one record. If the current block then exceeds the
    /// threshold, it is flushed to the destination.
    ///
    /// Never fails per record: an error on the automatic flush, or emitting
    /// after `close`, is remembered and returned by the next call to
    /// [`flush`](Emitter::flush) or [`close`](Emitter::close).
    pub fn emit(&mut self, item: &T) {
        if self.closed {
            self.pending.get_or_insert(Error::Closed);
            return;
        }
        item.encode(&mut self.builder);
        self.builder.mark_element();
        if self.builder.len() >= self.block_size {
            if let Err(e) = self.flush_block() {
                self.pending.get_or_insert(e);
            }
        }
    }

    /// Seals and delivers the current block, if non-empty.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        if self.closed {
            return Err(Error::Closed);
        }
        self.flush_block()
    }

    /// Flushes, then delivers this sender's end-of-stream marker. The
    /// emitter accepts nothing afterwards.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        match &self.dest {
            EmitterDest::Chain(chain) => {
                chain.close();
                Ok(())
            }
            EmitterDest::Loopback { mux, channel } => mux.on_close(*channel, mux.my_rank()),
            EmitterDest::Network { queue, channel, src, dst } => {
                let frame = FrameHeader::close(*channel, *src as u16).encode_frame(&[]);
                send_frame(queue, *dst, frame)
            }
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        match &self.dest {
            EmitterDest::Chain(chain) => chain.append_builder(&mut self.builder),
            EmitterDest::Loopback { mux, channel } => {
                let elements = self.builder.elements();
                let buffer = self.builder.detach();
                mux.on_data(*channel, mux.my_rank(), buffer, elements)
            }
            EmitterDest::Network { queue, channel, src, dst } => {
                let elements = self.builder.elements() as u32;
                let buffer = self.builder.detach();
                let header =
                    FrameHeader::data(*channel, *src as u16, elements, buffer.len() as u32);
                send_frame(queue, *dst, header.encode_frame(buffer.as_slice()))
            }
        }
    }
}

/// Queues one encoded frame for `dst`, blocking when the dispatcher queue is
/// full. A hung-up dispatcher surfaces as a broken pipe.
pub(crate) fn send_frame(queue: &FrameSender, dst: usize, frame: Vec<u8>) -> Result<()> {
    queue.send((dst, frame)).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "dispatcher terminated",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_flushes_and_closes_chain() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<String>::new(EmitterDest::Chain(Arc::clone(&chain)));
        emitter.emit(&"foo".to_string());
        emitter.emit(&"bar".to_string());
        emitter.close().unwrap();

        assert!(chain.is_closed());
        assert_eq!(chain.size(), 2);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn threshold_splits_blocks() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u64>::new(EmitterDest::Chain(Arc::clone(&chain)))
            .with_block_size(16);
        for i in 0..6u64 {
            emitter.emit(&i);
        }
        emitter.close().unwrap();

        // Two records per 16-byte block.
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.size(), 6);
    }

    #[test]
    fn flush_after_close_is_an_error() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u32>::new(EmitterDest::Chain(chain));
        emitter.close().unwrap();
        assert!(matches!(emitter.flush(), Err(Error::Closed)));
    }

    #[test]
    fn emit_after_close_surfaces_on_the_next_flush() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u32>::new(EmitterDest::Chain(Arc::clone(&chain)));
        emitter.close().unwrap();
        // Per record, emit stays infallible; the misuse is remembered.
        emitter.emit(&7);
        assert!(matches!(emitter.flush(), Err(Error::Closed)));
        // The record never reached the chain.
        assert_eq!(chain.size(), 0);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u32>::new(EmitterDest::Chain(Arc::clone(&chain)));
        emitter.flush().unwrap();
        assert_eq!(chain.len(), 0);
    }
}
