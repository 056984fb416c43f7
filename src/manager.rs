//! The worker-side endpoint registry.
//!
//! One `Manager` per worker owns the multiplexer and the dispatcher thread,
//! allocates local collections and network channels, and mints the typed
//! emitters and iterators the dataflow runtime consumes. Channel ids are a
//! per-worker monotone counter; workers invoking the same allocation
//! sequence in the same program order agree on every id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::buffer::{BinaryBuffer, BufferReader};
use crate::chain::{BufferChain, BufferChainElement};
use crate::channel::{ChannelId, Multiplexer};
use crate::codec::Codec;
use crate::emit::{send_frame, Emitter, EmitterDest};
use crate::error::{Error, Result};
use crate::iter::ChainIterator;
use crate::net::dispatcher::{Dispatcher, FrameSender, SEND_QUEUE_DEPTH};
use crate::net::frame::FrameHeader;
use crate::net::{NetGroup, Stream};

/// Identifies a local (unexchanged) collection.
pub type LocalId = u32;

/// Per-worker entry point to the exchange substrate.
pub struct Manager {
    my_rank: usize,
    peers: usize,
    mux: Arc<Multiplexer>,
    locals: Mutex<HashMap<LocalId, Arc<BufferChain>>>,
    next_channel: AtomicU32,
    next_local: AtomicU32,
    outbound: FrameSender,
    _dispatcher: Dispatcher,
}

impl Manager {
    /// Takes ownership of a connected group and starts its I/O thread.
    pub fn new<S: Stream>(group: NetGroup<S>) -> Manager {
        let my_rank = group.my_rank();
        let peers = group.peers();
        let mux = Arc::new(Multiplexer::new(my_rank, peers));
        let (outbound, inbox) = bounded(SEND_QUEUE_DEPTH);
        let dispatcher = Dispatcher::spawn(group, Arc::clone(&mux), inbox);
        Manager {
            my_rank,
            peers,
            mux,
            locals: Mutex::new(HashMap::new()),
            next_channel: AtomicU32::new(0),
            next_local: AtomicU32::new(0),
            outbound,
            _dispatcher: dispatcher,
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    /// Allocates a chain for a local collection.
    pub fn allocate_local(&self) -> LocalId {
        let id = self.next_local.fetch_add(1, Ordering::Relaxed);
        self.locals.lock().insert(id, Arc::new(BufferChain::new()));
        id
    }

    /// Allocates the next channel id and reserves its receive state.
    ///
    /// `ordered` channels stage inbound blocks per sender and merge them in
    /// rank order once every sender has closed, giving scatter its
    /// deterministic global order.
    pub fn allocate_channel(&self, ordered: bool) -> ChannelId {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        self.mux
            .allocate(id, ordered)
            .expect("freshly minted channel id was already allocated");
        id
    }

    /// A typed emitter appending to a local collection. Closing it closes
    /// the collection's chain.
    pub fn local_emitter<T: Codec>(&self, id: LocalId) -> Result<Emitter<T>> {
        let chain = self.local_chain(id)?;
        Ok(Emitter::new(EmitterDest::Chain(chain)))
    }

    /// One typed emitter per destination rank for a channel.
    ///
    /// The emitter at this worker's own rank loops blocks back through the
    /// multiplexer; the others frame blocks for the dispatcher.
    pub fn channel_emitters<T: Codec>(&self, id: ChannelId) -> Result<Vec<Emitter<T>>> {
        if !self.mux.is_allocated(id) {
            return Err(Error::Protocol(format!("channel {id} is not allocated")));
        }
        Ok((0..self.peers)
            .map(|dst| {
                if dst == self.my_rank {
                    Emitter::new(EmitterDest::Loopback {
                        mux: Arc::clone(&self.mux),
                        channel: id,
                    })
                } else {
                    Emitter::new(EmitterDest::Network {
                        queue: self.outbound.clone(),
                        channel: id,
                        src: self.my_rank,
                        dst,
                    })
                }
            })
            .collect())
    }

    /// A typed iterator over a channel's receive chain.
    pub fn iterator<T: Codec>(&self, id: ChannelId) -> Result<ChainIterator<T>> {
        let chain = self
            .mux
            .chain(id)
            .ok_or_else(|| Error::Protocol(format!("channel {id} is not allocated")))?;
        Ok(ChainIterator::new(chain))
    }

    /// Redistributes a closed local collection across the group.
    ///
    /// `offsets[j]` is the prefix of the local sequence through the portion
    /// destined for rank `j`, so rank `j` receives the elements in
    /// `[offsets[j-1], offsets[j])`. Blocks fully inside a range are passed
    /// through by reference; a block straddling a boundary is cut at the
    /// element boundary found by walking its records, yielding sub-views of
    /// the same storage. Every rank receives this worker's end-of-stream
    /// marker exactly once, including ranks with an empty range and this
    /// worker itself.
    pub fn scatter<T: Codec>(
        &self,
        src: LocalId,
        dst: ChannelId,
        offsets: &[usize],
    ) -> Result<()> {
        if offsets.len() != self.peers {
            return Err(Error::Invariant("scatter needs one offset per rank"));
        }
        let chain = self.local_chain(src)?;
        if !chain.is_closed() {
            return Err(Error::Invariant("scatter source must be closed"));
        }
        let blocks = chain.snapshot();
        let total = blocks.last().map_or(0, |e| e.element_count);
        if offsets.last().is_some_and(|&last| last > total) {
            return Err(Error::Invariant("scatter offsets exceed the source size"));
        }

        let mut previous = 0;
        for (rank, &offset) in offsets.iter().enumerate() {
            if offset < previous {
                return Err(Error::Invariant("scatter offsets must be non-decreasing"));
            }
            let parts = cut_range::<T>(&blocks, previous, offset)?;
            previous = offset;

            if rank == self.my_rank {
                for (buffer, elements) in parts {
                    self.mux.on_data(dst, self.my_rank, buffer, elements)?;
                }
                self.mux.on_close(dst, self.my_rank)?;
            } else {
                for (buffer, elements) in parts {
                    let header = FrameHeader::data(
                        dst,
                        self.my_rank as u16,
                        elements as u32,
                        buffer.len() as u32,
                    );
                    send_frame(&self.outbound, rank, header.encode_frame(buffer.as_slice()))?;
                }
                let close = FrameHeader::close(dst, self.my_rank as u16);
                send_frame(&self.outbound, rank, close.encode_frame(&[]))?;
            }
        }
        Ok(())
    }

    fn local_chain(&self, id: LocalId) -> Result<Arc<BufferChain>> {
        self.locals
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("local collection {id} is not allocated")))
    }
}

/// The blocks and sub-blocks covering elements `[lo, hi)` of a chain
/// snapshot, each with its record count.
fn cut_range<T: Codec>(
    blocks: &[BufferChainElement],
    lo: usize,
    hi: usize,
) -> Result<Vec<(BinaryBuffer, usize)>> {
    let mut parts = Vec::new();
    let mut begin = 0;
    for element in blocks {
        let end = element.element_count;
        if end <= lo {
            begin = end;
            continue;
        }
        if begin >= hi {
            break;
        }
        let take_lo = lo.max(begin);
        let take_hi = hi.min(end);
        if take_lo == begin && take_hi == end {
            parts.push((element.buffer.clone(), end - begin));
        } else {
            let mut reader = BufferReader::new(element.buffer.clone());
            for _ in begin..take_lo {
                T::skip(&mut reader)?;
            }
            let byte_lo = reader.cursor();
            for _ in take_lo..take_hi {
                T::skip(&mut reader)?;
            }
            let byte_hi = reader.cursor();
            parts.push((element.buffer.slice(byte_lo..byte_hi), take_hi - take_lo));
        }
        begin = end;
    }
    Ok(parts)
}
