//! Per-channel routing of inbound blocks.
//!
//! The multiplexer owns one entry per channel id: the target chain, a
//! staging area keyed by sender rank, and the set of senders that have
//! closed. Inbound frames from the dispatcher and loopback traffic from
//! local emitters both land here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer::BinaryBuffer;
use crate::chain::{BufferChain, OrderedBufferChain};
use crate::error::{Error, Result};

/// Identifies a channel. Allocation is a per-worker monotone counter, and
/// workers invoking the same allocation sequence agree on every id.
pub type ChannelId = u32;

/// How long a channel may receive data before the local worker allocates it.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks which senders have delivered their end-of-stream marker.
struct ClosedSenders {
    closed: Vec<bool>,
    remaining: usize,
}

impl ClosedSenders {
    fn new(peers: usize) -> Self {
        ClosedSenders { closed: vec![false; peers], remaining: peers }
    }

    /// Sets the sender's bit. False if it was already set.
    fn set(&mut self, rank: usize) -> bool {
        if self.closed[rank] {
            return false;
        }
        self.closed[rank] = true;
        self.remaining -= 1;
        true
    }

    fn is_set(&self, rank: usize) -> bool {
        self.closed[rank]
    }

    fn all_set(&self) -> bool {
        self.remaining == 0
    }
}

struct ChannelState {
    chain: Arc<BufferChain>,
    staging: OrderedBufferChain,
    closed: ClosedSenders,
    /// True once blocks may bypass staging and append directly.
    direct: bool,
    /// False until the local worker allocates this id.
    adopted: bool,
    created: Instant,
}

impl ChannelState {
    fn new(peers: usize) -> Self {
        ChannelState {
            chain: Arc::new(BufferChain::new()),
            staging: OrderedBufferChain::new(),
            closed: ClosedSenders::new(peers),
            direct: false,
            adopted: false,
            created: Instant::now(),
        }
    }

    /// Merges whatever is staged and closes the chain. A chain that already
    /// failed stays failed; its staged blocks are abandoned.
    fn finish(&mut self) -> Result<()> {
        if self.chain.is_failed() {
            return Ok(());
        }
        self.staging.merge_into(&self.chain)?;
        self.chain.close();
        Ok(())
    }
}

/// Fans inbound blocks into the right chain, by channel id.
pub struct Multiplexer {
    my_rank: usize,
    peers: usize,
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
}

impl Multiplexer {
    pub fn new(my_rank: usize, peers: usize) -> Self {
        Multiplexer { my_rank, peers, channels: Mutex::new(HashMap::new()) }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    /// Reserves entry `id` on the local side.
    ///
    /// Blocks that arrived before allocation were buffered provisionally and
    /// are adopted here: an unordered channel drains its staging right away
    /// and appends directly from then on; an ordered channel keeps staging
    /// until every sender has closed, so the merge is deterministic in
    /// sender rank.
    pub fn allocate(&self, id: ChannelId, ordered: bool) -> Result<()> {
        let mut channels = self.channels.lock();
        let state = channels.entry(id).or_insert_with(|| ChannelState::new(self.peers));
        if state.adopted {
            return Err(Error::Protocol(format!("channel {id} allocated twice")));
        }
        state.adopted = true;
        state.direct = !ordered;
        if !ordered && !state.chain.is_failed() {
            state.staging.merge_into(&state.chain)?;
        }
        if state.closed.all_set() {
            state.finish()?;
        }
        trace!(channel = id, ordered, "channel allocated");
        Ok(())
    }

    /// True if the local worker has allocated `id`.
    pub fn is_allocated(&self, id: ChannelId) -> bool {
        self.channels.lock().get(&id).is_some_and(|s| s.adopted)
    }

    /// The receive chain of an allocated channel.
    pub fn chain(&self, id: ChannelId) -> Option<Arc<BufferChain>> {
        let channels = self.channels.lock();
        channels.get(&id).filter(|s| s.adopted).map(|s| Arc::clone(&s.chain))
    }

    /// Routes one inbound block from `src` into channel `id`.
    pub fn on_data(
        &self,
        id: ChannelId,
        src: usize,
        buffer: BinaryBuffer,
        elements: usize,
    ) -> Result<()> {
        if src >= self.peers {
            return Err(Error::Protocol(format!("data from unknown rank {src}")));
        }
        let mut channels = self.channels.lock();
        let state = channels.entry(id).or_insert_with(|| ChannelState::new(self.peers));
        if state.closed.is_set(src) {
            return Err(Error::Protocol(format!(
                "data on channel {id} from rank {src} after its close"
            )));
        }
        trace!(channel = id, src, elements, bytes = buffer.len(), "block received");
        if state.chain.is_failed() {
            // The channel already errored; late blocks are dropped, not
            // treated as a fault of the connection they came in on.
            return Ok(());
        }
        if state.direct {
            state.chain.append_buffer(buffer, elements)
        } else {
            state.staging.append(src, buffer, elements);
            Ok(())
        }
    }

    /// Records the end-of-stream marker from `src` on channel `id`. When the
    /// last sender closes an adopted channel, staged blocks merge in rank
    /// order and the chain closes.
    pub fn on_close(&self, id: ChannelId, src: usize) -> Result<()> {
        if src >= self.peers {
            return Err(Error::Protocol(format!("close from unknown rank {src}")));
        }
        let mut channels = self.channels.lock();
        let state = channels.entry(id).or_insert_with(|| ChannelState::new(self.peers));
        if !state.closed.set(src) {
            return Err(Error::Protocol(format!(
                "duplicate close on channel {id} from rank {src}"
            )));
        }
        debug!(channel = id, src, "sender closed");
        if state.closed.all_set() && state.adopted {
            state.finish()?;
        }
        Ok(())
    }

    /// Fails every channel still expecting data from `rank`.
    ///
    /// Called when a connection dies. Channels whose sender had already
    /// closed are unaffected.
    pub fn on_peer_lost(&self, rank: usize) {
        let channels = self.channels.lock();
        for (id, state) in channels.iter() {
            if !state.closed.is_set(rank) {
                error!(channel = *id, rank, "peer lost with channel open, failing chain");
                state.chain.fail();
            }
        }
    }

    /// Drops provisional channels that no local allocation claimed within
    /// [`PENDING_TIMEOUT`]. Their data is discarded with an error log.
    pub fn expire_pending(&self) {
        let mut channels = self.channels.lock();
        channels.retain(|id, state| {
            if !state.adopted && state.created.elapsed() > PENDING_TIMEOUT {
                error!(channel = *id, "channel never allocated locally, dropping");
                state.chain.fail();
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BinaryBufferBuilder;

    fn block_of(records: &[u32]) -> (BinaryBuffer, usize) {
        let mut builder = BinaryBufferBuilder::new();
        for r in records {
            builder.put_u32(*r);
            builder.mark_element();
        }
        let elements = builder.elements();
        (builder.detach(), elements)
    }

    #[test]
    fn closes_only_after_every_sender() {
        let mux = Multiplexer::new(0, 3);
        mux.allocate(0, false).unwrap();
        let chain = mux.chain(0).unwrap();

        mux.on_close(0, 0).unwrap();
        mux.on_close(0, 2).unwrap();
        assert!(!chain.is_closed());
        mux.on_close(0, 1).unwrap();
        assert!(chain.is_closed());
    }

    #[test]
    fn data_before_allocation_is_adopted() {
        let mux = Multiplexer::new(0, 2);
        let (buffer, elements) = block_of(&[1, 2, 3]);
        mux.on_data(5, 1, buffer, elements).unwrap();
        assert!(mux.chain(5).is_none());

        mux.allocate(5, false).unwrap();
        let chain = mux.chain(5).unwrap();
        assert_eq!(chain.size(), 3);
    }

    #[test]
    fn ordered_channel_merges_by_rank_at_close() {
        let mux = Multiplexer::new(0, 3);
        mux.allocate(0, true).unwrap();
        let chain = mux.chain(0).unwrap();

        // Arrival order 2, 0, 1; merge order must be 0, 1, 2.
        let (b2, n2) = block_of(&[20]);
        let (b0, n0) = block_of(&[0, 1]);
        let (b1, n1) = block_of(&[10, 11]);
        mux.on_data(0, 2, b2, n2).unwrap();
        mux.on_data(0, 0, b0, n0).unwrap();
        mux.on_data(0, 1, b1, n1).unwrap();
        for rank in 0..3 {
            assert_eq!(chain.len(), 0);
            mux.on_close(0, rank).unwrap();
        }

        let counts: Vec<usize> =
            chain.snapshot().iter().map(|e| e.element_count).collect();
        assert_eq!(counts, vec![2, 4, 5]);
        assert!(chain.is_closed());
    }

    #[test]
    fn duplicate_close_is_a_protocol_error() {
        let mux = Multiplexer::new(0, 2);
        mux.allocate(0, false).unwrap();
        mux.on_close(0, 1).unwrap();
        assert!(matches!(mux.on_close(0, 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn peer_loss_fails_open_channels_only() {
        let mux = Multiplexer::new(0, 2);
        mux.allocate(0, false).unwrap();
        mux.allocate(1, false).unwrap();
        mux.on_close(0, 1).unwrap();

        mux.on_peer_lost(1);
        assert!(!mux.chain(0).unwrap().is_failed());
        assert!(mux.chain(1).unwrap().is_failed());
    }
}
