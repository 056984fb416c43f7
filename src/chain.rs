//! Ordered, append-only sequences of immutable blocks.
//!
//! A [`BufferChain`] is the local receive state of a channel: blocks are
//! appended by emitters or the multiplexer and consumed by iterators.
//! Readers address blocks by index, so a snapshot taken before an append
//! stays valid while the chain grows underneath it.

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

use crate::buffer::{BinaryBuffer, BinaryBufferBuilder};
use crate::error::{Error, Result};

/// One block of a chain together with its position in the element count.
///
/// `element_count` is the prefix sum of record counts through and including
/// this block, which makes chain size O(1) and lets range lookups binary
/// search instead of scanning.
#[derive(Clone, Debug)]
pub struct BufferChainElement {
    /// The immutable bytes of this block.
    pub buffer: BinaryBuffer,
    /// Records in the chain up to and including this block.
    pub element_count: usize,
    /// Byte offset of the first complete record. Must be zero; reserved for
    /// sliced records.
    pub offset_of_first: usize,
}

impl BufferChainElement {
    /// A new element whose first record starts at offset zero.
    pub fn new(buffer: BinaryBuffer, element_count: usize) -> Self {
        BufferChainElement { buffer, element_count, offset_of_first: 0 }
    }

    /// A new element with an explicit first-record offset.
    ///
    /// Non-zero offsets are reserved and rejected.
    pub fn with_offset(
        buffer: BinaryBuffer,
        element_count: usize,
        offset_of_first: usize,
    ) -> Result<Self> {
        if offset_of_first != 0 {
            return Err(Error::Invariant("offset_of_first must be zero"));
        }
        Ok(BufferChainElement { buffer, element_count, offset_of_first })
    }
}

#[derive(Default)]
struct ChainState {
    elements: Vec<BufferChainElement>,
    closed: bool,
    failed: bool,
}

impl ChainState {
    fn size(&self) -> usize {
        self.elements.last().map_or(0, |e| e.element_count)
    }
}

/// An append-only sequence of blocks with a closed flag.
///
/// One mutex and one condition variable guard all state. Appends are O(1)
/// and never copy block bytes.
#[derive(Default)]
pub struct BufferChain {
    state: Mutex<ChainState>,
    signal: Condvar,
}

impl BufferChain {
    /// A new, open, empty chain.
    pub fn new() -> Self {
        BufferChain::default()
    }

    /// Seals the builder's bytes into a block and appends it, detaching the
    /// builder for reuse. Wakes all waiters. Appending to a closed chain is
    /// refused.
    pub fn append_builder(&self, builder: &mut BinaryBufferBuilder) -> Result<()> {
        let elements = builder.elements();
        let buffer = builder.detach();
        self.append_buffer(buffer, elements)
    }

    /// Appends a sealed buffer holding `elements` records, computing the
    /// cumulative count from the current chain size.
    pub fn append_buffer(&self, buffer: BinaryBuffer, elements: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let cumulative = state.size() + elements;
        state.elements.push(BufferChainElement::new(buffer, cumulative));
        self.signal.notify_all();
        Ok(())
    }

    /// Appends an element whose cumulative count the caller has already
    /// computed. Used when transcribing staged blocks in sender order.
    pub fn append_element(&self, element: BufferChainElement) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        debug_assert!(element.element_count >= state.size());
        state.elements.push(element);
        self.signal.notify_all();
        Ok(())
    }

    /// Blocks until any append, close or failure notification.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        self.signal.wait(&mut state);
    }

    /// Blocks until the chain is closed. Returns immediately if it already
    /// is.
    pub fn wait_until_closed(&self) {
        let mut state = self.state.lock();
        while !state.closed {
            self.signal.wait(&mut state);
        }
    }

    /// Marks the chain closed and wakes all waiters. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.signal.notify_all();
    }

    /// Closes the chain with the error flag set, waking all waiters.
    ///
    /// Iterators over a failed chain drain what arrived and then report
    /// finished with [`is_failed`](BufferChain::is_failed) raised.
    pub fn fail(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.failed = true;
        self.signal.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Cumulative record count of the last block, or 0 if empty.
    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    /// Number of blocks currently in the chain.
    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().elements.is_empty()
    }

    /// The block at `index`, if one exists yet. Cloning shares the bytes.
    pub fn element(&self, index: usize) -> Option<BufferChainElement> {
        self.state.lock().elements.get(index).cloned()
    }

    /// A snapshot of all blocks currently present.
    pub fn snapshot(&self) -> Vec<BufferChainElement> {
        self.state.lock().elements.clone()
    }

    /// Releases every block. Callers must ensure no iterator still reads
    /// the chain.
    pub fn delete_all(&self) {
        self.state.lock().elements.clear();
    }
}

/// Staging area keyed by sender rank.
///
/// Blocks from each sender are kept in flush order; `merge_into` transcribes
/// all of them, ranks ascending, into a target chain in one step. Counts are
/// stored per block here and become prefix sums during the merge.
#[derive(Default)]
pub struct OrderedBufferChain {
    staged: Mutex<BTreeMap<usize, Vec<StagedBlock>>>,
}

struct StagedBlock {
    buffer: BinaryBuffer,
    elements: usize,
}

impl OrderedBufferChain {
    pub fn new() -> Self {
        OrderedBufferChain::default()
    }

    /// Stages a sealed buffer holding `elements` records from `rank`.
    pub fn append(&self, rank: usize, buffer: BinaryBuffer, elements: usize) {
        self.staged
            .lock()
            .entry(rank)
            .or_default()
            .push(StagedBlock { buffer, elements });
    }

    pub fn is_empty(&self) -> bool {
        self.staged.lock().is_empty()
    }

    /// Moves every staged block into `target`, ranks ascending, recomputing
    /// cumulative element counts on top of the target's current size.
    ///
    /// Callers must ensure no concurrent append to `target`, or the
    /// recomputed counts would interleave with foreign blocks.
    pub fn merge_into(&self, target: &BufferChain) -> Result<()> {
        let mut staged = self.staged.lock();
        let mut cumulative = target.size();
        for (_rank, blocks) in std::mem::take(&mut *staged) {
            for block in blocks {
                cumulative += block.elements;
                target.append_element(BufferChainElement::new(block.buffer, cumulative))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BinaryBufferBuilder;

    fn builder_with(elements: usize) -> BinaryBufferBuilder {
        let mut builder = BinaryBufferBuilder::new();
        for i in 0..elements {
            builder.put_u32(i as u32);
            builder.mark_element();
        }
        builder
    }

    #[test]
    fn cumulative_counts_track_appends() {
        let chain = BufferChain::new();
        chain.append_builder(&mut builder_with(3)).unwrap();
        chain.append_builder(&mut builder_with(2)).unwrap();
        chain.append_builder(&mut builder_with(5)).unwrap();

        assert_eq!(chain.size(), 10);
        assert_eq!(chain.element(0).unwrap().element_count, 3);
        assert_eq!(chain.element(1).unwrap().element_count, 5);
        assert_eq!(chain.element(2).unwrap().element_count, 10);
    }

    #[test]
    fn append_detaches_builder() {
        let chain = BufferChain::new();
        let mut builder = builder_with(4);
        chain.append_builder(&mut builder).unwrap();
        assert!(builder.is_empty());
        assert_eq!(builder.elements(), 0);
    }

    #[test]
    fn close_is_idempotent_and_refuses_appends() {
        let chain = BufferChain::new();
        chain.close();
        chain.close();
        assert!(chain.is_closed());
        assert!(matches!(
            chain.append_builder(&mut builder_with(1)),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn wait_until_closed_returns_after_close() {
        use std::sync::Arc;
        let chain = Arc::new(BufferChain::new());
        let waiter = {
            let chain = Arc::clone(&chain);
            std::thread::spawn(move || chain.wait_until_closed())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        chain.close();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_wakes_on_append() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        let chain = Arc::new(BufferChain::new());
        let stop = Arc::new(AtomicBool::new(false));
        let appender = {
            let chain = Arc::clone(&chain);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                // Keep appending until observed, so a wait never misses its
                // wakeup.
                while !stop.load(Ordering::Acquire) {
                    chain.append_builder(&mut builder_with(1)).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            })
        };
        while chain.is_empty() {
            chain.wait();
        }
        assert!(chain.size() >= 1);
        stop.store(true, Ordering::Release);
        appender.join().unwrap();
    }

    #[test]
    fn merge_orders_by_rank_and_recomputes_counts() {
        let staging = OrderedBufferChain::new();
        // Staged out of rank order.
        staging.append(2, builder_with(1).detach(), 1);
        staging.append(0, builder_with(2).detach(), 2);
        staging.append(0, builder_with(3).detach(), 3);
        staging.append(1, builder_with(4).detach(), 4);

        let target = BufferChain::new();
        target.append_builder(&mut builder_with(5)).unwrap();
        staging.merge_into(&target).unwrap();

        // Rank 0 blocks first in flush order, then rank 1, then rank 2, with
        // prefix sums continuing from the 5 records already present.
        let counts: Vec<usize> =
            target.snapshot().iter().map(|e| e.element_count).collect();
        assert_eq!(counts, vec![5, 7, 10, 14, 15]);
        assert!(staging.is_empty());
    }

    #[test]
    fn nonzero_first_offset_is_rejected() {
        let buffer = builder_with(1).detach();
        assert!(matches!(
            BufferChainElement::with_offset(buffer, 1, 4),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn delete_all_releases_blocks() {
        let chain = BufferChain::new();
        chain.append_builder(&mut builder_with(2)).unwrap();
        chain.delete_all();
        assert_eq!(chain.len(), 0);
        assert_eq!(chain.size(), 0);
    }
}
