//! Worker-to-worker block exchange for distributed batch dataflow.
//!
//! Workers cooperate in a group of `N` ranks connected pairwise by byte
//! streams. Producers serialize records through a typed [`Emitter`] into
//! immutable blocks; blocks land in an append-only [`BufferChain`] on the
//! receiving side, either directly (local traffic) or framed over the wire
//! and routed by channel id through the [`Multiplexer`]. Consumers decode
//! records back out of a chain with a typed [`ChainIterator`], which blocks
//! only when asked to drain. [`Manager::scatter`] redistributes a local
//! collection so that each rank receives a contiguous range of it, in an
//! order that is deterministic given each sender's order.
//!
//! Per-sender delivery is FIFO on every channel; across senders no order is
//! implied unless the channel is ordered. Every sender marks end-of-stream
//! per channel, and a receiver's iterator finishes once all `N` markers have
//! arrived and the chain is drained.
//!
//! # Examples
//!
//! Two in-process workers swapping one record each:
//!
//! ```
//! use blockflow::net::execute_local_mock;
//! use blockflow::Manager;
//!
//! let results = execute_local_mock(2, |group| {
//!     let manager = Manager::new(group);
//!     let channel = manager.allocate_channel(false);
//!     let mut emitters = manager.channel_emitters::<u32>(channel).unwrap();
//!
//!     let peer = 1 - manager.my_rank();
//!     emitters[peer].emit(&(manager.my_rank() as u32));
//!     for emitter in &mut emitters {
//!         emitter.close().unwrap();
//!     }
//!
//!     let mut it = manager.iterator::<u32>(channel).unwrap();
//!     it.wait_for_all();
//!     it.next().unwrap()
//! })
//! .unwrap();
//!
//! assert_eq!(results, vec![1, 0]);
//! ```

pub mod buffer;
pub mod chain;
pub mod channel;
pub mod codec;
pub mod emit;
pub mod error;
pub mod iter;
pub mod manager;
pub mod net;
pub mod store;

pub use buffer::{BinaryBuffer, BinaryBufferBuilder, BufferReader, DEFAULT_BLOCK_SIZE};
pub use chain::{BufferChain, BufferChainElement, OrderedBufferChain};
pub use channel::{ChannelId, Multiplexer};
pub use codec::Codec;
pub use emit::Emitter;
pub use error::{Error, Result};
pub use iter::ChainIterator;
pub use manager::{LocalId, Manager};
pub use net::{create_sockets, NetGroup, Stream};

#[cfg(unix)]
pub use net::execute_local_mock;
