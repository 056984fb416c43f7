//! The spill collaborator boundary.
//!
//! Chains keep blocks in memory; when an external paging layer is in play
//! it is reached through [`BlockStore`]. The substrate itself never decides
//! to spill.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::buffer::BinaryBuffer;
use crate::error::{Error, Result};

/// Names a block previously written to a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    length: u32,
}

/// Writes blocks out of memory and reads them back.
pub trait BlockStore {
    /// Persists `bytes` and returns a handle naming them.
    fn write_block(&mut self, bytes: &[u8]) -> Result<BlockHandle>;

    /// Reads the block named by `handle` back into memory.
    fn read_block(&mut self, handle: BlockHandle) -> Result<BinaryBuffer>;

    /// Releases the block named by `handle`.
    fn remove(&mut self, handle: BlockHandle) -> Result<()>;
}

/// A [`BlockStore`] appending regions to one file.
///
/// Regions are allocated at a high-water mark. Space is reclaimed only when
/// the store is empty, which matches how exchange blocks die: a chain's
/// blocks are released together.
pub struct FileBlockStore {
    file: File,
    end: u64,
    live: usize,
}

impl FileBlockStore {
    /// Opens (and truncates) the backing file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileBlockStore { file, end: 0, live: 0 })
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl BlockStore for FileBlockStore {
    fn write_block(&mut self, bytes: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle { offset: self.end, length: bytes.len() as u32 };
        self.file.seek(SeekFrom::Start(handle.offset))?;
        self.file.write_all(bytes)?;
        self.end += bytes.len() as u64;
        self.live += 1;
        debug!(offset = handle.offset, bytes = bytes.len(), "block spilled");
        Ok(handle)
    }

    fn read_block(&mut self, handle: BlockHandle) -> Result<BinaryBuffer> {
        self.file.seek(SeekFrom::Start(handle.offset))?;
        let mut bytes = vec![0u8; handle.length as usize];
        self.file.read_exact(&mut bytes)?;
        Ok(BinaryBuffer::from_vec(bytes))
    }

    fn remove(&mut self, _handle: BlockHandle) -> Result<()> {
        if self.live == 0 {
            return Err(Error::Invariant("remove on an empty block store"));
        }
        self.live -= 1;
        if self.live == 0 {
            // Last block gone, give the space back.
            self.file.set_len(0)?;
            self.end = 0;
        }
        Ok(())
    }
}
