#![forbid(unsafe_code)]
//! Single-file block store.
//!
//! The backing file is self-describing: a fixed header region at offset 0
//! carries the magic, format version, the entry points of the metadata and
//! free-list chains, and the allocation watermark. Blocks are packed after
//! the header at `FILE_HEADER_SIZE + id * block_size`.
//!
//! The store is exposed through the [`BlockStore`] trait so the cache
//! coordinator can run against the real [`FileBlockStore`] or a fault-
//! injecting test double.

pub mod chain;
pub mod file;
pub mod header;

pub use chain::{ChainReader, ChainWriter};
pub use file::FileBlockStore;
pub use header::StoreHeader;

use cogstore_error::{CacheError, Result};
use cogstore_types::{read_le_i64, BlockId};
use std::path::Path;

/// Outcome of [`BlockStore::load_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    CreatedNew,
    LoadedExisting,
}

/// Block-granular storage over a single backing file.
///
/// All mutating access is `&mut self`; callers (the cache coordinator)
/// serialize access behind their own lock.
pub trait BlockStore: Send {
    /// Whether a backing file is currently attached.
    fn is_open(&self) -> bool;

    /// Immutable block size of this store.
    fn block_size(&self) -> u64;

    /// Allocation watermark: ids in `[0, block_count)` have been handed out
    /// at least once.
    fn block_count(&self) -> u64;

    /// Current metadata anchor, or [`BlockId::INVALID`] if none exists yet.
    fn meta_block_id(&self) -> BlockId;

    /// First block of the metadata chain, allocating and initializing the
    /// anchor on first use.
    fn meta_block(&mut self) -> Result<BlockId>;

    /// Open the file at `path`, creating it when absent.
    fn load_or_create(&mut self, path: &Path) -> Result<(StoreHeader, LoadResult)>;

    /// Create a fresh backing file. Fails if the file already exists.
    fn create_new(&mut self, path: &Path) -> Result<StoreHeader>;

    /// Open an existing backing file. Fails if the file does not exist or
    /// its header does not match this store's configuration.
    fn load_existing(&mut self, path: &Path) -> Result<StoreHeader>;

    /// Best-effort flush, then release the file handle and reset state.
    fn close(&mut self) -> Result<()>;

    /// Discard in-memory state and delete the backing file without flushing.
    fn clear(&mut self) -> Result<()>;

    /// Persist the free list and rewrite the header, then sync.
    fn flush(&mut self) -> Result<()>;

    /// Allocate a block id: the lowest free id, else a watermark bump.
    /// Never returns [`BlockId::INVALID`].
    fn alloc_block(&mut self) -> Result<BlockId>;

    /// Write a full block. `data.len()` must equal `block_size`.
    fn store_block(&mut self, id: BlockId, data: &[u8]) -> Result<()>;

    /// Read a full block. `buf.len()` must equal `block_size`.
    fn retrieve_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Return a block to the free set. Freeing an already-free block is a
    /// no-op; the invalid sentinel, negative ids, and ids at or above the
    /// watermark are rejected.
    fn mark_free(&mut self, id: BlockId) -> Result<()>;

    /// Ascending snapshot of the free set.
    fn free_list(&self) -> Vec<BlockId>;

    /// Walk a chained-block stream from `start` and free every block
    /// visited. Returns the number of blocks freed.
    fn mark_chain_free(&mut self, start: BlockId) -> Result<usize> {
        let mut id = start;
        let mut freed = 0_usize;
        let block_size = usize::try_from(self.block_size())
            .map_err(|_| CacheError::Format("block size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; block_size];
        while id.is_valid() {
            // A chain longer than the store has ever allocated must cycle.
            if freed as u64 > self.block_count() {
                return Err(CacheError::Format(format!(
                    "block chain starting at {start} contains a cycle"
                )));
            }
            self.retrieve_block(id, &mut buf)?;
            let next = BlockId(
                read_le_i64(&buf, 0).map_err(|err| CacheError::Format(err.to_string()))?,
            );
            self.mark_free(id)?;
            id = next;
            freed += 1;
        }
        Ok(freed)
    }
}
