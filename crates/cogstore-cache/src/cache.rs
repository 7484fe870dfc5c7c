//! Cache coordinator.
//!
//! One instance per process owns the block store and the metadata manager
//! exclusively. Every public method takes the coordinator mutex for its
//! whole duration, so operations are linearizable; the active-reader count
//! is the only piece of state outside the lock, and it alone gates `close`
//! and `clear`.

use cogstore_error::{CacheError, Result};
use cogstore_meta::{BlockKey, FileMetadata, MetadataManager};
use cogstore_store::{BlockStore, ChainReader, ChainWriter, FileBlockStore, LoadResult};
use cogstore_types::{BlockId, Timestamp, MIN_BLOCK_SIZE};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Checksum recorded for every stored block and verified on retrieval.
#[must_use]
pub fn block_checksum(data: &[u8]) -> u64 {
    xxh3_64(data)
}

struct CacheInner {
    opened: bool,
    /// Mutation counter since the last durable flush; any nonzero value
    /// means the on-disk image is stale.
    dirty: u64,
    path: String,
    store: Box<dyn BlockStore>,
    meta: MetadataManager,
}

impl CacheInner {
    fn set_dirty(&mut self) {
        self.dirty = self.dirty.saturating_add(1);
    }

    fn clear_dirty(&mut self) {
        self.dirty = 0;
    }

    fn is_dirty(&self) -> bool {
        self.dirty > 0
    }

    fn flush(&mut self) -> Result<()> {
        if !self.opened || !self.is_dirty() {
            return Ok(());
        }

        let Self { store, meta, .. } = self;
        let store = &mut **store;

        // The anchor block stays put across flushes; only its successors are
        // reclaimed before the chain is rewritten.
        let anchor = store.meta_block()?;
        let stale_chain = ChainReader::new(store, anchor)?.next_block_id();
        store.mark_chain_free(stale_chain)?;

        let mut writer = ChainWriter::new(store, anchor)?;
        meta.write_to(&mut writer)?;
        writer.finish()?;

        store.flush()?;

        debug!(
            target: "cogstore::cache",
            event = "flushed",
            mutations = self.dirty,
            files = self.meta.file_count(),
            blocks = self.meta.cached_block_count()
        );
        self.clear_dirty();
        Ok(())
    }

    fn evict_over_capacity(&mut self) -> Result<()> {
        let Self { store, meta, .. } = self;
        meta.evict_while_over_capacity(&mut |id| store.mark_free(id))
    }
}

/// The process-wide read-through block cache.
pub struct Cache {
    block_size: u64,
    active_readers: AtomicI64,
    inner: Mutex<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("block_size", &self.block_size)
            .field("active_readers", &self.active_readers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Coordinator over a file-backed store. Does not touch disk until
    /// [`Cache::open`].
    pub fn new(block_size: u64) -> Result<Self> {
        Self::with_parts(block_size, None, None)
    }

    /// Coordinator over caller-supplied parts; used by tests to inject
    /// fault-carrying stores or pre-seeded metadata.
    pub fn with_parts(
        block_size: u64,
        store: Option<Box<dyn BlockStore>>,
        meta: Option<MetadataManager>,
    ) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "block size {block_size} is below the minimum of {MIN_BLOCK_SIZE} bytes"
            )));
        }

        let store = match store {
            Some(store) => store,
            None => Box::new(FileBlockStore::new(block_size)?),
        };
        if store.block_size() != block_size {
            return Err(CacheError::InvalidArgument(format!(
                "store block size {} does not match cache block size {block_size}",
                store.block_size()
            )));
        }

        Ok(Self {
            block_size,
            active_readers: AtomicI64::new(0),
            inner: Mutex::new(CacheInner {
                opened: false,
                dirty: 0,
                path: String::new(),
                store,
                meta: meta.unwrap_or_default(),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().opened
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.inner.lock().path.clone()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().is_dirty()
    }

    pub fn add_ref(&self) {
        self.active_readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_ref(&self) {
        self.active_readers.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn active_readers(&self) -> i64 {
        self.active_readers.load(Ordering::Acquire)
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        if self.active_readers() != 0 {
            return Err(CacheError::Busy(format!(
                "cache is in use; wait for running readers to finish before {operation}"
            )));
        }
        Ok(())
    }

    /// Open (or create) the backing file. A no-op when already open; an
    /// empty path is rejected.
    pub fn open(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened {
            return Ok(());
        }
        if path.is_empty() {
            return Err(CacheError::InvalidArgument(
                "cache path cannot be empty".to_owned(),
            ));
        }

        let (header, load_result) = inner.store.load_or_create(Path::new(path))?;

        if load_result == LoadResult::LoadedExisting && header.meta_block.is_valid() {
            let CacheInner { store, meta, .. } = &mut *inner;
            let mut reader = ChainReader::new(&mut **store, header.meta_block)?;
            if let Err(err) = meta.read_from(&mut reader, header.version) {
                drop(reader);
                let _ = inner.store.close();
                return Err(err);
            }
        }

        inner.path = path.to_owned();
        inner.opened = true;
        inner.set_dirty();

        debug!(
            target: "cogstore::cache",
            event = "opened",
            path,
            existing = load_result == LoadResult::LoadedExisting,
            files = inner.meta.file_count()
        );
        Ok(())
    }

    /// Flush and release everything. Refuses while readers are active.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.opened {
            return Ok(());
        }
        self.ensure_idle("closing the cache")?;

        inner.flush()?;
        inner.store.close()?;
        inner.meta.clear();
        inner.opened = false;
        inner.path.clear();
        inner.clear_dirty();

        debug!(target: "cogstore::cache", event = "closed");
        Ok(())
    }

    /// Drop all state and delete the backing file without flushing.
    /// Refuses while readers are active. The coordinator can be reopened
    /// afterwards.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened {
            self.ensure_idle("clearing the cache")?;
            inner.store.clear()?;
            inner.meta.clear();
            inner.opened = false;
            debug!(target: "cogstore::cache", event = "cleared");
        }
        inner.clear_dirty();
        Ok(())
    }

    /// Release every cached block of `path`. Unknown paths are a no-op.
    pub fn evict(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();

        let ids: Vec<BlockId> = match inner.meta.file_metadata(path) {
            Some(metadata) => metadata.blocks.keys().copied().collect(),
            None => return Ok(()),
        };

        let mut evicted = false;
        for id in ids {
            inner.meta.unregister_block(id);
            inner.store.mark_free(id)?;
            evicted = true;
        }
        if evicted {
            inner.set_dirty();
            debug!(target: "cogstore::cache", event = "evicted_file", path);
        }
        Ok(())
    }

    /// Cache one block of a source file. Re-storing a known `(path, index)`
    /// overwrites in place and refreshes the recorded checksum.
    pub fn store_block(&self, path: &str, index: i64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.opened {
            return Err(CacheError::NotOpen);
        }
        if data.len() as u64 != self.block_size {
            return Err(CacheError::InvalidArgument(format!(
                "store of {} bytes into a cache with {}-byte blocks",
                data.len(),
                self.block_size
            )));
        }

        let checksum = block_checksum(data);
        let existing = inner.meta.block_id(path, index);
        let id = if existing.is_valid() {
            existing
        } else {
            inner.store.alloc_block()?
        };

        if let Err(err) = inner.store.store_block(id, data) {
            if !existing.is_valid() {
                // Return the unused allocation so the id is not orphaned.
                let _ = inner.store.mark_free(id);
                inner.set_dirty();
            }
            return Err(err);
        }

        inner.meta.register_block(path, index, id, checksum);
        inner.meta.update_lru(id);
        inner.evict_over_capacity()?;
        inner.set_dirty();
        Ok(())
    }

    /// Fetch a cached block into `out`. Returns `false` on a miss.
    ///
    /// A checksum mismatch is treated as a miss: the block is freed, its
    /// metadata dropped, and the cache marked dirty so the repaired state
    /// reaches disk on the next flush.
    pub fn retrieve_block(&self, path: &str, index: i64, out: &mut [u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.opened {
            return Err(CacheError::NotOpen);
        }
        if out.len() as u64 != self.block_size {
            return Err(CacheError::InvalidArgument(format!(
                "retrieve of {} bytes from a cache with {}-byte blocks",
                out.len(),
                self.block_size
            )));
        }

        let id = inner.meta.block_id(path, index);
        if !id.is_valid() {
            return Ok(false);
        }
        let info = inner.meta.block_info(path, id).ok_or_else(|| {
            CacheError::Format(format!("block {id} is mapped but has no metadata record"))
        })?;

        inner.meta.update_lru(id);
        inner.store.retrieve_block(id, out)?;

        let computed = block_checksum(out);
        if computed != info.checksum {
            warn!(
                target: "cogstore::cache",
                event = "checksum_mismatch",
                path,
                block_index = index,
                block_id = %id,
                expected = info.checksum,
                computed
            );
            inner.store.mark_free(id)?;
            inner.meta.unregister_block(id);
            inner.set_dirty();
            return Ok(false);
        }

        inner.set_dirty();
        Ok(true)
    }

    pub fn store_file_size(&self, path: &str, size: u64) {
        let mut inner = self.inner.lock();
        inner.meta.set_file_size(path, size);
        inner.set_dirty();
    }

    pub fn store_file_last_modified(&self, path: &str, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        inner.meta.set_file_last_modified(path, timestamp);
        inner.set_dirty();
    }

    #[must_use]
    pub fn retrieve_file_metadata(&self, path: &str) -> Option<FileMetadata> {
        self.inner.lock().meta.file_metadata(path).cloned()
    }

    /// Resize the cache, evicting immediately when shrinking. The byte
    /// budget converts to blocks by ceiling division.
    pub fn set_max_cache_size(&self, bytes: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let blocks = bytes.div_ceil(self.block_size);
        inner.meta.set_max_cache_size(blocks);
        inner.evict_over_capacity()?;
        inner.set_dirty();
        Ok(())
    }

    /// Persist the metadata chain, free list, and header if anything
    /// changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Ascending snapshot of the store's free list.
    #[must_use]
    pub fn free_list(&self) -> Vec<BlockId> {
        self.inner.lock().store.free_list()
    }

    /// Store allocation watermark.
    #[must_use]
    pub fn store_block_count(&self) -> u64 {
        self.inner.lock().store.block_count()
    }

    /// Number of blocks under LRU tracking.
    #[must_use]
    pub fn cached_block_count(&self) -> usize {
        self.inner.lock().meta.cached_block_count()
    }

    /// LRU-ordered block keys, most recent first.
    #[must_use]
    pub fn lru_state(&self) -> Vec<BlockKey> {
        self.inner.lock().meta.lru_state()
    }

    /// LRU-ordered block ids, most recent first.
    #[must_use]
    pub fn lru_block_ids(&self) -> Vec<BlockId> {
        self.inner.lock().meta.lru_block_ids()
    }

    /// Snapshot of every file entry, path-ordered.
    #[must_use]
    pub fn files_snapshot(&self) -> Vec<(String, FileMetadata)> {
        self.inner
            .lock()
            .meta
            .files()
            .map(|(path, metadata)| (path.to_owned(), metadata.clone()))
            .collect()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Readers hold an Arc to the cache, so by the time the coordinator
        // drops there are none left; flush what we can.
        let inner = self.inner.get_mut();
        let _ = inner.flush();
        let _ = inner.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BLOCK_SIZE: u64 = 1024;

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    #[test]
    fn construction_rejects_tiny_blocks() {
        assert!(Cache::new(MIN_BLOCK_SIZE - 1).unwrap_err().is_invalid_argument());
        assert!(Cache::new(MIN_BLOCK_SIZE).is_ok());
    }

    #[test]
    fn open_rejects_empty_path() {
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        assert!(cache.open("").unwrap_err().is_invalid_argument());
        assert!(!cache.is_open());
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("cache.bin");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache.open(path.to_str().expect("utf-8 path")).expect("open");
        cache.open("ignored-while-open").expect("reopen");
        assert_eq!(cache.path(), path.to_str().expect("utf-8 path"));
    }

    #[test]
    fn blocks_round_trip_through_the_coordinator() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache
            .open(dir.path().join("cache.bin").to_str().expect("path"))
            .expect("open");

        cache.store_block("f", 0, &block(0xAA)).expect("store");
        let mut out = block(0);
        assert!(cache.retrieve_block("f", 0, &mut out).expect("retrieve"));
        assert_eq!(out, block(0xAA));
        assert!(!cache.retrieve_block("f", 1, &mut out).expect("miss"));
    }

    #[test]
    fn store_and_retrieve_validate_buffer_length() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache
            .open(dir.path().join("cache.bin").to_str().expect("path"))
            .expect("open");

        assert!(cache
            .store_block("f", 0, &[0_u8; 10])
            .unwrap_err()
            .is_invalid_argument());
        let mut short = [0_u8; 10];
        assert!(cache
            .retrieve_block("f", 0, &mut short)
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn operations_against_a_closed_coordinator_fail() {
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        let err = cache.store_block("f", 0, &block(1)).unwrap_err();
        assert!(matches!(err, CacheError::NotOpen));
        let mut out = block(0);
        let err = cache.retrieve_block("f", 0, &mut out).unwrap_err();
        assert!(matches!(err, CacheError::NotOpen));
    }

    #[test]
    fn restoring_a_block_refreshes_its_checksum() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache
            .open(dir.path().join("cache.bin").to_str().expect("path"))
            .expect("open");

        cache.store_block("f", 0, &block(1)).expect("store");
        cache.store_block("f", 0, &block(2)).expect("overwrite");

        // Still one block, and the overwrite verifies cleanly.
        assert_eq!(cache.cached_block_count(), 1);
        let mut out = block(0);
        assert!(cache.retrieve_block("f", 0, &mut out).expect("retrieve"));
        assert_eq!(out, block(2));
    }

    #[test]
    fn evict_releases_every_block_of_a_path() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache
            .open(dir.path().join("cache.bin").to_str().expect("path"))
            .expect("open");

        for index in 0..4 {
            cache.store_block("f", index, &block(9)).expect("store");
        }
        cache.store_block("g", 0, &block(7)).expect("store");

        cache.evict("f").expect("evict");
        let mut out = block(0);
        for index in 0..4 {
            assert!(!cache.retrieve_block("f", index, &mut out).expect("miss"));
        }
        assert!(cache.retrieve_block("g", 0, &mut out).expect("hit"));
        assert_eq!(cache.free_list().len(), 4);

        // Unknown paths are a no-op.
        cache.evict("nothing-here").expect("noop");
    }

    #[test]
    fn busy_refusals_leave_state_unchanged() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");
        cache
            .open(dir.path().join("cache.bin").to_str().expect("path"))
            .expect("open");
        cache.store_block("f", 0, &block(1)).expect("store");

        cache.add_ref();
        assert!(cache.close().unwrap_err().is_busy());
        assert!(cache.clear().unwrap_err().is_busy());
        assert!(cache.is_open());

        cache.remove_ref();
        cache.close().expect("close");
        assert!(!cache.is_open());
    }

    #[test]
    fn open_after_clear_succeeds() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("cache.bin");
        let path = path.to_str().expect("path");
        let cache = Cache::new(BLOCK_SIZE).expect("cache");

        cache.open(path).expect("open");
        cache.store_block("f", 0, &block(1)).expect("store");
        cache.clear().expect("clear");
        assert!(!cache.is_open());

        cache.open(path).expect("reopen");
        let mut out = block(0);
        assert!(!cache.retrieve_block("f", 0, &mut out).expect("cold"));
    }
}
