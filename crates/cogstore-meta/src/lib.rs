#![forbid(unsafe_code)]
//! In-memory cache metadata.
//!
//! Maps `(source path, block index)` pairs to stored block ids, tracks
//! per-file size and modification time, and keeps the LRU order that drives
//! eviction. The whole state serializes through a chained block stream with
//! an explicit version so it survives restarts; readers accept any version
//! up to the current one and fill missing fields with their unknown
//! sentinels.

use cogstore_error::{CacheError, Result};
use cogstore_store::{BlockStore, ChainReader, ChainWriter};
use cogstore_types::{BlockId, Timestamp, FORMAT_VERSION, MIN_FORMAT_VERSION};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Paths longer than this in a serialized image are treated as corruption.
const MAX_SERIALIZED_PATH_LEN: u32 = u16::MAX as u32;

/// Identity of a cached block: which file, which block-aligned slice of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub path: String,
    pub index: i64,
}

/// Location and integrity record of one cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_index: i64,
    pub block_id: BlockId,
    pub checksum: u64,
}

/// Cached attributes of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_size: u64,
    pub last_modified: Timestamp,
    pub blocks: BTreeMap<BlockId, BlockInfo>,
}

impl FileMetadata {
    fn write_to<S: BlockStore + ?Sized>(&self, writer: &mut ChainWriter<'_, S>) -> Result<()> {
        writer.write_u64(self.file_size)?;
        let n_blocks = u32::try_from(self.blocks.len()).map_err(|_| {
            CacheError::Format("file has more blocks than the format can describe".to_owned())
        })?;
        writer.write_u32(n_blocks)?;
        for info in self.blocks.values() {
            writer.write_i64(info.block_index)?;
            writer.write_i64(info.block_id.0)?;
            writer.write_u64(info.checksum)?;
        }
        // Legacy whole-seconds field kept for version 2 readers, then the
        // native microsecond timestamp.
        writer.write_i64(self.last_modified.as_secs())?;
        writer.write_i64(self.last_modified.0)?;
        Ok(())
    }

    fn read_from<S: BlockStore + ?Sized>(
        reader: &mut ChainReader<'_, S>,
        version: u32,
    ) -> Result<Self> {
        let mut out = Self {
            file_size: reader.read_u64()?,
            ..Self::default()
        };

        let n_blocks = reader.read_u32()?;
        for _ in 0..n_blocks {
            let block_index = reader.read_i64()?;
            let block_id = BlockId(reader.read_i64()?);
            let checksum = reader.read_u64()?;
            out.blocks.insert(
                block_id,
                BlockInfo {
                    block_index,
                    block_id,
                    checksum,
                },
            );
        }

        if version >= 2 {
            let legacy_secs = reader.read_i64()?;
            if legacy_secs != 0 {
                out.last_modified = Timestamp::from_secs(legacy_secs);
            }
        }
        if version >= 3 {
            out.last_modified = Timestamp(reader.read_i64()?);
        }

        Ok(out)
    }
}

/// The cache's in-memory index set.
///
/// Invariants held between public calls: `block_mapping` and
/// `reverse_mapping` are mutual inverses, every reverse-mapped id belongs to
/// exactly one file entry, every LRU-tracked id is reverse-mapped, and the
/// LRU never exceeds `max_cache_blocks` on exit from the eviction loop.
pub struct MetadataManager {
    block_mapping: HashMap<BlockKey, BlockId>,
    reverse_mapping: HashMap<BlockId, BlockKey>,
    files: BTreeMap<String, FileMetadata>,
    lru: LruCache<BlockId, ()>,
    max_cache_blocks: u64,
}

impl Default for MetadataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_mapping: HashMap::new(),
            reverse_mapping: HashMap::new(),
            files: BTreeMap::new(),
            lru: LruCache::unbounded(),
            max_cache_blocks: u64::MAX,
        }
    }

    pub fn clear(&mut self) {
        self.block_mapping.clear();
        self.reverse_mapping.clear();
        self.files.clear();
        self.lru.clear();
    }

    /// Stored block id for `(path, index)`, or the invalid sentinel.
    #[must_use]
    pub fn block_id(&self, path: &str, index: i64) -> BlockId {
        let key = BlockKey {
            path: path.to_owned(),
            index,
        };
        self.block_mapping
            .get(&key)
            .copied()
            .unwrap_or(BlockId::INVALID)
    }

    /// Insert (or refresh) a block in every index. Re-registering an id
    /// already mapped to the same key updates its checksum in place.
    pub fn register_block(&mut self, path: &str, index: i64, id: BlockId, checksum: u64) {
        let key = BlockKey {
            path: path.to_owned(),
            index,
        };
        self.reverse_mapping.insert(id, key.clone());
        self.block_mapping.insert(key, id);

        let entry = self.files.entry(path.to_owned()).or_default();
        entry.blocks.insert(
            id,
            BlockInfo {
                block_index: index,
                block_id: id,
                checksum,
            },
        );
    }

    /// Remove a block from every index; a file entry whose last block goes
    /// away is dropped entirely. Unknown ids are a no-op.
    pub fn unregister_block(&mut self, id: BlockId) {
        if let Some(key) = self.reverse_mapping.remove(&id) {
            if let Some(file) = self.files.get_mut(&key.path) {
                file.blocks.remove(&id);
                if file.blocks.is_empty() {
                    self.files.remove(&key.path);
                }
            }
            self.block_mapping.remove(&key);
        }

        self.lru.pop(&id);
    }

    pub fn set_file_size(&mut self, path: &str, size: u64) {
        self.files.entry(path.to_owned()).or_default().file_size = size;
    }

    pub fn set_file_last_modified(&mut self, path: &str, timestamp: Timestamp) {
        self.files.entry(path.to_owned()).or_default().last_modified = timestamp;
    }

    #[must_use]
    pub fn file_metadata(&self, path: &str) -> Option<&FileMetadata> {
        self.files.get(path)
    }

    #[must_use]
    pub fn block_info(&self, path: &str, id: BlockId) -> Option<BlockInfo> {
        self.files
            .get(path)
            .and_then(|file| file.blocks.get(&id))
            .copied()
    }

    /// Move `id` to the most-recent end, inserting it if untracked.
    pub fn update_lru(&mut self, id: BlockId) {
        self.lru.put(id, ());
    }

    /// Pop least-recent blocks until the LRU fits the capacity, handing each
    /// id to `free` so the store can reclaim it.
    pub fn evict_while_over_capacity(
        &mut self,
        free: &mut dyn FnMut(BlockId) -> Result<()>,
    ) -> Result<()> {
        while self.lru.len() as u64 > self.max_cache_blocks {
            let Some((id, ())) = self.lru.pop_lru() else {
                break;
            };
            trace!(target: "cogstore::meta", event = "evict_lru", block_id = %id);
            free(id)?;
            self.unregister_block(id);
        }
        Ok(())
    }

    pub fn set_max_cache_size(&mut self, max_blocks: u64) {
        self.max_cache_blocks = max_blocks;
    }

    #[must_use]
    pub fn max_cache_blocks(&self) -> u64 {
        self.max_cache_blocks
    }

    /// Number of blocks currently under LRU tracking.
    #[must_use]
    pub fn cached_block_count(&self) -> usize {
        self.lru.len()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileMetadata)> {
        self.files.iter().map(|(path, md)| (path.as_str(), md))
    }

    /// Block keys in LRU order, most recent first. Ids without a reverse
    /// mapping are skipped.
    #[must_use]
    pub fn lru_state(&self) -> Vec<BlockKey> {
        self.lru
            .iter()
            .filter_map(|(id, _)| self.reverse_mapping.get(id).cloned())
            .collect()
    }

    /// Block ids in LRU order, most recent first.
    #[must_use]
    pub fn lru_block_ids(&self) -> Vec<BlockId> {
        self.lru.iter().map(|(id, _)| *id).collect()
    }

    /// Serialize the full manager state. The layout is the current format
    /// version; older readers are not a target.
    pub fn write_to<S: BlockStore + ?Sized>(&self, writer: &mut ChainWriter<'_, S>) -> Result<()> {
        writer.write_u64(self.files.len() as u64)?;
        for (path, metadata) in &self.files {
            let path_len = u32::try_from(path.len()).map_err(|_| {
                CacheError::Format(format!("path too long to serialize: {} bytes", path.len()))
            })?;
            writer.write_u32(path_len)?;
            writer.write_data(path.as_bytes())?;
            metadata.write_to(writer)?;
        }

        writer.write_u64(self.lru.len() as u64)?;
        for (id, _) in self.lru.iter() {
            writer.write_i64(id.0)?;
        }

        debug!(
            target: "cogstore::meta",
            event = "serialized",
            files = self.files.len(),
            lru_blocks = self.lru.len()
        );
        Ok(())
    }

    /// Replace this manager's state with a serialized image written at
    /// `version`. Migration is read-only: a v1 image yields unknown
    /// timestamps, a v2 image promotes the legacy seconds field.
    pub fn read_from<S: BlockStore + ?Sized>(
        &mut self,
        reader: &mut ChainReader<'_, S>,
        version: u32,
    ) -> Result<()> {
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(CacheError::Format(format!(
                "unsupported metadata version {version}"
            )));
        }

        self.clear();

        let n_files = reader.read_u64()?;
        for _ in 0..n_files {
            let path_len = reader.read_u32()?;
            if path_len > MAX_SERIALIZED_PATH_LEN {
                return Err(CacheError::Format(format!(
                    "implausible serialized path length {path_len}"
                )));
            }
            let mut path_bytes = vec![0_u8; path_len as usize];
            reader.read_exact(&mut path_bytes)?;
            let path = String::from_utf8(path_bytes).map_err(|_| {
                CacheError::Format("serialized path is not valid UTF-8".to_owned())
            })?;

            let metadata = FileMetadata::read_from(reader, version)?;
            for info in metadata.blocks.values() {
                let key = BlockKey {
                    path: path.clone(),
                    index: info.block_index,
                };
                self.block_mapping.insert(key.clone(), info.block_id);
                self.reverse_mapping.insert(info.block_id, key);
            }
            self.files.insert(path, metadata);
        }

        let lru_len = reader.read_u64()?;
        let mut ids = Vec::with_capacity(usize::try_from(lru_len).unwrap_or(0));
        for _ in 0..lru_len {
            ids.push(BlockId(reader.read_i64()?));
        }
        // The stream is most-recent-first; replaying it backwards restores
        // the exact order.
        for id in ids.iter().rev() {
            self.lru.put(*id, ());
        }

        debug!(
            target: "cogstore::meta",
            event = "deserialized",
            version,
            files = self.files.len(),
            lru_blocks = self.lru.len()
        );
        Ok(())
    }
}
