//! File-backed block store.
//!
//! Positioned I/O through `std::os::unix::fs::FileExt`; no shared seek
//! position, so a single handle serves every caller behind the
//! coordinator's lock.

use crate::{BlockStore, ChainReader, ChainWriter, LoadResult, StoreHeader};
use cogstore_error::{CacheError, Result};
use cogstore_types::{BlockId, CHAIN_LINK_SIZE, FILE_HEADER_SIZE, FORMAT_VERSION, MIN_BLOCK_SIZE};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Block store over a single on-disk file.
#[derive(Debug)]
pub struct FileBlockStore {
    block_size: u64,
    file: Option<File>,
    path: PathBuf,
    /// Allocation watermark; ids in `[0, block_count)` have been handed out.
    block_count: u64,
    /// Anchor of the metadata chain.
    meta_block: BlockId,
    /// Head of the persisted free-list chain.
    free_list_head: BlockId,
    /// Currently deallocated ids, lowest first.
    free_list: BTreeSet<BlockId>,
}

impl FileBlockStore {
    pub fn new(block_size: u64) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "block size {block_size} is below the minimum of {MIN_BLOCK_SIZE} bytes"
            )));
        }
        Ok(Self {
            block_size,
            file: None,
            path: PathBuf::new(),
            block_count: 0,
            meta_block: BlockId::INVALID,
            free_list_head: BlockId::INVALID,
            free_list: BTreeSet::new(),
        })
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(CacheError::NotOpen)
    }

    fn block_offset(&self, id: BlockId) -> Result<u64> {
        self.validate_block_id(id)?;
        let index = id.0 as u64;
        index
            .checked_mul(self.block_size)
            .and_then(|offset| offset.checked_add(FILE_HEADER_SIZE))
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!("block offset overflows for id {id}"))
            })
    }

    fn validate_block_id(&self, id: BlockId) -> Result<()> {
        if id == BlockId::INVALID {
            return Err(CacheError::InvalidArgument(
                "block id is the invalid sentinel".to_owned(),
            ));
        }
        if id.0 < 0 {
            return Err(CacheError::InvalidArgument(format!(
                "block id {id} is negative"
            )));
        }
        if id.0 as u64 >= self.block_count {
            return Err(CacheError::InvalidArgument(format!(
                "block id {id} is at or above the watermark {}",
                self.block_count
            )));
        }
        Ok(())
    }

    fn current_header(&self) -> StoreHeader {
        StoreHeader {
            version: FORMAT_VERSION,
            meta_block: self.meta_block,
            free_list: self.free_list_head,
            block_count: self.block_count,
            block_size: self.block_size,
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.current_header();
        let file = self.file()?;
        file.write_all_at(&header.encode(), 0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Persist the free set through a fresh chain, reclaiming the previous
    /// chain first.
    ///
    /// Writing the chain consumes free ids itself, so the chain length is a
    /// fixed point: reserve the lowest free ids one at a time until the
    /// blocks needed for the *remaining* set no longer exceed the
    /// reservation. Only then is the set serialized; the persisted list is
    /// exactly the in-memory set after the reservation.
    fn save_free_list(&mut self) -> Result<()> {
        let old_head = self.free_list_head;
        self.free_list_head = BlockId::INVALID;
        if old_head.is_valid() {
            let reclaimed = self.mark_chain_free(old_head)?;
            trace!(
                target: "cogstore::store",
                event = "free_list_chain_reclaimed",
                blocks = reclaimed
            );
        }

        if self.free_list.is_empty() {
            return Ok(());
        }

        let payload = self.block_size as usize - CHAIN_LINK_SIZE;
        let mut chain = vec![self.alloc_block()?];
        loop {
            let stream_len = 8 + 8 * self.free_list.len();
            let needed = stream_len.div_ceil(payload);
            if chain.len() >= needed {
                break;
            }
            chain.push(self.alloc_block()?);
        }

        let head = chain[0];
        let ids: Vec<i64> = self.free_list.iter().map(|id| id.0).collect();
        let mut writer = ChainWriter::with_reserved(self, chain)?;
        writer.write_u64(ids.len() as u64)?;
        for id in &ids {
            writer.write_i64(*id)?;
        }
        writer.finish()?;

        self.free_list_head = head;
        Ok(())
    }

    fn load_free_list(&mut self) -> Result<()> {
        self.free_list.clear();
        let head = self.free_list_head;
        if !head.is_valid() {
            return Ok(());
        }

        let mut ids = Vec::new();
        let mut reader = ChainReader::new(self, head)?;
        let count = reader.read_u64()?;
        for _ in 0..count {
            ids.push(reader.read_i64()?);
        }
        drop(reader);

        self.free_list = ids.into_iter().map(BlockId).collect();
        Ok(())
    }

    fn reset_state(&mut self) {
        self.block_count = 0;
        self.meta_block = BlockId::INVALID;
        self.free_list_head = BlockId::INVALID;
        self.free_list.clear();
        self.file = None;
        self.path = PathBuf::new();
    }
}

impl BlockStore for FileBlockStore {
    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn meta_block_id(&self) -> BlockId {
        self.meta_block
    }

    fn meta_block(&mut self) -> Result<BlockId> {
        if self.meta_block.is_valid() {
            return Ok(self.meta_block);
        }

        let anchor = self.alloc_block()?;
        // Write the anchor as an empty terminated chain so a flush that
        // fails between here and the metadata rewrite still leaves a
        // walkable chain on disk.
        let writer = ChainWriter::new(self, anchor)?;
        writer.finish()?;
        self.meta_block = anchor;
        Ok(anchor)
    }

    fn load_or_create(&mut self, path: &Path) -> Result<(StoreHeader, LoadResult)> {
        if path.exists() {
            Ok((self.load_existing(path)?, LoadResult::LoadedExisting))
        } else {
            Ok((self.create_new(path)?, LoadResult::CreatedNew))
        }
    }

    fn create_new(&mut self, path: &Path) -> Result<StoreHeader> {
        self.close()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        self.file = Some(file);
        self.path = path.to_path_buf();
        self.write_header()?;

        debug!(
            target: "cogstore::store",
            event = "created",
            path = %path.display(),
            block_size = self.block_size
        );
        Ok(self.current_header())
    }

    fn load_existing(&mut self, path: &Path) -> Result<StoreHeader> {
        self.close()?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_bytes = [0_u8; StoreHeader::ENCODED_LEN];
        file.read_exact_at(&mut header_bytes, 0)?;
        let header = StoreHeader::decode(&header_bytes)?;

        if header.block_size != self.block_size {
            return Err(CacheError::Format(format!(
                "cannot open block storage with a different block size: \
                 configured {}, file has {}",
                self.block_size, header.block_size
            )));
        }

        self.file = Some(file);
        self.path = path.to_path_buf();
        self.block_count = header.block_count;
        self.meta_block = header.meta_block;
        self.free_list_head = header.free_list;
        self.load_free_list()?;

        debug!(
            target: "cogstore::store",
            event = "loaded",
            path = %path.display(),
            version = header.version,
            block_count = self.block_count,
            free_blocks = self.free_list.len()
        );
        Ok(header)
    }

    fn close(&mut self) -> Result<()> {
        let flush_result = if self.is_open() {
            self.flush()
        } else {
            Ok(())
        };
        self.reset_state();
        flush_result
    }

    fn clear(&mut self) -> Result<()> {
        let was_open = self.is_open();
        let path = std::mem::take(&mut self.path);
        self.reset_state();

        if was_open && path.exists() {
            std::fs::remove_file(&path)?;
            debug!(
                target: "cogstore::store",
                event = "cleared",
                path = %path.display()
            );
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?;
        self.save_free_list()?;
        self.write_header()
    }

    fn alloc_block(&mut self) -> Result<BlockId> {
        if let Some(id) = self.free_list.pop_first() {
            return Ok(id);
        }
        let id = i64::try_from(self.block_count).map_err(|_| {
            CacheError::Format("block watermark exceeds the id space".to_owned())
        })?;
        self.block_count += 1;
        Ok(BlockId(id))
    }

    fn store_block(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        let offset = self.block_offset(id)?;
        if data.len() as u64 != self.block_size {
            return Err(CacheError::InvalidArgument(format!(
                "store of {} bytes into blocks of {}",
                data.len(),
                self.block_size
            )));
        }
        self.file()?.write_all_at(data, offset)?;
        Ok(())
    }

    fn retrieve_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        let offset = self.block_offset(id)?;
        if buf.len() as u64 != self.block_size {
            return Err(CacheError::InvalidArgument(format!(
                "retrieve of {} bytes from blocks of {}",
                buf.len(),
                self.block_size
            )));
        }
        self.file()?.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn mark_free(&mut self, id: BlockId) -> Result<()> {
        self.validate_block_id(id)?;
        // Double free is a silent no-op.
        self.free_list.insert(id);
        Ok(())
    }

    fn free_list(&self) -> Vec<BlockId> {
        self.free_list.iter().copied().collect()
    }
}
