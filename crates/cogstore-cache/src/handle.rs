//! Per-open caching read path.
//!
//! A handle pins the coordinator through the active-reader count for its
//! whole lifetime, validates freshness for mutable sources at open time, and
//! serves ranged reads by decomposing them into block-aligned fetch-or-fill
//! steps against the cache.

use crate::cache::Cache;
use crate::fs::{strip_scheme, UnderlyingFile, UnderlyingFileSystem};
use cogstore_error::{CacheError, Result};
use cogstore_types::Timestamp;
use std::sync::Arc;
use tracing::debug;

/// Read handle for one scheme-prefixed source path.
pub struct CachingFile {
    cache: Arc<Cache>,
    fs: Arc<dyn UnderlyingFileSystem>,
    /// Prefixed path; the cache key.
    path: String,
    /// Path with the scheme stripped; what the underlying FS opens.
    underlying_path: String,
    /// Opened on the first read or metadata probe.
    underlying: Option<Box<dyn UnderlyingFile>>,
    position: u64,
    closed: bool,
}

impl CachingFile {
    /// Open a caching handle.
    ///
    /// The reader count is incremented before any fallible step and
    /// decremented on every error path, so a failed construction leaves the
    /// coordinator releasable.
    pub fn open(
        cache: Arc<Cache>,
        fs: Arc<dyn UnderlyingFileSystem>,
        path: &str,
        data_mutable: bool,
    ) -> Result<Self> {
        cache.add_ref();

        let mut handle = Self {
            underlying_path: strip_scheme(path).to_owned(),
            path: path.to_owned(),
            cache,
            fs,
            underlying: None,
            position: 0,
            closed: false,
        };

        match handle.validate_freshness(data_mutable) {
            Ok(()) => Ok(handle),
            Err(err) => {
                let _ = handle.close();
                Err(err)
            }
        }
    }

    fn validate_freshness(&mut self, data_mutable: bool) -> Result<()> {
        let Some(cached) = self.cache.retrieve_file_metadata(&self.path) else {
            // First contact with this source: record its attributes.
            let size = self.underlying_size()?;
            let modified = self.underlying_last_modified()?;
            self.cache.store_file_size(&self.path, size);
            self.cache.store_file_last_modified(&self.path, modified);
            return Ok(());
        };

        if !data_mutable {
            return Ok(());
        }

        let modified = self.underlying_last_modified()?;
        let mut changed = cached.last_modified != modified;
        if !changed && modified.is_unknown() {
            // Some file systems cannot report a modification time; fall back
            // to the size, and treat an unknown size of zero as changed.
            let size = self.underlying_size()?;
            changed = cached.file_size != size || size == 0;
        }

        if changed {
            debug!(
                target: "cogstore::fs",
                event = "source_changed",
                path = %self.path
            );
            self.cache.evict(&self.path)?;
            let modified = self.underlying_last_modified()?;
            self.cache.store_file_last_modified(&self.path, modified);
            let size = self.underlying_size()?;
            self.cache.store_file_size(&self.path, size);
        }
        Ok(())
    }

    fn underlying(&mut self) -> Result<&mut (dyn UnderlyingFile + 'static)> {
        if self.underlying.is_none() {
            self.underlying = Some(self.fs.open_read(&self.underlying_path)?);
        }
        self.underlying.as_deref_mut().ok_or(CacheError::NotOpen)
    }

    fn underlying_size(&mut self) -> Result<u64> {
        self.underlying()?.file_size()
    }

    fn underlying_last_modified(&mut self) -> Result<Timestamp> {
        self.underlying()?.last_modified()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(CacheError::NotOpen);
        }
        Ok(())
    }

    /// Source file size, served from cached metadata when present.
    pub fn file_size(&mut self) -> Result<u64> {
        self.ensure_open()?;
        if let Some(metadata) = self.cache.retrieve_file_metadata(&self.path) {
            return Ok(metadata.file_size);
        }
        let size = self.underlying_size()?;
        self.cache.store_file_size(&self.path, size);
        Ok(size)
    }

    /// Source modification time, served from cached metadata when present.
    pub fn last_modified(&mut self) -> Result<Timestamp> {
        self.ensure_open()?;
        if let Some(metadata) = self.cache.retrieve_file_metadata(&self.path) {
            return Ok(metadata.last_modified);
        }
        let modified = self.underlying_last_modified()?;
        self.cache.store_file_last_modified(&self.path, modified);
        Ok(modified)
    }

    /// Read at an explicit offset, moving the cursor past the bytes read.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.position = offset;
        self.read(buf)
    }

    /// Read from the current cursor. Requests past EOF are clamped; each
    /// missing block is fetched block-aligned from the underlying source and
    /// stored before the requested slice is served.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;

        let file_size = self.file_size()?;
        let block_size = self.cache.block_size();
        let mut remaining = (buf.len() as u64).min(file_size.saturating_sub(self.position));
        let mut block_buf = vec![0_u8; block_size as usize];
        let mut copied = 0_usize;

        while remaining > 0 {
            let block_index = i64::try_from(self.position / block_size).map_err(|_| {
                CacheError::InvalidArgument("read offset exceeds the block index space".to_owned())
            })?;
            let block_offset = (self.position % block_size) as usize;
            let chunk = remaining.min(block_size - block_offset as u64) as usize;

            if !self
                .cache
                .retrieve_block(&self.path, block_index, &mut block_buf)?
            {
                let block_start = (block_index as u64) * block_size;
                // The last block of the file is short; only that many bytes
                // exist to fetch.
                let in_file = file_size.saturating_sub(block_start).min(block_size) as usize;
                {
                    let file = self.underlying()?;
                    let mut filled = 0_usize;
                    while filled < in_file {
                        let n = file
                            .read_at(&mut block_buf[filled..in_file], block_start + filled as u64)?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }
                }
                self.cache.store_block(&self.path, block_index, &block_buf)?;
            }

            buf[copied..copied + chunk]
                .copy_from_slice(&block_buf[block_offset..block_offset + chunk]);
            copied += chunk;
            self.position += chunk as u64;
            remaining -= chunk as u64;
        }

        Ok(copied)
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the handle: drop the underlying file, flush the coordinator,
    /// and release the reader count exactly once. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.underlying = None;

        let flush_result = self.cache.flush();
        self.cache.remove_ref();
        flush_result
    }
}

impl Drop for CachingFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
