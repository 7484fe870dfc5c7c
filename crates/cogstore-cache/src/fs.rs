//! Virtual file system glue.
//!
//! The cache sits in front of any file system that can serve positioned
//! reads and report basic attributes; that seam is the [`UnderlyingFile`] /
//! [`UnderlyingFileSystem`] pair. [`CacheFileSystem`] recognizes paths
//! carrying the scheme prefix and opens either a caching handle or, when the
//! cache is disabled, a direct passthrough to the underlying source.

use crate::cache::Cache;
use crate::handle::CachingFile;
use crate::params::CacheParams;
use cogstore_error::Result;
use cogstore_types::Timestamp;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::debug;

/// URI prefix that routes a path through the cache.
pub const SCHEME_PREFIX: &str = "cogstore://";

#[must_use]
pub fn can_handle(path: &str) -> bool {
    path.starts_with(SCHEME_PREFIX)
}

/// The path as the underlying file system understands it.
#[must_use]
pub fn strip_scheme(path: &str) -> &str {
    path.strip_prefix(SCHEME_PREFIX).unwrap_or(path)
}

/// One open file on the underlying (slow) file system.
pub trait UnderlyingFile: Send {
    /// Positioned read; short reads at EOF are allowed.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn file_size(&mut self) -> Result<u64>;

    /// Modification time, or [`Timestamp::UNKNOWN`] when the file system
    /// cannot report one.
    fn last_modified(&mut self) -> Result<Timestamp>;
}

/// Factory for read handles on the underlying file system.
pub trait UnderlyingFileSystem: Send + Sync {
    fn open_read(&self, path: &str) -> Result<Box<dyn UnderlyingFile>>;
}

/// Local disk as the underlying source.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl UnderlyingFileSystem for LocalFileSystem {
    fn open_read(&self, path: &str) -> Result<Box<dyn UnderlyingFile>> {
        let file = File::open(path)?;
        Ok(Box::new(LocalFile { file }))
    }
}

struct LocalFile {
    file: File,
}

impl UnderlyingFile for LocalFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn last_modified(&mut self) -> Result<Timestamp> {
        let modified = self
            .file
            .metadata()?
            .modified()
            .map(Timestamp::from_system_time)
            .unwrap_or(Timestamp::UNKNOWN);
        Ok(modified)
    }
}

/// Handle returned by [`CacheFileSystem::open`].
pub enum FileHandle {
    /// Reads go through the block cache.
    Cached(CachingFile),
    /// Cache disabled: reads go straight to the underlying file system.
    Direct(Box<dyn UnderlyingFile>),
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cached(_) => f.write_str("FileHandle::Cached(..)"),
            Self::Direct(_) => f.write_str("FileHandle::Direct(..)"),
        }
    }
}

impl FileHandle {
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Self::Cached(handle) => handle.read_at(buf, offset),
            Self::Direct(file) => file.read_at(buf, offset),
        }
    }

    pub fn file_size(&mut self) -> Result<u64> {
        match self {
            Self::Cached(handle) => handle.file_size(),
            Self::Direct(file) => file.file_size(),
        }
    }

    pub fn last_modified(&mut self) -> Result<Timestamp> {
        match self {
            Self::Cached(handle) => handle.last_modified(),
            Self::Direct(file) => file.last_modified(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Self::Cached(handle) => handle.close(),
            Self::Direct(_) => Ok(()),
        }
    }
}

/// Routes scheme-prefixed paths between the cache and the underlying file
/// system.
pub struct CacheFileSystem {
    cache: Arc<Cache>,
    underlying: Arc<dyn UnderlyingFileSystem>,
}

impl CacheFileSystem {
    pub fn new(cache: Arc<Cache>, underlying: Arc<dyn UnderlyingFileSystem>) -> Self {
        Self { cache, underlying }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Open `path` under the current parameters. Lazily opens the
    /// coordinator against the configured cache file and applies the size
    /// budget on every open, so parameter changes take effect for new
    /// handles.
    pub fn open(&self, path: &str, params: &CacheParams) -> Result<FileHandle> {
        if !params.cache_enabled {
            debug!(
                target: "cogstore::fs",
                event = "passthrough_open",
                path
            );
            let file = self.underlying.open_read(strip_scheme(path))?;
            return Ok(FileHandle::Direct(file));
        }

        if !self.cache.is_open() {
            self.cache.open(&params.cache_path)?;
        }
        self.cache.set_max_cache_size(params.cache_size)?;

        let handle = CachingFile::open(
            Arc::clone(&self.cache),
            Arc::clone(&self.underlying),
            path,
            params.data_mutable,
        )?;
        Ok(FileHandle::Cached(handle))
    }
}
