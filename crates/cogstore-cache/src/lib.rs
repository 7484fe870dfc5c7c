#![forbid(unsafe_code)]
//! Read-through block cache.
//!
//! The [`Cache`] coordinator binds the block store and the metadata manager
//! behind one mutex and exposes the public cache contract: open/close/clear,
//! block store/retrieve with checksum verification, per-file eviction, and
//! durable flush. [`CachingFile`] is the per-open read path that decomposes
//! ranged reads into block-aligned fetch-or-fill steps, and
//! [`CacheFileSystem`] routes scheme-prefixed paths between the cache and
//! the underlying file system.

mod cache;
mod fs;
mod handle;
mod params;

pub use cache::{block_checksum, Cache};
pub use fs::{
    can_handle, strip_scheme, CacheFileSystem, FileHandle, LocalFileSystem, UnderlyingFile,
    UnderlyingFileSystem, SCHEME_PREFIX,
};
pub use handle::CachingFile;
pub use params::{
    apply_cache_path, apply_cache_size, clear_cache, evict_files, CacheParams, DEFAULT_CACHE_PATH,
    DEFAULT_CACHE_SIZE,
};
