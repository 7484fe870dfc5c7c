//! Cache tunables and management operations.
//!
//! Four parameters govern the cache. All are process-global except
//! `data_mutable`, which callers may vary per open. Reconfiguration rules:
//! changing the path closes the coordinator first (refused while readers are
//! active); shrinking the size evicts immediately; disabling the cache only
//! affects new opens.

use crate::cache::Cache;
use cogstore_error::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CACHE_PATH: &str = "/tmp/cogstore_block_cache.bin";

/// 2 GiB.
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheParams {
    /// Master switch. When off, opens bypass the cache entirely.
    pub cache_enabled: bool,
    /// Maximum cache size in bytes.
    pub cache_size: u64,
    /// Backing file location.
    pub cache_path: String,
    /// When false, open-time freshness checks are skipped.
    pub data_mutable: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_path: DEFAULT_CACHE_PATH.to_owned(),
            data_mutable: true,
        }
    }
}

/// Adopt a new backing file path.
///
/// A no-op when the path is unchanged. Otherwise the coordinator is closed
/// first; a `Busy` refusal leaves both the coordinator and the parameters
/// untouched.
pub fn apply_cache_path(cache: &Cache, params: &mut CacheParams, path: &str) -> Result<()> {
    if params.cache_path == path {
        return Ok(());
    }
    cache.close()?;
    params.cache_path = path.to_owned();
    Ok(())
}

/// Adopt a new size budget, evicting immediately if it shrank.
pub fn apply_cache_size(cache: &Cache, params: &mut CacheParams, bytes: u64) -> Result<()> {
    cache.set_max_cache_size(bytes)?;
    params.cache_size = bytes;
    Ok(())
}

/// Management entry point: open the cache if needed and clear it, deleting
/// the backing file. Internal failures are reported as `false` rather than
/// propagated.
#[must_use]
pub fn clear_cache(cache: &Cache, params: &CacheParams) -> bool {
    let outcome = cache
        .open(&params.cache_path)
        .and_then(|()| cache.clear());
    match outcome {
        Ok(()) => true,
        Err(err) => {
            warn!(
                target: "cogstore::cache",
                event = "clear_cache_failed",
                error = %err
            );
            false
        }
    }
}

/// Management entry point: evict every listed source path. The list may be
/// empty; paths must carry the scheme prefix to match their cache keys.
/// Per-path failures are reported collectively as `false`.
#[must_use]
pub fn evict_files<S: AsRef<str>>(cache: &Cache, paths: &[S]) -> bool {
    let mut success = true;
    for path in paths {
        if let Err(err) = cache.evict(path.as_ref()) {
            warn!(
                target: "cogstore::cache",
                event = "evict_failed",
                path = path.as_ref(),
                error = %err
            );
            success = false;
        }
    }
    success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let params = CacheParams::default();
        assert!(!params.cache_enabled);
        assert_eq!(params.cache_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(params.cache_path, DEFAULT_CACHE_PATH);
        assert!(params.data_mutable);
    }

    #[test]
    fn params_deserialize_with_partial_input() {
        let params: CacheParams =
            serde_json::from_str(r#"{"cache_enabled": true, "cache_size": 4096}"#).expect("parse");
        assert!(params.cache_enabled);
        assert_eq!(params.cache_size, 4096);
        assert_eq!(params.cache_path, DEFAULT_CACHE_PATH);
        assert!(params.data_mutable);
    }
}
