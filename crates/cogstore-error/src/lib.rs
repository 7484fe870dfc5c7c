#![forbid(unsafe_code)]
//! Error types for cogstore.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace. Corruption is recovered locally by the coordinator and rarely
//! reaches callers; the remaining variants surface at API boundaries.

use thiserror::Error;

/// Unified error type for all cogstore operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("store is not open")]
    NotOpen,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache is busy: {0}")]
    Busy(String),

    #[error("corrupt block {block}: {detail}")]
    Corruption { block: i64, detail: String },
}

impl CacheError {
    /// Whether the error leaves coordinator state untouched and the call may
    /// simply be retried later (active readers draining, path in use).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
