#![forbid(unsafe_code)]
//! Core types shared across the cogstore workspace.
//!
//! Defines the block identifier and timestamp newtypes, the on-disk format
//! constants, and bounds-checked little-endian codec helpers used by the
//! header and metadata decoders.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic bytes at offset 0 of a block cache file.
pub const MAGIC_BYTES: [u8; 8] = *b"COGBSTOR";

/// Format version emitted by the write path.
pub const FORMAT_VERSION: u32 = 3;

/// Oldest format version the read path accepts.
pub const MIN_FORMAT_VERSION: u32 = 1;

/// Reserved header region at the start of the backing file. Block 0 begins
/// at this offset regardless of block size.
pub const FILE_HEADER_SIZE: u64 = 4096;

/// Smallest allowed block size. Below this a chained block cannot hold its
/// own next-pointer plus any payload worth speaking of.
pub const MIN_BLOCK_SIZE: u64 = 16;

/// Default block size used by embedders; a policy choice, not a store
/// constraint.
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 20;

/// Size of the next-block-id prefix of a chained block.
pub const CHAIN_LINK_SIZE: usize = 8;

/// Identifier of a block in the backing file.
///
/// Ids are dense and start at 0. The sentinel [`BlockId::INVALID`] denotes
/// "no block" (end of chain, unset header pointer, missing mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub i64);

impl BlockId {
    pub const INVALID: Self = Self(-1);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since the Unix epoch.
///
/// The epoch value itself is the "unknown" sentinel: underlying file systems
/// that cannot report a modification time yield [`Timestamp::UNKNOWN`], and
/// freshness checks fall back to size comparison.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const UNKNOWN: Self = Self(0);

    pub const MICROS_PER_SEC: i64 = 1_000_000;

    #[must_use]
    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Build from whole seconds (the legacy serialized field).
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(Self::MICROS_PER_SEC))
    }

    /// Truncate to whole seconds for the legacy serialized field.
    #[must_use]
    pub fn as_secs(self) -> i64 {
        self.0 / Self::MICROS_PER_SEC
    }

    /// Convert a wall-clock time, mapping pre-epoch or out-of-range values to
    /// [`Timestamp::UNKNOWN`].
    #[must_use]
    pub fn from_system_time(time: std::time::SystemTime) -> Self {
        let Ok(since_epoch) = time.duration_since(std::time::UNIX_EPOCH) else {
            return Self::UNKNOWN;
        };
        i64::try_from(since_epoch.as_micros()).map_or(Self::UNKNOWN, Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 8], actual: [u8; 8] },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
