//! Streaming views over linked chains of blocks.
//!
//! A chained block's first 8 bytes hold the id of the next block in the
//! chain, little-endian; [`BlockId::INVALID`] terminates. The remaining
//! `block_size - 8` bytes are payload. The metadata image and the free list
//! are both persisted through these streams.
//!
//! The next-pointer is decoded explicitly from the byte buffer rather than
//! by reinterpreting it as a header struct, so the payload stays a plain
//! byte array end to end.

use crate::BlockStore;
use cogstore_error::{CacheError, Result};
use cogstore_types::{read_le_i64, BlockId, CHAIN_LINK_SIZE};
use std::collections::VecDeque;

fn chain_buffer(block_size: u64) -> Result<Vec<u8>> {
    let block_size = usize::try_from(block_size)
        .map_err(|_| CacheError::Format("block size does not fit usize".to_owned()))?;
    // Fresh chain buffers are 0xFF-filled; the first 8 bytes then decode as
    // the INVALID terminator without further initialization.
    Ok(vec![0xFF_u8; block_size])
}

/// Forward reader over a chain of blocks.
pub struct ChainReader<'a, S: BlockStore + ?Sized> {
    store: &'a mut S,
    buf: Vec<u8>,
    offset: usize,
    visited: Vec<BlockId>,
}

impl<'a, S: BlockStore + ?Sized> ChainReader<'a, S> {
    /// Position a reader at `start`. An invalid `start` yields an empty
    /// stream.
    pub fn new(store: &'a mut S, start: BlockId) -> Result<Self> {
        let buf = chain_buffer(store.block_size())?;
        let offset = buf.len();
        let mut reader = Self {
            store,
            buf,
            offset,
            visited: Vec::new(),
        };
        if start.is_valid() {
            reader.load_block(start)?;
        }
        Ok(reader)
    }

    fn load_block(&mut self, id: BlockId) -> Result<()> {
        self.store.retrieve_block(id, &mut self.buf)?;
        self.offset = CHAIN_LINK_SIZE;
        self.visited.push(id);
        Ok(())
    }

    /// Id of the block following the one currently buffered.
    #[must_use]
    pub fn next_block_id(&self) -> BlockId {
        read_le_i64(&self.buf, 0).map_or(BlockId::INVALID, BlockId)
    }

    /// Ordered ids of every block read so far.
    #[must_use]
    pub fn visited(&self) -> &[BlockId] {
        &self.visited
    }

    /// Copy up to `out.len()` payload bytes, following chain links as blocks
    /// are exhausted. Returns the number of bytes read; a short count means
    /// the chain ended.
    pub fn read_data(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut copied = 0_usize;
        while copied < out.len() {
            if self.offset >= self.buf.len() {
                let next = self.next_block_id();
                if !next.is_valid() {
                    break;
                }
                if self.visited.len() as u64 >= self.store.block_count() {
                    return Err(CacheError::Format(
                        "block chain contains a cycle".to_owned(),
                    ));
                }
                self.load_block(next)?;
            }

            let available = self.buf.len() - self.offset;
            let chunk = (out.len() - copied).min(available);
            out[copied..copied + chunk].copy_from_slice(&self.buf[self.offset..self.offset + chunk]);
            copied += chunk;
            self.offset += chunk;
        }
        Ok(copied)
    }

    /// Fill `out` exactly, failing with a format error on a truncated chain.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let got = self.read_data(out)?;
        if got != out.len() {
            return Err(CacheError::Format(format!(
                "block chain ended early: wanted {} bytes, got {got}",
                out.len()
            )));
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = [0_u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut bytes = [0_u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(i64::from_le_bytes(bytes))
    }
}

/// Appending writer over a chain of blocks.
///
/// Rooted either at an existing anchor block (continuation blocks are
/// allocated from the store on demand) or over a pre-reserved block list
/// (no allocation happens while writing; the free-list save path depends on
/// this to keep the serialized set stable).
///
/// Call [`ChainWriter::finish`] to write the terminator and flush the last
/// block; dropping an unfinished writer discards buffered bytes.
#[derive(Debug)]
pub struct ChainWriter<'a, S: BlockStore + ?Sized> {
    store: &'a mut S,
    current: BlockId,
    buf: Vec<u8>,
    offset: usize,
    used: Vec<BlockId>,
    reserved: VecDeque<BlockId>,
    allocates: bool,
}

impl<'a, S: BlockStore + ?Sized> ChainWriter<'a, S> {
    /// Writer rooted at `anchor`, allocating continuation blocks on demand.
    pub fn new(store: &'a mut S, anchor: BlockId) -> Result<Self> {
        if !anchor.is_valid() {
            return Err(CacheError::InvalidArgument(
                "chain writer requires a valid anchor block".to_owned(),
            ));
        }
        let buf = chain_buffer(store.block_size())?;
        Ok(Self {
            store,
            current: anchor,
            buf,
            offset: CHAIN_LINK_SIZE,
            used: vec![anchor],
            reserved: VecDeque::new(),
            allocates: true,
        })
    }

    /// Writer over pre-reserved blocks, in order. Writing past the
    /// reservation is a format error.
    pub fn with_reserved(store: &'a mut S, blocks: Vec<BlockId>) -> Result<Self> {
        let mut blocks: VecDeque<BlockId> = blocks.into();
        let Some(head) = blocks.pop_front() else {
            return Err(CacheError::InvalidArgument(
                "chain writer requires at least one reserved block".to_owned(),
            ));
        };
        let buf = chain_buffer(store.block_size())?;
        Ok(Self {
            store,
            current: head,
            buf,
            offset: CHAIN_LINK_SIZE,
            used: vec![head],
            reserved: blocks,
            allocates: false,
        })
    }

    fn set_next(&mut self, id: BlockId) {
        self.buf[..CHAIN_LINK_SIZE].copy_from_slice(&id.0.to_le_bytes());
    }

    fn flush_current(&mut self) -> Result<()> {
        self.store.store_block(self.current, &self.buf)
    }

    fn roll_over(&mut self) -> Result<()> {
        let next = if self.allocates {
            self.store.alloc_block()?
        } else {
            self.reserved.pop_front().ok_or_else(|| {
                CacheError::Format("reserved block chain exhausted while writing".to_owned())
            })?
        };

        self.set_next(next);
        self.flush_current()?;

        self.buf.fill(0xFF);
        self.offset = CHAIN_LINK_SIZE;
        self.current = next;
        self.used.push(next);
        Ok(())
    }

    /// Append `bytes`, spilling into new chain blocks as the current block
    /// fills.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        let mut written = 0_usize;
        while written < bytes.len() {
            if self.offset >= self.buf.len() {
                self.roll_over()?;
            }
            let space = self.buf.len() - self.offset;
            let chunk = (bytes.len() - written).min(space);
            self.buf[self.offset..self.offset + chunk]
                .copy_from_slice(&bytes[written..written + chunk]);
            written += chunk;
            self.offset += chunk;
        }
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    /// Write the terminator, flush the final block, and return the ordered
    /// ids the chain occupies.
    pub fn finish(mut self) -> Result<Vec<BlockId>> {
        self.set_next(BlockId::INVALID);
        self.flush_current()?;
        Ok(self.used)
    }
}
