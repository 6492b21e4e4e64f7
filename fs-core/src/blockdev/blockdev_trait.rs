//! The storage contract the extent log is written against
//!
//! The log treats its backing store as persistent memory addressed in
//! 4 KiB blocks. Every write that returns `Ok` has reached media. A write
//! that returns an error, including a simulated power cut, may or may not
//! have landed, but never lands torn: whole-block writes and sub-block
//! updates through `write_at` are each all-or-nothing. The log's commit
//! points (a page link, an inode record) are single `write_at` calls of
//! at most 16 bytes and rely on exactly this.

use std::io;
use thiserror::Error;

/// Size of a log page and of a data block
pub const BLOCK_SIZE: usize = 4096;

/// Failures reported by a [`BlockDevice`]
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Block number at or beyond [`BlockDevice::block_count`]
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    /// Whole-block transfer with a buffer that is not one block long
    #[error("Buffer of {0} bytes is not one block (expected {BLOCK_SIZE})")]
    InvalidBlockSize(usize),
    /// Sub-block update running past the end of its block
    #[error("Write of {len} bytes at offset {offset} crosses the block boundary")]
    InvalidRange { offset: usize, len: usize },
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is closed")]
    DeviceClosed,
    /// The device lost power; this write and every later one was dropped
    #[error("Simulated power loss: write to block {0} was dropped")]
    PowerLoss(u64),
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Byte-addressable persistent storage exposed as numbered blocks.
///
/// Block 0 belongs to the volume header, so the log can use 0 as its null
/// page pointer. Implementations are shared between tasks behind an `Arc`
/// and do their own locking.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Copy block `block_num` into `buf` (one block long). Blocks never
    /// written read back as zeroes.
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Durably replace block `block_num` with `data` (one block long)
    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Durably overwrite `data.len()` bytes of a block from `offset`,
    /// leaving the rest of the block untouched.
    ///
    /// The provided version rewrites the whole block, which keeps it as
    /// atomic as `write_block`. It is not safe against a concurrent update
    /// of the same block; callers sharing a block serialise on their side.
    async fn write_at(&self, block_num: u64, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidRange {
                offset,
                len: data.len(),
            });
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        self.read_block(block_num, &mut block).await?;
        block[offset..offset + data.len()].copy_from_slice(data);
        self.write_block(block_num, &block).await
    }

    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Flush anything the backend still holds in host buffers
    async fn sync(&self) -> Result<()>;

    /// Release the backend. Later calls fail with `DeviceClosed`.
    async fn close(&self) -> Result<()>;

    /// Whether writes are refused
    fn is_read_only(&self) -> bool {
        false
    }
}
