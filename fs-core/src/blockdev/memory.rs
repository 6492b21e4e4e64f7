//! In-memory block device standing in for a persistent-memory region.
//!
//! Every accepted write is immediately "durable": it lands in the backing
//! map and survives as long as the device does. Power loss is simulated
//! with a write budget. Once the budget is spent, every further write is
//! dropped and fails with [`BlockDeviceError::PowerLoss`], so the device
//! contents freeze at exactly the state media would hold after the crash.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

const UNLIMITED: u64 = u64::MAX;

/// Sparse in-memory block device with crash injection
pub struct MemBlockDevice {
    blocks: RwLock<HashMap<u64, Box<[u8; BLOCK_SIZE]>>>,
    block_count: u64,
    /// Remaining writes before the simulated crash
    budget: AtomicU64,
    writes: AtomicU64,
    crashed: AtomicBool,
    closed: AtomicBool,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `block_count` blocks
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            block_count,
            budget: AtomicU64::new(UNLIMITED),
            writes: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Allow `writes` more writes to reach media, then lose power.
    pub fn crash_after(&self, writes: u64) {
        self.crashed.store(false, Ordering::SeqCst);
        self.budget.store(writes, Ordering::SeqCst);
    }

    /// Restore power. Writes dropped during the outage stay lost.
    pub fn restore_power(&self) {
        self.budget.store(UNLIMITED, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// Whether a write has been dropped since the last `crash_after`
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Number of writes that reached media
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_block(&self, block_num: u64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BlockDeviceError::DeviceClosed);
        }
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        Ok(())
    }

    /// Consume one unit of write budget, failing once it is exhausted.
    fn take_budget(&self, block_num: u64) -> Result<()> {
        let granted = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                UNLIMITED => Some(UNLIMITED),
                n => Some(n - 1),
            })
            .is_ok();
        if !granted {
            self.crashed.store(true, Ordering::SeqCst);
            log::debug!("power loss: dropping write to block {}", block_num);
            return Err(BlockDeviceError::PowerLoss(block_num));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.check_block(block_num)?;
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }
        match self.blocks.read().get(&block_num) {
            Some(block) => buf.copy_from_slice(&block[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        self.check_block(block_num)?;
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        self.take_budget(block_num)?;

        let mut block = Box::new([0u8; BLOCK_SIZE]);
        block.copy_from_slice(data);
        self.blocks.write().insert(block_num, block);
        Ok(())
    }

    async fn write_at(&self, block_num: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.check_block(block_num)?;
        if offset + data.len() > BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidRange {
                offset,
                len: data.len(),
            });
        }
        self.take_budget(block_num)?;

        let mut blocks = self.blocks.write();
        let block = blocks
            .entry(block_num)
            .or_insert_with(|| Box::new([0u8; BLOCK_SIZE]));
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BlockDeviceError::DeviceClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("block_count", &self.block_count)
            .field("resident_blocks", &self.blocks.read().len())
            .field("writes", &self.write_count())
            .field("crashed", &self.has_crashed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unwritten_blocks_read_as_zero() {
        let device = MemBlockDevice::new(4);
        let mut buf = [0xFFu8; BLOCK_SIZE];
        device.read_block(3, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_crash_drops_writes_past_budget() {
        let device = MemBlockDevice::new(4);
        device.crash_after(1);

        device.write_block(0, &[1u8; BLOCK_SIZE]).await.unwrap();
        let err = device.write_block(1, &[2u8; BLOCK_SIZE]).await.unwrap_err();
        assert!(matches!(err, BlockDeviceError::PowerLoss(1)));
        assert!(device.has_crashed());

        // The dropped write never reached media
        device.restore_power();
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(1, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        device.read_block(0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        assert_eq!(device.write_count(), 1);
    }

    #[tokio::test]
    async fn test_close_keeps_contents_unreachable() {
        let device = MemBlockDevice::new(4);
        device.write_block(2, &[9u8; BLOCK_SIZE]).await.unwrap();
        device.close().await.unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            device.read_block(2, &mut buf).await,
            Err(BlockDeviceError::DeviceClosed)
        ));
        assert!(matches!(
            device.write_at(2, 0, &[1u8; 8]).await,
            Err(BlockDeviceError::DeviceClosed)
        ));
        assert!(device.close().await.is_err());
    }
}
