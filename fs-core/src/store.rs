//! Volume-level entry point tying the allocator, inode table and per-inode
//! logs to one block device.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::allocator::{AllocError, BlockRangeAllocator};
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::inode_table::InodeTable;
use crate::inspect::{inspect_free_pool, inspect_log, FreePoolReport, LogReport};
use crate::layout::Geometry;
use crate::log::{AppendOutcome, CompactionOutcome, ExtentLog, LogContext, LogError, Segment};
use crate::telemetry::{OpKind, Telemetry, TelemetrySnapshot};

/// Store-wide summary
#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub geometry: Geometry,
    pub active_inodes: usize,
    pub free_pool: FreePoolReport,
    pub telemetry: TelemetrySnapshot,
}

/// Extent logs and free space of one formatted device.
///
/// Each inode's log sits behind its own async `RwLock`: mutations of one
/// inode are serialized while different inodes proceed in parallel, and
/// lookups share the lock. A task holding an inode lock may take the
/// allocator lock, never the reverse. None of the operations are
/// cancel-safe: once a future has issued a durable write it must be driven
/// to completion.
pub struct ExtentStore {
    geometry: Geometry,
    config: StoreConfig,
    ctx: Arc<LogContext>,
    logs: Mutex<HashMap<u64, Arc<RwLock<ExtentLog>>>>,
}

impl ExtentStore {
    /// Write a fresh volume onto `device` with room for `inode_count` logs
    pub async fn format(
        device: Arc<dyn BlockDevice>,
        inode_count: u64,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = Geometry::new(device.block_count(), inode_count)?;
        log::info!(
            "ExtentStore::format: {} blocks, {} inodes, data region {}",
            geometry.block_count,
            geometry.inode_count,
            geometry.data_region()
        );

        let store = Self::assemble(device.clone(), geometry, config);
        store.ctx.inodes.clear().await?;
        // The header goes last: a device without it is not a volume
        device.write_block(0, &geometry.to_block()).await?;
        device.sync().await?;
        Ok(store)
    }

    /// Open a formatted volume and rebuild its free pool.
    ///
    /// Every non-empty log is loaded (validating its chain) and the blocks
    /// it owns are taken out of an otherwise free data region. Two logs
    /// claiming the same block is reported as corruption.
    pub async fn open(device: Arc<dyn BlockDevice>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let mut header = vec![0u8; BLOCK_SIZE];
        device.read_block(0, &mut header).await?;
        let geometry = Geometry::read_from(&mut Cursor::new(&header[..]))?;
        if geometry.block_count > device.block_count() {
            return Err(Error::InvalidArgument(format!(
                "volume spans {} blocks but the device holds {}",
                geometry.block_count,
                device.block_count()
            )));
        }

        let store = Self::assemble(device, geometry, config);
        store.recover().await?;
        Ok(store)
    }

    fn assemble(
        device: Arc<dyn BlockDevice>,
        geometry: Geometry,
        config: StoreConfig,
    ) -> Self {
        let telemetry = Telemetry::new(config.measure_timing);
        let allocator = BlockRangeAllocator::new(geometry.data_region(), telemetry.clone());
        let ctx = Arc::new(LogContext {
            inodes: Arc::new(InodeTable::new(device.clone(), geometry)),
            device,
            allocator: Arc::new(allocator),
            telemetry,
            policy: config.compaction,
        });
        Self {
            geometry,
            config,
            ctx,
            logs: Mutex::new(HashMap::new()),
        }
    }

    async fn recover(&self) -> Result<()> {
        let _timer = self.ctx.telemetry.timer(OpKind::Recovery);
        let occupied = self.ctx.inodes.occupied().await?;
        let mut logs = HashMap::with_capacity(occupied.len());

        for (ino, _) in occupied {
            let log = ExtentLog::open(self.ctx.clone(), ino).await?;
            for range in log.owned_blocks().await? {
                match self.ctx.allocator.reserve(range) {
                    Ok(()) => {}
                    Err(AllocError::NotFree(_)) | Err(AllocError::OutOfBounds(..)) => {
                        return Err(LogError::CorruptLog {
                            ino,
                            block: range.low,
                            reason: format!("blocks {} claimed twice or outside the data region", range),
                        }
                        .into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            logs.insert(ino, Arc::new(RwLock::new(log)));
        }

        log::info!(
            "ExtentStore::open: recovered {} logs, {} of {} data blocks free",
            logs.len(),
            self.ctx.allocator.free_blocks(),
            self.geometry.data_region().size()
        );
        *self.logs.lock() = logs;
        Ok(())
    }

    fn log(&self, ino: u64) -> Result<Arc<RwLock<ExtentLog>>> {
        if ino >= self.geometry.inode_count {
            return Err(Error::InvalidArgument(format!(
                "inode {} out of range (volume holds {})",
                ino, self.geometry.inode_count
            )));
        }
        let mut logs = self.logs.lock();
        let log = logs
            .entry(ino)
            .or_insert_with(|| Arc::new(RwLock::new(ExtentLog::empty(self.ctx.clone(), ino))));
        Ok(log.clone())
    }

    /// Copy-on-write whole pages of `data` at logical page `offset`
    pub async fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<AppendOutcome> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.write_pages(offset, data).await?)
    }

    /// Map `count` logical pages at `offset` to blocks the caller already
    /// allocated from [`Self::allocator`] and filled.
    pub async fn append(
        &self,
        ino: u64,
        offset: u64,
        count: u32,
        block: u64,
    ) -> Result<AppendOutcome> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.append(offset, count, block).await?)
    }

    /// Physical block of logical page `offset`, `None` when unmapped
    pub async fn lookup(&self, ino: u64, offset: u64) -> Result<Option<u64>> {
        let log = self.log(ino)?;
        let log = log.read().await;
        Ok(log.lookup(offset).await?)
    }

    /// Contents of logical page `offset`, `None` when unmapped
    pub async fn read(&self, ino: u64, offset: u64) -> Result<Option<Vec<u8>>> {
        let log = self.log(ino)?;
        let log = log.read().await;
        let Some(block) = log.lookup(offset).await? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.ctx.device.read_block(block, &mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn punch_hole(&self, ino: u64, offset: u64, count: u32) -> Result<AppendOutcome> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.punch_hole(offset, count).await?)
    }

    /// Unmap every page at or beyond `page_count`
    pub async fn truncate(&self, ino: u64, page_count: u64) -> Result<u64> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.truncate(page_count).await?)
    }

    /// Compact one log regardless of the policy
    pub async fn compact(&self, ino: u64) -> Result<CompactionOutcome> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.compact().await?)
    }

    /// Drop an inode's log and everything it maps
    pub async fn evict(&self, ino: u64) -> Result<u64> {
        let log = self.log(ino)?;
        let mut log = log.write().await;
        Ok(log.evict().await?)
    }

    /// Live runs of an inode
    pub async fn mapping(&self, ino: u64) -> Result<Vec<Segment>> {
        let log = self.log(ino)?;
        let log = log.read().await;
        Ok(log.mapping().await?)
    }

    pub async fn inspect(&self, ino: u64) -> Result<LogReport> {
        let log = self.log(ino)?;
        let log = log.read().await;
        Ok(inspect_log(&log).await?)
    }

    pub fn free_pool(&self) -> FreePoolReport {
        inspect_free_pool(&self.ctx.allocator)
    }

    /// Inodes whose logs hold at least one entry
    pub async fn active_inodes(&self) -> Vec<u64> {
        let logs: Vec<(u64, Arc<RwLock<ExtentLog>>)> = self
            .logs
            .lock()
            .iter()
            .map(|(&ino, log)| (ino, log.clone()))
            .collect();
        let mut active = Vec::new();
        for (ino, log) in logs {
            if !log.read().await.is_empty() {
                active.push(ino);
            }
        }
        active.sort_unstable();
        active
    }

    pub async fn report(&self) -> StoreReport {
        StoreReport {
            geometry: self.geometry,
            active_inodes: self.active_inodes().await.len(),
            free_pool: self.free_pool(),
            telemetry: self.ctx.telemetry.snapshot(),
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.ctx.telemetry
    }

    /// The shared allocator, for callers managing their own data blocks
    pub fn allocator(&self) -> &BlockRangeAllocator {
        &self.ctx.allocator
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.ctx.device
    }

    /// Flush the device
    pub async fn sync(&self) -> Result<()> {
        self.ctx.device.sync().await?;
        Ok(())
    }

    /// Flush and release the device. The store is unusable afterwards.
    pub async fn close(self) -> Result<()> {
        self.ctx.device.sync().await?;
        self.ctx.device.close().await?;
        log::info!("ExtentStore: closed");
        Ok(())
    }
}

impl std::fmt::Debug for ExtentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentStore")
            .field("geometry", &self.geometry)
            .field("config", &self.config)
            .finish()
    }
}
