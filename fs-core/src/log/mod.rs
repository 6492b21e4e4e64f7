//! Per-inode copy-on-write extent log
//!
//! Each inode owns a singly linked chain of log pages. Entries are appended
//! at the tail and never rewritten, except for the monotonic invalid-count
//! tag. The durable inode record `{log_head, log_tail}` defines the log:
//! everything from the head up to the tail slot. Every operation therefore
//! ends with one record write, and anything written before that write is
//! invisible if power is lost first.
//!
//! An append runs in this order:
//!
//! 1. scan the log for entries overlapping the new range;
//! 2. write the entry into the tail slot, or into a fresh page that is
//!    written whole and then linked from the full tail page;
//! 3. bump the invalid-count tag of each overlapped entry;
//! 4. advance the tail by rewriting the inode record;
//! 5. return the shadowed physical blocks to the allocator.

mod compact;
mod cursor;
mod live;

use std::sync::Arc;
use thiserror::Error;

use crate::allocator::{AllocError, BlockRange, BlockRangeAllocator};
use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::inode_table::InodeTable;
use crate::layout::{
    pack_tagged_block, read_next_page, ExtentEntry, InodeRecord, LogPosition, ENTRY_BLOCK_OFFSET,
    LAST_ENTRY, MAX_BLOCK,
};
use crate::telemetry::{OpKind, Telemetry};

pub use compact::{CompactionOutcome, CompactionPolicy};
pub use cursor::{chain_pages, LogCursor};
pub use live::{LiveMap, Segment};

/// Error type for extent log operations
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("Corrupt log for inode {ino} at block {block}: {reason}")]
    CorruptLog { ino: u64, block: u64, reason: String },
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl LogError {
    /// True when the operation failed for lack of free space
    pub fn is_exhausted(&self) -> bool {
        matches!(self, LogError::Alloc(e) if e.is_exhausted())
    }
}

/// Shared collaborators of every log on one device
pub struct LogContext {
    pub device: Arc<dyn BlockDevice>,
    pub allocator: Arc<BlockRangeAllocator>,
    pub inodes: Arc<InodeTable>,
    pub telemetry: Telemetry,
    pub policy: CompactionPolicy,
}

/// Result of a committed append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Slot the entry was written to
    pub position: LogPosition,
    /// Earlier entries whose invalid count was bumped
    pub invalidated: u64,
    /// Physical blocks returned to the allocator
    pub released_blocks: u64,
    /// Whether the append triggered a compaction
    pub compacted: bool,
}

struct Placement {
    pos: LogPosition,
    /// Set when the entry started a new chain
    new_head: Option<u64>,
}

/// The extent log of one inode
pub struct ExtentLog {
    ctx: Arc<LogContext>,
    ino: u64,
    head: u64,
    tail: Option<LogPosition>,
    entries: u64,
    invalid_entries: u64,
}

impl ExtentLog {
    /// Log of an inode whose record is known to be empty
    pub fn empty(ctx: Arc<LogContext>, ino: u64) -> Self {
        Self {
            ctx,
            ino,
            head: 0,
            tail: None,
            entries: 0,
            invalid_entries: 0,
        }
    }

    /// Load an inode's log from its durable record.
    ///
    /// The whole chain is scanned once, which validates it and initialises
    /// the entry counters used by the compaction policy.
    pub async fn open(ctx: Arc<LogContext>, ino: u64) -> Result<Self, LogError> {
        let record = ctx.inodes.load(ino).await?;
        let tail = record.tail().map_err(|e| LogError::CorruptLog {
            ino,
            block: record.log_head,
            reason: format!("bad tail pointer: {}", e),
        })?;
        if tail.is_some() != (record.log_head != 0) {
            return Err(LogError::CorruptLog {
                ino,
                block: record.log_head,
                reason: "head and tail disagree on whether the log is empty".to_string(),
            });
        }

        let mut log = Self::empty(ctx, ino);
        log.head = record.log_head;
        log.tail = tail;

        let (entries, invalid_entries) = {
            let mut cursor = log.cursor();
            let mut entries = 0;
            let mut invalid = 0;
            while let Some((_, entry)) = cursor.next().await? {
                entries += 1;
                if entry.invalid_count > 0 {
                    invalid += 1;
                }
            }
            log.ctx.telemetry.add_log_scan_steps(cursor.visited());
            (entries, invalid)
        };
        log.entries = entries;
        log.invalid_entries = invalid_entries;

        log::debug!(
            "inode {}: opened log head {} tail {:?}, {} entries ({} invalidated)",
            ino,
            log.head,
            log.tail,
            entries,
            invalid_entries
        );
        Ok(log)
    }

    /// Inode number
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Device the log lives on
    pub fn device(&self) -> &dyn BlockDevice {
        self.ctx.device.as_ref()
    }

    /// First page of the chain, 0 when empty
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Next free slot, `None` when empty
    pub fn tail(&self) -> Option<LogPosition> {
        self.tail
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    /// Entries between head and tail
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Entries with a non-zero invalid count
    pub fn invalid_entry_count(&self) -> u64 {
        self.invalid_entries
    }

    /// Read-only cursor bounded by the current tail
    pub fn cursor(&self) -> LogCursor<'_> {
        LogCursor::new(self.ctx.device.as_ref(), self.ino, self.head, self.tail)
    }

    /// Physical block holding logical page `offset`.
    ///
    /// The most recent entry covering the page wins; a covering hole (or no
    /// covering entry at all) yields `None`.
    pub async fn lookup(&self, offset: u64) -> Result<Option<u64>, LogError> {
        let _timer = self.ctx.telemetry.timer(OpKind::Lookup);
        let mut cursor = self.cursor();
        let mut found = None;
        while let Some((_, entry)) = cursor.next().await? {
            if entry.covers(offset) {
                found = Some(entry);
            }
        }
        self.ctx.telemetry.add_log_scan_steps(cursor.visited());
        Ok(found
            .filter(|entry| !entry.is_hole())
            .map(|entry| entry.block_for(offset)))
    }

    /// Replay the whole log into its live mapping
    pub async fn live_map(&self) -> Result<LiveMap, LogError> {
        let mut live = LiveMap::new();
        let mut cursor = self.cursor();
        while let Some((pos, entry)) = cursor.next().await? {
            live.apply(&entry, Some(pos));
        }
        self.ctx.telemetry.add_log_scan_steps(cursor.visited());
        Ok(live)
    }

    /// Current logical-to-physical runs, holes omitted
    pub async fn mapping(&self) -> Result<Vec<Segment>, LogError> {
        Ok(self.live_map().await?.coalesced())
    }

    /// Every block this log keeps in use: its chain pages (including a page
    /// linked past the tail) and its live data runs.
    pub async fn owned_blocks(&self) -> Result<Vec<BlockRange>, LogError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let mut owned: Vec<BlockRange> =
            chain_pages(self.ctx.device.as_ref(), self.ino, self.head)
                .await?
                .into_iter()
                .map(|page| BlockRange::new(page, page))
                .collect();
        owned.extend(self.mapping().await?.iter().filter_map(Segment::blocks));
        Ok(owned)
    }

    /// Record that `page_count` logical pages from `logical_offset` now live
    /// at `physical_block`. The blocks must already be allocated from the
    /// shared pool.
    pub async fn append(
        &mut self,
        logical_offset: u64,
        page_count: u32,
        physical_block: u64,
    ) -> Result<AppendOutcome, LogError> {
        if physical_block == 0 || physical_block > MAX_BLOCK {
            return Err(LogError::InvalidArgument(format!(
                "physical block {} is not addressable",
                physical_block
            )));
        }
        if page_count > 0 {
            let range = BlockRange::from_start(physical_block, page_count as u64);
            if !self.ctx.allocator.bounds().covers(&range) {
                return Err(LogError::InvalidArgument(format!(
                    "blocks {} are outside the data region {}",
                    range,
                    self.ctx.allocator.bounds()
                )));
            }
            if !self.ctx.allocator.is_allocated(range) {
                return Err(LogError::InvalidArgument(format!(
                    "blocks {} were not allocated",
                    range
                )));
            }
        }
        self.append_entry(ExtentEntry::new(logical_offset, page_count, physical_block))
            .await
    }

    /// Unmap `page_count` logical pages from `logical_offset`
    pub async fn punch_hole(
        &mut self,
        logical_offset: u64,
        page_count: u32,
    ) -> Result<AppendOutcome, LogError> {
        self.append_entry(ExtentEntry::hole(logical_offset, page_count))
            .await
    }

    /// Copy-on-write `data` (whole pages) to fresh blocks and map them at
    /// `logical_offset`. Nothing is appended when allocation fails.
    pub async fn write_pages(
        &mut self,
        logical_offset: u64,
        data: &[u8],
    ) -> Result<AppendOutcome, LogError> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(LogError::InvalidArgument(format!(
                "write of {} bytes is not a whole number of pages",
                data.len()
            )));
        }
        let pages = u32::try_from(data.len() / BLOCK_SIZE).map_err(|_| {
            LogError::InvalidArgument("write spans too many pages for one extent".to_string())
        })?;

        let _timer = self.ctx.telemetry.timer(OpKind::CowWrite);
        let range = {
            let _alloc = self.ctx.telemetry.timer(OpKind::NewDataBlocks);
            self.ctx.allocator.allocate(pages as u64)?
        };

        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            if let Err(e) = self.ctx.device.write_block(range.low + i as u64, chunk).await {
                self.discard_data(range);
                return Err(e.into());
            }
        }

        match self.append(logical_offset, pages, range.low).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.discard_data(range);
                Err(e)
            }
        }
    }

    /// Unmap every page at or beyond `new_page_count`. Returns the number
    /// of physical blocks released.
    pub async fn truncate(&mut self, new_page_count: u64) -> Result<u64, LogError> {
        let end = self.live_map().await?.mapped_end();
        let mut released = 0;
        let mut start = new_page_count;
        while start < end {
            let count = (end - start).min(u32::MAX as u64) as u32;
            released += self.punch_hole(start, count).await?.released_blocks;
            start += count as u64;
        }
        Ok(released)
    }

    /// Drop the whole log: clear the inode record, then release every data
    /// run and chain page. Returns the number of blocks released.
    pub async fn evict(&mut self) -> Result<u64, LogError> {
        let _timer = self.ctx.telemetry.timer(OpKind::EvictInode);
        if self.is_empty() {
            return Ok(0);
        }
        let runs = self.mapping().await?;
        let pages = chain_pages(self.ctx.device.as_ref(), self.ino, self.head).await?;

        self.ctx.inodes.store(self.ino, InodeRecord::EMPTY).await?;
        self.head = 0;
        self.tail = None;
        self.entries = 0;
        self.invalid_entries = 0;

        let mut released = 0;
        for range in runs.iter().filter_map(Segment::blocks) {
            released += range.size();
            self.discard_data(range);
        }
        for &page in &pages {
            self.discard_page(page);
        }
        log::debug!(
            "inode {}: evicted, released {} data blocks and {} log pages",
            self.ino,
            released,
            pages.len()
        );
        Ok(released + pages.len() as u64)
    }

    async fn append_entry(&mut self, entry: ExtentEntry) -> Result<AppendOutcome, LogError> {
        if entry.page_count == 0 {
            return Err(LogError::InvalidArgument(
                "extent must cover at least one page".to_string(),
            ));
        }
        if entry
            .logical_offset
            .checked_add(entry.page_count as u64)
            .is_none()
        {
            return Err(LogError::InvalidArgument(format!(
                "extent at page {} overflows the logical address space",
                entry.logical_offset
            )));
        }

        let _timer = self.ctx.telemetry.timer(OpKind::Logging);
        let (overlapped, shadowed) = self.scan_overlaps(&entry).await?;
        let placed = self.place(&entry).await?;

        let head = placed.new_head.unwrap_or(self.head);
        let new_tail = placed.pos.next_slot();
        let commit = self
            .invalidate_and_commit(&overlapped, InodeRecord::new(head, new_tail))
            .await;
        let bumped = match commit {
            Ok(bumped) => bumped,
            Err(e) => {
                // A fresh head page is unreachable without the record
                if let Some(page) = placed.new_head {
                    self.discard_page(page);
                }
                return Err(e);
            }
        };

        self.head = head;
        self.tail = Some(new_tail);
        self.entries += 1;
        self.invalid_entries += overlapped
            .iter()
            .filter(|(_, old)| old.invalid_count == 0)
            .count() as u64;
        self.ctx.telemetry.add_write_breaks(bumped);

        let mut released_blocks = 0;
        for range in shadowed.iter().filter_map(Segment::blocks) {
            released_blocks += range.size();
            self.discard_data(range);
        }

        log::trace!(
            "inode {}: appended pages {}..{} -> block {} at {:?}, {} overlapped",
            self.ino,
            entry.logical_offset,
            entry.logical_end(),
            entry.physical_block,
            placed.pos,
            overlapped.len()
        );

        let mut compacted = false;
        if self.should_compact() {
            match self.compact().await {
                Ok(_) => compacted = true,
                // The append itself is durable; the log stays as it was
                Err(e) => log::error!("inode {}: compaction after append failed: {}", self.ino, e),
            }
        }

        Ok(AppendOutcome {
            position: placed.pos,
            invalidated: overlapped.len() as u64,
            released_blocks,
            compacted,
        })
    }

    /// Find entries overlapping `entry` and the runs it will shadow.
    async fn scan_overlaps(
        &self,
        entry: &ExtentEntry,
    ) -> Result<(Vec<(LogPosition, ExtentEntry)>, Vec<Segment>), LogError> {
        let start = entry.logical_offset;
        let end = entry.logical_end();
        let mut overlapped = Vec::new();
        let mut live = LiveMap::new();

        let mut cursor = self.cursor();
        while let Some((pos, old)) = cursor.next().await? {
            if !old.overlaps(start, entry.page_count as u64) {
                continue;
            }
            // Only the part inside the new range can be shadowed by it
            let from = old.logical_offset.max(start);
            let to = old.logical_end().min(end);
            let clipped = ExtentEntry::new(
                from,
                (to - from) as u32,
                if old.is_hole() { 0 } else { old.block_for(from) },
            );
            live.apply(&clipped, Some(pos));
            overlapped.push((pos, old));
        }
        self.ctx.telemetry.add_log_scan_steps(cursor.visited());

        Ok((overlapped, live.carve(start, end)))
    }

    /// Durably write `entry` into the next slot without committing it.
    async fn place(&self, entry: &ExtentEntry) -> Result<Placement, LogError> {
        let device = self.ctx.device.as_ref();
        let bytes = entry.to_bytes();

        let tail = match self.tail {
            None => {
                let page = self.start_page(&bytes).await?;
                return Ok(Placement {
                    pos: LogPosition::new(page, 0),
                    new_head: Some(page),
                });
            }
            Some(tail) => tail,
        };

        if !tail.is_page_end() {
            device.write_at(tail.page, tail.byte_offset(), &bytes).await?;
            return Ok(Placement {
                pos: tail,
                new_head: None,
            });
        }

        let mut buf = vec![0u8; BLOCK_SIZE];
        device.read_block(tail.page, &mut buf).await?;
        let linked = read_next_page(&buf);
        if linked != 0 {
            if linked >= device.block_count() {
                return Err(LogError::CorruptLog {
                    ino: self.ino,
                    block: tail.page,
                    reason: format!("next_page {} is past the device end", linked),
                });
            }
            // Linked by an append that lost power before committing
            log::warn!(
                "inode {}: reusing page {} linked past the tail",
                self.ino,
                linked
            );
            device.write_at(linked, 0, &bytes).await?;
            return Ok(Placement {
                pos: LogPosition::new(linked, 0),
                new_head: None,
            });
        }

        let page = self.start_page(&bytes).await?;
        // Linking is the point after which the page belongs to the chain
        if let Err(e) = device
            .write_at(tail.page, LAST_ENTRY, &page.to_le_bytes())
            .await
        {
            self.discard_page(page);
            return Err(e.into());
        }
        Ok(Placement {
            pos: LogPosition::new(page, 0),
            new_head: None,
        })
    }

    /// Allocate a page and write it whole with `first` in slot 0 and no
    /// successor.
    async fn start_page(&self, first: &[u8]) -> Result<u64, LogError> {
        let page = self.alloc_page()?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[..first.len()].copy_from_slice(first);
        if let Err(e) = self.ctx.device.write_block(page, &buf).await {
            self.discard_page(page);
            return Err(e.into());
        }
        Ok(page)
    }

    /// Bump the overlapped entries' tags, then commit `record`. Returns the
    /// number of tags bumped.
    async fn invalidate_and_commit(
        &self,
        overlapped: &[(LogPosition, ExtentEntry)],
        record: InodeRecord,
    ) -> Result<u64, LogError> {
        let mut bumped = 0;
        for (pos, old) in overlapped {
            if old.invalid_count == u8::MAX {
                continue;
            }
            let word = pack_tagged_block(old.physical_block, old.invalid_count + 1);
            self.ctx
                .device
                .write_at(pos.page, pos.byte_offset() + ENTRY_BLOCK_OFFSET, &word.to_le_bytes())
                .await?;
            bumped += 1;
        }
        self.ctx.inodes.store(self.ino, record).await?;
        Ok(bumped)
    }

    fn alloc_page(&self) -> Result<u64, LogError> {
        let _timer = self.ctx.telemetry.timer(OpKind::NewMetaBlocks);
        Ok(self.ctx.allocator.allocate(1)?.low)
    }

    /// Return a log page to the allocator. A failure here means the pool
    /// already held the page; it is logged and the pool is left unchanged.
    fn discard_page(&self, page: u64) {
        let _timer = self.ctx.telemetry.timer(OpKind::FreeMetaBlocks);
        if let Err(e) = self.ctx.allocator.release(BlockRange::new(page, page)) {
            log::error!("inode {}: releasing log page {}: {}", self.ino, page, e);
        }
    }

    /// Return data blocks to the allocator, logging failures like
    /// [`Self::discard_page`].
    fn discard_data(&self, range: BlockRange) {
        let _timer = self.ctx.telemetry.timer(OpKind::FreeDataBlocks);
        if let Err(e) = self.ctx.allocator.release(range) {
            log::error!("inode {}: releasing data blocks {}: {}", self.ino, range, e);
        }
    }
}

impl std::fmt::Debug for ExtentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentLog")
            .field("ino", &self.ino)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("entries", &self.entries)
            .field("invalid_entries", &self.invalid_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::layout::{Geometry, ENTRIES_PER_PAGE, LAST_ENTRY};
    use futures::TryStreamExt;

    fn context(policy: CompactionPolicy) -> Arc<LogContext> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4096));
        let geometry = Geometry::new(4096, 16).unwrap();
        let telemetry = Telemetry::new(false);
        Arc::new(LogContext {
            allocator: Arc::new(BlockRangeAllocator::new(
                geometry.data_region(),
                telemetry.clone(),
            )),
            inodes: Arc::new(InodeTable::new(device.clone(), geometry)),
            device,
            telemetry,
            policy,
        })
    }

    /// Take blocks out of the pool as if a caller had allocated them
    fn claim(ctx: &LogContext, low: u64, count: u64) {
        ctx.allocator
            .reserve(BlockRange::from_start(low, count))
            .unwrap();
    }

    fn read_entry(buf: &[u8], slot: usize) -> ExtentEntry {
        ExtentEntry::from_bytes(&buf[slot * 24..slot * 24 + 24]).unwrap()
    }

    #[tokio::test]
    async fn test_overwrite_shadows_earlier_entry() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 1);
        claim(&ctx, 100, 2);
        claim(&ctx, 200, 2);

        log.append(0, 2, 100).await.unwrap();
        let outcome = log.append(0, 2, 200).await.unwrap();
        assert_eq!(outcome.invalidated, 1);

        assert_eq!(log.lookup(0).await.unwrap(), Some(200));
        assert_eq!(log.lookup(1).await.unwrap(), Some(201));
        assert_eq!(log.lookup(2).await.unwrap(), None);

        // The first entry carries the tag on media
        let mut page = vec![0u8; BLOCK_SIZE];
        ctx.device.read_block(log.head(), &mut page).await.unwrap();
        assert_eq!(read_entry(&page, 0).invalid_count, 1);
        assert_eq!(read_entry(&page, 1).invalid_count, 0);
        assert_eq!(log.invalid_entry_count(), 1);
        assert_eq!(ctx.telemetry.write_breaks(), 1);
        assert!(ctx.allocator.is_free(100));
        assert!(ctx.allocator.is_free(101));
    }

    #[tokio::test]
    async fn test_partial_overlap_lookup() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 1);
        claim(&ctx, 100, 8);
        claim(&ctx, 500, 2);

        log.append(0, 8, 100).await.unwrap();
        log.append(2, 2, 500).await.unwrap();

        assert_eq!(log.lookup(1).await.unwrap(), Some(101));
        assert_eq!(log.lookup(2).await.unwrap(), Some(500));
        assert_eq!(log.lookup(3).await.unwrap(), Some(501));
        assert_eq!(log.lookup(4).await.unwrap(), Some(104));
        assert_eq!(log.lookup(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chain_spans_pages() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 3);
        let total = ENTRIES_PER_PAGE as u64 * 2 + 5;
        claim(&ctx, 2000, total);

        for i in 0..total {
            log.append(i, 1, 2000 + i).await.unwrap();
        }
        assert_eq!(log.entry_count(), total);

        let pages = chain_pages(ctx.device.as_ref(), 3, log.head()).await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(log.tail(), Some(LogPosition::new(pages[2], 5)));

        assert_eq!(log.lookup(0).await.unwrap(), Some(2000));
        assert_eq!(log.lookup(ENTRIES_PER_PAGE as u64).await.unwrap(), Some(2000 + 170));
        assert_eq!(log.lookup(total - 1).await.unwrap(), Some(2000 + total - 1));

        // Reopening from the record sees the same log
        let reopened = ExtentLog::open(ctx, 3).await.unwrap();
        assert_eq!(reopened.entry_count(), total);
        assert_eq!(reopened.tail(), log.tail());
    }

    #[tokio::test]
    async fn test_write_pages_releases_shadowed_blocks() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 2);
        let free_at_start = ctx.allocator.free_blocks();

        log.write_pages(0, &vec![1u8; BLOCK_SIZE * 4]).await.unwrap();
        let first = log.lookup(0).await.unwrap().unwrap();
        // 4 data blocks + 1 log page
        assert_eq!(ctx.allocator.free_blocks(), free_at_start - 5);

        let outcome = log.write_pages(1, &vec![2u8; BLOCK_SIZE * 2]).await.unwrap();
        assert_eq!(outcome.released_blocks, 2);
        assert!(ctx.allocator.is_free(first + 1));
        assert!(ctx.allocator.is_free(first + 2));
        assert!(!ctx.allocator.is_free(first));
        assert!(!ctx.allocator.is_free(first + 3));

        let block = log.lookup(1).await.unwrap().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        ctx.device.read_block(block, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn test_write_fails_cleanly_when_exhausted() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 2);
        let free = ctx.allocator.free_blocks() as usize;

        let err = log
            .write_pages(0, &vec![0u8; BLOCK_SIZE * (free + 1)])
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert!(log.is_empty());
        assert_eq!(ctx.allocator.free_blocks() as usize, free);
    }

    #[tokio::test]
    async fn test_punch_hole_and_truncate() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 4);
        claim(&ctx, 300, 10);

        log.append(0, 10, 300).await.unwrap();
        let outcome = log.punch_hole(2, 2).await.unwrap();
        assert_eq!(outcome.released_blocks, 2);
        assert_eq!(log.lookup(2).await.unwrap(), None);
        assert_eq!(log.lookup(4).await.unwrap(), Some(304));

        let released = log.truncate(6).await.unwrap();
        assert_eq!(released, 4);
        assert_eq!(log.lookup(5).await.unwrap(), Some(305));
        assert_eq!(log.lookup(6).await.unwrap(), None);

        // Already short enough
        assert_eq!(log.truncate(20).await.unwrap(), 0);
        assert!(ctx.allocator.is_free(302));
        assert!(ctx.allocator.is_free(309));
        assert!(!ctx.allocator.is_free(305));
    }

    #[tokio::test]
    async fn test_evict_releases_everything() {
        let ctx = context(CompactionPolicy::disabled());
        let free_at_start = ctx.allocator.free_blocks();
        let mut log = ExtentLog::empty(ctx.clone(), 5);

        for i in 0..200u64 {
            log.write_pages(i % 7, &vec![i as u8; BLOCK_SIZE]).await.unwrap();
        }
        log.evict().await.unwrap();

        assert!(log.is_empty());
        assert_eq!(ctx.allocator.free_blocks(), free_at_start);
        assert!(ctx.inodes.load(5).await.unwrap().is_empty());
        assert!(ctx.allocator.is_consistent());
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 1);
        claim(&ctx, 100, 2);

        assert!(matches!(
            log.append(0, 0, 100).await,
            Err(LogError::InvalidArgument(_))
        ));
        assert!(matches!(
            log.append(0, 1, 0).await,
            Err(LogError::InvalidArgument(_))
        ));
        assert!(matches!(
            log.append(u64::MAX, 2, 100).await,
            Err(LogError::InvalidArgument(_))
        ));
        assert!(matches!(
            log.write_pages(0, &[0u8; 100]).await,
            Err(LogError::InvalidArgument(_))
        ));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_keeps_its_tail_while_log_grows() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 6);
        claim(&ctx, 100, 5);
        for i in 0..3u64 {
            log.append(i, 1, 100 + i).await.unwrap();
        }

        let snapshot = LogCursor::new(ctx.device.as_ref(), 6, log.head(), log.tail());
        log.append(3, 1, 103).await.unwrap();
        log.append(0, 1, 104).await.unwrap();

        let seen: Vec<_> = snapshot.into_stream().try_collect().await.unwrap();
        let offsets: Vec<u64> = seen.iter().map(|(_, e)| e.logical_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        // Entry 0 was invalidated in place after the snapshot was taken
        assert_eq!(seen[0].1.physical_block, 100);

        let mut current = log.cursor();
        while current.next().await.unwrap().is_some() {}
        assert_eq!(current.visited(), 5);
    }

    #[tokio::test]
    async fn test_orphan_link_past_device_end_is_corrupt() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 7);
        claim(&ctx, 2000, ENTRIES_PER_PAGE as u64 + 1);
        for i in 0..ENTRIES_PER_PAGE as u64 {
            log.append(i, 1, 2000 + i).await.unwrap();
        }
        let tail = log.tail().unwrap();
        assert!(tail.is_page_end());

        let bogus = ctx.device.block_count() + 10;
        ctx.device
            .write_at(log.head(), LAST_ENTRY, &bogus.to_le_bytes())
            .await
            .unwrap();

        let err = log
            .append(500, 1, 2000 + ENTRIES_PER_PAGE as u64)
            .await
            .unwrap_err();
        assert!(
            matches!(err, LogError::CorruptLog { ino: 7, .. }),
            "{}",
            err
        );
        assert_eq!(log.tail(), Some(tail));
        assert_eq!(log.entry_count(), ENTRIES_PER_PAGE as u64);
        assert_eq!(ctx.inodes.load(7).await.unwrap().tail().unwrap(), Some(tail));
    }

    #[tokio::test]
    async fn test_append_requires_allocated_blocks() {
        let ctx = context(CompactionPolicy::disabled());
        let mut log = ExtentLog::empty(ctx.clone(), 1);
        let region = ctx.allocator.bounds();
        let free_at_start = ctx.allocator.free_blocks();

        // Still in the free pool
        let err = log.append(0, 2, region.low + 100).await.unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)), "{}", err);

        // Partly allocated
        claim(&ctx, region.low + 200, 1);
        assert!(matches!(
            log.append(0, 2, region.low + 200).await,
            Err(LogError::InvalidArgument(_))
        ));

        // Runs off the end of the data region
        claim(&ctx, region.high - 1, 2);
        assert!(matches!(
            log.append(0, 50, region.high - 1).await,
            Err(LogError::InvalidArgument(_))
        ));
        // Below the data region, inside the inode table
        assert!(matches!(
            log.append(0, 1, region.low - 1).await,
            Err(LogError::InvalidArgument(_))
        ));

        assert!(log.is_empty());
        assert!(ctx.inodes.load(1).await.unwrap().is_empty());
        assert!(ctx.allocator.is_free(region.low + 100));
        assert_eq!(ctx.allocator.free_blocks(), free_at_start - 3);

        // Allocated blocks go through
        let range = ctx.allocator.allocate(2).unwrap();
        log.append(0, 2, range.low).await.unwrap();
        assert_eq!(log.lookup(1).await.unwrap(), Some(range.low + 1));
    }
}
