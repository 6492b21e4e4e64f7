//! Diagnostic views of extent logs and the free pool.
//!
//! Reports are plain serializable snapshots; building one also emits the
//! same information through `log::debug!` so a dump can be read straight
//! from the log output.

use futures::TryStreamExt;
use serde::Serialize;

use crate::allocator::{BlockRange, BlockRangeAllocator};
use crate::layout::{ExtentEntry, LogPosition};
use crate::log::{chain_pages, ExtentLog, LogError, Segment};

/// One entry slot as found on media
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub position: LogPosition,
    #[serde(flatten)]
    pub entry: ExtentEntry,
}

/// Everything one inode's log holds
#[derive(Debug, Clone, Serialize)]
pub struct LogReport {
    pub ino: u64,
    pub head: u64,
    pub tail: Option<LogPosition>,
    /// Chain pages, including one linked past the tail
    pub pages: Vec<u64>,
    pub entries: Vec<EntryReport>,
    pub invalid_entries: u64,
    /// Live runs after replay, holes dropped
    pub mapping: Vec<Segment>,
}

/// Snapshot of the allocator's free ranges
#[derive(Debug, Clone, Serialize)]
pub struct FreePoolReport {
    pub bounds: BlockRange,
    pub free_blocks: u64,
    pub range_count: usize,
    pub largest_free: u64,
    pub ranges: Vec<BlockRange>,
}

/// Walk `log` and describe it
pub async fn inspect_log(log: &ExtentLog) -> Result<LogReport, LogError> {
    let ino = log.ino();
    log::debug!(
        "inode {}: log head {}, tail {:?}",
        ino,
        log.head(),
        log.tail()
    );

    let entries: Vec<EntryReport> = log
        .cursor()
        .into_stream()
        .map_ok(|(position, entry)| {
            log::debug!(
                "entry @ page {} slot {}: pgoff {}, num_pages {}, block {}, invalid count {}",
                position.page,
                position.slot,
                entry.logical_offset,
                entry.page_count,
                entry.physical_block,
                entry.invalid_count
            );
            EntryReport { position, entry }
        })
        .try_collect()
        .await?;

    let pages = if log.is_empty() {
        Vec::new()
    } else {
        chain_pages(log.device(), ino, log.head()).await?
    };

    Ok(LogReport {
        ino,
        head: log.head(),
        tail: log.tail(),
        pages,
        invalid_entries: entries
            .iter()
            .filter(|report| report.entry.invalid_count > 0)
            .count() as u64,
        entries,
        mapping: log.mapping().await?,
    })
}

/// Describe the free pool
pub fn inspect_free_pool(allocator: &BlockRangeAllocator) -> FreePoolReport {
    let ranges = allocator.ranges();
    for range in &ranges {
        log::debug!("free range {} ({} blocks)", range, range.size());
    }
    let report = FreePoolReport {
        bounds: allocator.bounds(),
        free_blocks: ranges.iter().map(BlockRange::size).sum(),
        range_count: ranges.len(),
        largest_free: ranges.iter().map(BlockRange::size).max().unwrap_or(0),
        ranges,
    };
    log::debug!(
        "free pool: {} blocks in {} ranges, largest {}",
        report.free_blocks,
        report.range_count,
        report.largest_free
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;

    #[test]
    fn test_free_pool_report() {
        let allocator = BlockRangeAllocator::new(BlockRange::new(10, 109), Telemetry::default());
        let a = allocator.allocate(10).unwrap();
        allocator.allocate(5).unwrap();
        allocator.release(a).unwrap();

        let report = inspect_free_pool(&allocator);
        assert_eq!(report.ranges, vec![BlockRange::new(10, 19), BlockRange::new(25, 109)]);
        assert_eq!(report.free_blocks, 95);
        assert_eq!(report.largest_free, 85);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["range_count"], 2);
    }
}
