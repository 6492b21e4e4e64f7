//! Free block range allocator for pmextent
//!
//! Free space is a set of inclusive block ranges keyed by their low block.
//! Ranges in the pool are pairwise disjoint and never adjacent: a release
//! that touches a neighbour is merged into it. Allocation is first-fit in
//! ascending block order and carves blocks from the low end of the match.
//!
//! One exclusive lock guards the whole pool. Allocation, release and
//! diagnostic snapshots are mutually exclusive; none of them awaits while
//! holding it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::telemetry::Telemetry;

/// Error type for allocator operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("No free range of {requested} blocks (largest free range: {largest})")]
    Exhausted { requested: u64, largest: u64 },
    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),
    #[error("Range {0} is outside the managed region {1}")]
    OutOfBounds(BlockRange, BlockRange),
    #[error("Range {0} overlaps free space")]
    DoubleFree(BlockRange),
    #[error("Range {0} is not entirely free")]
    NotFree(BlockRange),
}

impl AllocError {
    /// True for the out-of-space condition
    pub fn is_exhausted(&self) -> bool {
        matches!(self, AllocError::Exhausted { .. })
    }
}

/// Contiguous run of physical blocks, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockRange {
    pub low: u64,
    pub high: u64,
}

impl BlockRange {
    /// Range `[low, high]`; `high` must not be below `low`
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high, "inverted block range {}..{}", low, high);
        Self { low, high }
    }

    /// `count` blocks starting at `start`
    pub fn from_start(start: u64, count: u64) -> Self {
        Self::new(start, start + count - 1)
    }

    /// Number of blocks in the range
    pub fn size(&self) -> u64 {
        self.high - self.low + 1
    }

    /// Whether `block` falls inside the range
    pub fn contains(&self, block: u64) -> bool {
        self.low <= block && block <= self.high
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &BlockRange) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    /// Whether the two ranges share at least one block
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

/// Ordered free ranges: low block -> high block
#[derive(Debug, Default)]
struct FreePool {
    ranges: BTreeMap<u64, u64>,
    free_blocks: u64,
}

impl FreePool {
    fn largest(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(&low, &high)| high - low + 1)
            .max()
            .unwrap_or(0)
    }

    /// The free range containing `block`, if any
    fn containing(&self, block: u64) -> Option<BlockRange> {
        self.ranges
            .range(..=block)
            .next_back()
            .filter(|(_, &high)| high >= block)
            .map(|(&low, &high)| BlockRange::new(low, high))
    }
}

/// Global allocator over a fixed region of blocks
pub struct BlockRangeAllocator {
    bounds: BlockRange,
    pool: Mutex<FreePool>,
    telemetry: Telemetry,
}

impl BlockRangeAllocator {
    /// Allocator whose whole region starts out free
    pub fn new(bounds: BlockRange, telemetry: Telemetry) -> Self {
        let allocator = Self::empty(bounds, telemetry);
        {
            let mut pool = allocator.pool.lock();
            pool.ranges.insert(bounds.low, bounds.high);
            pool.free_blocks = bounds.size();
        }
        log::info!(
            "BlockRangeAllocator: managing blocks {} ({} free)",
            bounds,
            bounds.size()
        );
        allocator
    }

    /// Allocator over `bounds` with nothing free yet
    pub fn empty(bounds: BlockRange, telemetry: Telemetry) -> Self {
        Self {
            bounds,
            pool: Mutex::new(FreePool::default()),
            telemetry,
        }
    }

    /// The managed region
    pub fn bounds(&self) -> BlockRange {
        self.bounds
    }

    /// Allocate `count` contiguous blocks, first fit.
    pub fn allocate(&self, count: u64) -> Result<BlockRange, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidRequest(
                "cannot allocate zero blocks".to_string(),
            ));
        }

        let mut pool = self.pool.lock();
        let mut steps = 0;
        let mut hit = None;
        for (&low, &high) in pool.ranges.iter() {
            steps += 1;
            if high - low + 1 >= count {
                hit = Some(BlockRange::new(low, high));
                break;
            }
        }
        self.telemetry.add_alloc_steps(steps);

        let Some(found) = hit else {
            let largest = pool.largest();
            log::debug!(
                "BlockRangeAllocator::allocate: no range of {} blocks after {} steps (largest {})",
                count,
                steps,
                largest
            );
            return Err(AllocError::Exhausted {
                requested: count,
                largest,
            });
        };

        pool.ranges.remove(&found.low);
        let allocated = BlockRange::from_start(found.low, count);
        if allocated.high < found.high {
            pool.ranges.insert(allocated.high + 1, found.high);
        }
        pool.free_blocks -= count;

        log::trace!(
            "BlockRangeAllocator::allocate: {} from {} in {} steps",
            allocated,
            found,
            steps
        );
        Ok(allocated)
    }

    /// Return a range to the pool, merging it with adjacent free ranges.
    pub fn release(&self, range: BlockRange) -> Result<(), AllocError> {
        if range.low > range.high {
            return Err(AllocError::InvalidRequest(format!(
                "inverted range {}..{}",
                range.low, range.high
            )));
        }
        if !self.bounds.covers(&range) {
            return Err(AllocError::OutOfBounds(range, self.bounds));
        }

        let mut pool = self.pool.lock();
        let mut steps = 0;

        let prev = pool
            .ranges
            .range(..=range.low)
            .next_back()
            .map(|(&low, &high)| BlockRange::new(low, high));
        let next = pool
            .ranges
            .range(range.low + 1..)
            .next()
            .map(|(&low, &high)| BlockRange::new(low, high));

        let mut merged = range;
        if let Some(prev) = prev {
            steps += 1;
            if prev.high >= range.low {
                self.telemetry.add_free_steps(steps);
                return Err(AllocError::DoubleFree(range));
            }
            if prev.high + 1 == range.low {
                merged.low = prev.low;
            }
        }
        if let Some(next) = next {
            steps += 1;
            if next.low <= range.high {
                self.telemetry.add_free_steps(steps);
                return Err(AllocError::DoubleFree(range));
            }
            if range.high + 1 == next.low {
                pool.ranges.remove(&next.low);
                merged.high = next.high;
            }
        }
        self.telemetry.add_free_steps(steps);

        // When merged with the preceding range this overwrites its entry
        pool.ranges.insert(merged.low, merged.high);
        pool.free_blocks += range.size();

        log::trace!(
            "BlockRangeAllocator::release: {} -> free range {}",
            range,
            merged
        );
        Ok(())
    }

    /// Remove a range that is entirely free from the pool.
    ///
    /// Used when rebuilding the pool from blocks found to be in use.
    pub fn reserve(&self, range: BlockRange) -> Result<(), AllocError> {
        if !self.bounds.covers(&range) {
            return Err(AllocError::OutOfBounds(range, self.bounds));
        }

        let mut pool = self.pool.lock();
        let Some(free) = pool.containing(range.low).filter(|free| free.covers(&range)) else {
            return Err(AllocError::NotFree(range));
        };

        pool.ranges.remove(&free.low);
        if free.low < range.low {
            pool.ranges.insert(free.low, range.low - 1);
        }
        if range.high < free.high {
            pool.ranges.insert(range.high + 1, free.high);
        }
        pool.free_blocks -= range.size();
        Ok(())
    }

    /// Whether `block` is currently free
    pub fn is_free(&self, block: u64) -> bool {
        self.pool.lock().containing(block).is_some()
    }

    /// Whether `range` lies inside the managed region with none of its
    /// blocks in the free pool
    pub fn is_allocated(&self, range: BlockRange) -> bool {
        if range.low > range.high || !self.bounds.covers(&range) {
            return false;
        }
        // Ranges are disjoint, so only the last one starting at or below
        // `range.high` can reach into it
        self.pool
            .lock()
            .ranges
            .range(..=range.high)
            .next_back()
            .map_or(true, |(_, &high)| high < range.low)
    }

    /// Total free blocks
    pub fn free_blocks(&self) -> u64 {
        self.pool.lock().free_blocks
    }

    /// Number of free ranges
    pub fn range_count(&self) -> usize {
        self.pool.lock().ranges.len()
    }

    /// Size of the largest free range
    pub fn largest_free(&self) -> u64 {
        self.pool.lock().largest()
    }

    /// Snapshot of the free ranges in ascending order
    pub fn ranges(&self) -> Vec<BlockRange> {
        self.pool
            .lock()
            .ranges
            .iter()
            .map(|(&low, &high)| BlockRange::new(low, high))
            .collect()
    }

    /// Check the pool invariants: ranges in bounds, sorted, disjoint,
    /// non-adjacent, and the free counter matching their total size.
    pub fn is_consistent(&self) -> bool {
        let pool = self.pool.lock();
        let mut total = 0;
        let mut prev_high: Option<u64> = None;
        for (&low, &high) in pool.ranges.iter() {
            if low > high || !self.bounds.covers(&BlockRange { low, high }) {
                return false;
            }
            if let Some(prev_high) = prev_high {
                // Strictly greater than prev_high + 1: no overlap, no adjacency
                if low <= prev_high + 1 {
                    return false;
                }
            }
            total += high - low + 1;
            prev_high = Some(high);
        }
        total == pool.free_blocks
    }
}

impl fmt::Debug for BlockRangeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.pool.lock();
        f.debug_struct("BlockRangeAllocator")
            .field("bounds", &self.bounds)
            .field("free_blocks", &pool.free_blocks)
            .field("ranges", &pool.ranges.len())
            .finish()
    }
}
