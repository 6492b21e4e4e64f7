//! Live mapping derived by replaying log entries in order.
//!
//! Built fresh for one scan and thrown away afterwards; it is never kept as
//! an index. Replaying an entry carves its logical range out of whatever
//! earlier entries still map it, which is exactly what "later entries shadow
//! earlier ones" means.

use std::collections::BTreeMap;

use crate::allocator::BlockRange;
use crate::layout::{ExtentEntry, LogPosition};

/// A run of logical pages mapped by one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Segment {
    pub start: u64,
    /// Exclusive
    pub end: u64,
    /// Physical block of `start`, 0 for a hole
    pub block: u64,
    /// Slot of the entry that produced the run
    #[serde(skip)]
    pub source: Option<LogPosition>,
}

impl Segment {
    /// Pages in the run
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the run unmaps its pages
    pub fn is_hole(&self) -> bool {
        self.block == 0
    }

    /// Physical blocks behind the run, `None` for holes
    pub fn blocks(&self) -> Option<BlockRange> {
        (!self.is_hole()).then(|| BlockRange::from_start(self.block, self.len()))
    }

    /// The part of the run covering `[from, to)`
    fn slice(&self, from: u64, to: u64) -> Segment {
        debug_assert!(self.start <= from && from < to && to <= self.end);
        Segment {
            start: from,
            end: to,
            block: if self.is_hole() {
                0
            } else {
                self.block + (from - self.start)
            },
            source: self.source,
        }
    }
}

/// Disjoint runs keyed by their first logical page
#[derive(Debug, Default)]
pub struct LiveMap {
    runs: BTreeMap<u64, Segment>,
}

impl LiveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `entry` found at `source`; returns the runs it shadowed.
    pub fn apply(&mut self, entry: &ExtentEntry, source: Option<LogPosition>) -> Vec<Segment> {
        let shadowed = self.carve(entry.logical_offset, entry.logical_end());
        self.runs.insert(
            entry.logical_offset,
            Segment {
                start: entry.logical_offset,
                end: entry.logical_end(),
                block: entry.physical_block,
                source,
            },
        );
        shadowed
    }

    /// Remove `[start, end)` from the map, returning the removed pieces in
    /// ascending order.
    pub fn carve(&mut self, start: u64, end: u64) -> Vec<Segment> {
        let overlapping: Vec<u64> = self
            .runs
            .range(..end)
            .rev()
            .take_while(|(_, run)| run.end > start)
            .map(|(&key, _)| key)
            .collect();

        let mut removed = Vec::with_capacity(overlapping.len());
        for key in overlapping.into_iter().rev() {
            let Some(run) = self.runs.remove(&key) else {
                continue;
            };
            if run.start < start {
                self.runs.insert(run.start, run.slice(run.start, start));
            }
            if run.end > end {
                self.runs.insert(end, run.slice(end, run.end));
            }
            removed.push(run.slice(run.start.max(start), run.end.min(end)));
        }
        removed
    }

    /// Run covering logical page `offset`
    pub fn get(&self, offset: u64) -> Option<&Segment> {
        self.runs
            .range(..=offset)
            .next_back()
            .map(|(_, run)| run)
            .filter(|run| run.end > offset)
    }

    /// End of the last mapped (non-hole) run
    pub fn mapped_end(&self) -> u64 {
        self.runs
            .values()
            .rev()
            .find(|run| !run.is_hole())
            .map(|run| run.end)
            .unwrap_or(0)
    }

    /// Runs in ascending logical order, holes included
    pub fn runs(&self) -> impl Iterator<Item = &Segment> {
        self.runs.values()
    }

    /// Mapped runs with logically and physically contiguous neighbours
    /// merged and holes dropped. This is the minimal entry set that
    /// reproduces the mapping.
    pub fn coalesced(&self) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::new();
        for run in self.runs.values().filter(|run| !run.is_hole()) {
            if let Some(last) = out.last_mut() {
                if last.end == run.start && last.block + last.len() == run.block {
                    last.end = run.end;
                    continue;
                }
            }
            out.push(Segment { source: None, ..*run });
        }
        out
    }
}
