//! Log compaction: rewrite a log as the minimal entry set for its mapping.

use serde::{Deserialize, Serialize};

use crate::blockdev::BLOCK_SIZE;
use crate::layout::{write_next_page, ExtentEntry, InodeRecord, LogPosition, ENTRIES_PER_PAGE, ENTRY_SIZE};
use crate::telemetry::OpKind;

use super::{chain_pages, ExtentLog, LogError};

/// When an append triggers compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    pub enabled: bool,
    /// Logs shorter than this are never compacted
    pub min_entries: u64,
    /// Compact once more than this percentage of entries is invalidated
    pub invalid_percent: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_entries: ENTRIES_PER_PAGE as u64,
            invalid_percent: 50,
        }
    }
}

impl CompactionPolicy {
    /// Policy that never triggers
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether a log with these counters should be compacted
    pub fn should_compact(&self, entries: u64, invalid_entries: u64) -> bool {
        self.enabled
            && entries >= self.min_entries
            && invalid_entries.saturating_mul(100) > entries.saturating_mul(self.invalid_percent)
    }
}

/// What a compaction did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionOutcome {
    pub entries_before: u64,
    pub entries_after: u64,
    pub pages_before: u64,
    pub pages_after: u64,
}

impl ExtentLog {
    pub(super) fn should_compact(&self) -> bool {
        self.ctx
            .policy
            .should_compact(self.entries, self.invalid_entries)
    }

    /// Rewrite the log into fresh pages holding one entry per live run.
    ///
    /// The new chain is written completely before the inode record is
    /// switched to it in a single write; the old pages are released only
    /// after that. A failure before the switch leaves the old log intact
    /// and returns every new page to the allocator.
    pub async fn compact(&mut self) -> Result<CompactionOutcome, LogError> {
        let _timer = self.ctx.telemetry.timer(OpKind::Compaction);
        if self.is_empty() {
            return Ok(CompactionOutcome::default());
        }

        let runs = self.mapping().await?;
        let old_pages = chain_pages(self.ctx.device.as_ref(), self.ino, self.head).await?;

        let mut entries = Vec::with_capacity(runs.len());
        for run in &runs {
            let mut start = run.start;
            while start < run.end {
                let count = (run.end - start).min(u32::MAX as u64);
                entries.push(ExtentEntry::new(
                    start,
                    count as u32,
                    run.block + (start - run.start),
                ));
                start += count;
            }
        }

        let page_count = (entries.len() + ENTRIES_PER_PAGE - 1) / ENTRIES_PER_PAGE;
        let mut new_pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            match self.alloc_page() {
                Ok(page) => new_pages.push(page),
                Err(e) => {
                    self.discard_pages(&new_pages);
                    return Err(e);
                }
            }
        }

        for (i, chunk) in entries.chunks(ENTRIES_PER_PAGE).enumerate() {
            let mut buf = vec![0u8; BLOCK_SIZE];
            for (slot, entry) in chunk.iter().enumerate() {
                buf[slot * ENTRY_SIZE..(slot + 1) * ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
            }
            write_next_page(&mut buf, new_pages.get(i + 1).copied().unwrap_or(0));
            if let Err(e) = self.ctx.device.write_block(new_pages[i], &buf).await {
                self.discard_pages(&new_pages);
                return Err(e.into());
            }
        }

        let (head, tail) = match new_pages.last() {
            Some(&last) => {
                let used = entries.len() - (page_count - 1) * ENTRIES_PER_PAGE;
                (new_pages[0], Some(LogPosition::new(last, used)))
            }
            None => (0, None),
        };
        let record = match tail {
            Some(tail) => InodeRecord::new(head, tail),
            None => InodeRecord::EMPTY,
        };
        if let Err(e) = self.ctx.inodes.store(self.ino, record).await {
            self.discard_pages(&new_pages);
            return Err(e);
        }

        let outcome = CompactionOutcome {
            entries_before: self.entries,
            entries_after: entries.len() as u64,
            pages_before: old_pages.len() as u64,
            pages_after: page_count as u64,
        };
        self.head = head;
        self.tail = tail;
        self.entries = entries.len() as u64;
        self.invalid_entries = 0;
        self.discard_pages(&old_pages);

        log::info!(
            "inode {}: compacted {} entries in {} pages into {} entries in {} pages",
            self.ino,
            outcome.entries_before,
            outcome.pages_before,
            outcome.entries_after,
            outcome.pages_after
        );
        Ok(outcome)
    }

    fn discard_pages(&self, pages: &[u64]) {
        for &page in pages {
            self.discard_page(page);
        }
    }
}
