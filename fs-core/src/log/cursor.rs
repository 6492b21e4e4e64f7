//! Ordered traversal of a log chain from head to a snapshotted tail.

use futures::stream::{self, Stream};

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::layout::{read_next_page, ExtentEntry, LogPosition, ENTRY_SIZE};

use super::LogError;

/// Walks `(position, entry)` pairs from the head of a chain up to, but not
/// including, the tail captured when the cursor was created.
///
/// Page-end positions are followed through the page tail's `next_page`
/// link; a link is never followed once the tail has been reached. The
/// cursor holds a copy of the current page, so it only reads each page
/// once. It is restartable by creating a new one from the head.
pub struct LogCursor<'a> {
    device: &'a dyn BlockDevice,
    ino: u64,
    pos: Option<LogPosition>,
    tail: Option<LogPosition>,
    page: Vec<u8>,
    loaded: Option<u64>,
    pages_walked: u64,
    visited: u64,
}

impl<'a> LogCursor<'a> {
    /// Cursor over the chain `head ..= tail`. A `None` tail is an empty log.
    pub fn new(
        device: &'a dyn BlockDevice,
        ino: u64,
        head: u64,
        tail: Option<LogPosition>,
    ) -> Self {
        let pos = tail.map(|_| LogPosition::new(head, 0));
        Self {
            device,
            ino,
            pos,
            tail,
            page: vec![0u8; BLOCK_SIZE],
            loaded: None,
            pages_walked: 1,
            visited: 0,
        }
    }

    /// Entries yielded so far
    pub fn visited(&self) -> u64 {
        self.visited
    }

    fn corrupt(&self, block: u64, reason: impl Into<String>) -> LogError {
        LogError::CorruptLog {
            ino: self.ino,
            block,
            reason: reason.into(),
        }
    }

    async fn load(&mut self, block: u64) -> Result<(), LogError> {
        if self.loaded == Some(block) {
            return Ok(());
        }
        match self.device.read_block(block, &mut self.page).await {
            Ok(()) => {
                self.loaded = Some(block);
                Ok(())
            }
            Err(BlockDeviceError::InvalidBlockNumber(_)) => {
                Err(self.corrupt(block, "log page is not a readable block"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next entry, or `None` once the tail snapshot is reached
    pub async fn next(&mut self) -> Result<Option<(LogPosition, ExtentEntry)>, LogError> {
        loop {
            let (Some(pos), Some(tail)) = (self.pos, self.tail) else {
                return Ok(None);
            };
            if pos == tail {
                return Ok(None);
            }

            self.load(pos.page).await?;

            if pos.is_page_end() {
                let next = read_next_page(&self.page);
                if next == 0 {
                    return Err(self.corrupt(pos.page, "chain ends before the log tail"));
                }
                self.pages_walked += 1;
                if self.pages_walked > self.device.block_count() {
                    return Err(self.corrupt(next, "page chain loops"));
                }
                self.pos = Some(LogPosition::new(next, 0));
                continue;
            }

            let offset = pos.byte_offset();
            let entry = ExtentEntry::from_bytes(&self.page[offset..offset + ENTRY_SIZE])
                .map_err(|e| self.corrupt(pos.page, format!("slot {}: {}", pos.slot, e)))?;

            self.pos = Some(pos.next_slot());
            self.visited += 1;
            return Ok(Some((pos, entry)));
        }
    }

    /// The remaining entries as a stream
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = Result<(LogPosition, ExtentEntry), LogError>> + 'a {
        stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|item| (item, cursor)))
        })
    }
}

/// Every page linked from `head`, following `next_page` until it is 0.
///
/// Unlike [`LogCursor`] this goes past the tail, picking up a page that an
/// interrupted append linked but never committed into.
pub async fn chain_pages(
    device: &dyn BlockDevice,
    ino: u64,
    head: u64,
) -> Result<Vec<u64>, LogError> {
    let mut pages = Vec::new();
    let mut page = vec![0u8; BLOCK_SIZE];
    let mut current = head;
    while current != 0 {
        if pages.len() as u64 >= device.block_count() {
            return Err(LogError::CorruptLog {
                ino,
                block: current,
                reason: "page chain loops".to_string(),
            });
        }
        match device.read_block(current, &mut page).await {
            Ok(()) => {}
            Err(BlockDeviceError::InvalidBlockNumber(_)) => {
                return Err(LogError::CorruptLog {
                    ino,
                    block: current,
                    reason: "log page is not a readable block".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        pages.push(current);
        current = read_next_page(&page);
    }
    Ok(pages)
}
