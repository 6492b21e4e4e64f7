//! Durable inode records holding each log's head and tail.
//!
//! A record is rewritten whole with one `write_at`, so a reader after a
//! crash sees either the old `{head, tail}` pair or the new one. Several
//! records share a block and `write_at` may read-modify-write it, so record
//! updates are serialized here.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::layout::{Geometry, InodeRecord, INODE_RECORD_SIZE, RECORDS_PER_BLOCK};
use crate::log::LogError;

/// Inode record table on a block device
pub struct InodeTable {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    write_lock: Mutex<()>,
}

impl InodeTable {
    /// Table described by `geometry`
    pub fn new(device: Arc<dyn BlockDevice>, geometry: Geometry) -> Self {
        Self {
            device,
            geometry,
            write_lock: Mutex::new(()),
        }
    }

    /// Number of inode records
    pub fn inode_count(&self) -> u64 {
        self.geometry.inode_count
    }

    fn check(&self, ino: u64) -> Result<(), LogError> {
        if ino >= self.geometry.inode_count {
            return Err(LogError::InvalidArgument(format!(
                "inode {} out of range (table holds {})",
                ino, self.geometry.inode_count
            )));
        }
        Ok(())
    }

    /// Zero every record block
    pub async fn clear(&self) -> Result<(), LogError> {
        let _guard = self.write_lock.lock().await;
        let zero = vec![0u8; BLOCK_SIZE];
        for block in 0..self.geometry.inode_table_blocks {
            self.device
                .write_block(self.geometry.inode_table + block, &zero)
                .await?;
        }
        Ok(())
    }

    /// Read the record of `ino`
    pub async fn load(&self, ino: u64) -> Result<InodeRecord, LogError> {
        self.check(ino)?;
        let (block, offset) = self.geometry.record_location(ino);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf).await?;
        InodeRecord::from_bytes(&buf[offset..offset + INODE_RECORD_SIZE]).map_err(|e| {
            LogError::CorruptLog {
                ino,
                block,
                reason: e.to_string(),
            }
        })
    }

    /// Every non-empty record, reading each table block once
    pub async fn occupied(&self) -> Result<Vec<(u64, InodeRecord)>, LogError> {
        let mut occupied = Vec::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        for index in 0..self.geometry.inode_table_blocks {
            let block = self.geometry.inode_table + index;
            self.device.read_block(block, &mut buf).await?;
            for (slot, raw) in buf.chunks_exact(INODE_RECORD_SIZE).enumerate() {
                let ino = index * RECORDS_PER_BLOCK + slot as u64;
                if ino >= self.geometry.inode_count {
                    break;
                }
                let record = InodeRecord::from_bytes(raw).map_err(|e| LogError::CorruptLog {
                    ino,
                    block,
                    reason: e.to_string(),
                })?;
                if record.log_head != 0 || !record.is_empty() {
                    occupied.push((ino, record));
                }
            }
        }
        Ok(occupied)
    }

    /// Durably replace the record of `ino`
    pub async fn store(&self, ino: u64, record: InodeRecord) -> Result<(), LogError> {
        self.check(ino)?;
        let (block, offset) = self.geometry.record_location(ino);
        let _guard = self.write_lock.lock().await;
        self.device
            .write_at(block, offset, &record.to_bytes())
            .await?;
        log::trace!(
            "inode {}: record head {} tail {:#x}",
            ino,
            record.log_head,
            record.log_tail
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::layout::LogPosition;

    #[tokio::test]
    async fn test_records_share_blocks_without_clobbering() {
        let device = Arc::new(MemBlockDevice::new(64));
        let geometry = Geometry::new(64, 512).unwrap();
        let table = InodeTable::new(device, geometry);

        let a = InodeRecord::new(10, LogPosition::new(10, 1));
        let b = InodeRecord::new(11, LogPosition::new(12, 4));
        table.store(0, a).await.unwrap();
        table.store(1, b).await.unwrap();
        table.store(300, a).await.unwrap();

        assert_eq!(table.load(0).await.unwrap(), a);
        assert_eq!(table.load(1).await.unwrap(), b);
        assert_eq!(table.load(300).await.unwrap(), a);
        assert!(table.load(2).await.unwrap().is_empty());

        assert!(matches!(
            table.load(512).await,
            Err(LogError::InvalidArgument(_))
        ));

        let occupied: Vec<u64> = table
            .occupied()
            .await
            .unwrap()
            .into_iter()
            .map(|(ino, _)| ino)
            .collect();
        assert_eq!(occupied, vec![0, 1, 300]);
    }
}
