//! Block device I/O for pmextent
//!
//! Two backends implement [`BlockDevice`]: an image file on the host
//! filesystem and a sparse in-memory device that stands in for a
//! persistent-memory region and can simulate power loss.

mod blockdev_trait;
mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
pub use self::memory::MemBlockDevice;

/// A block device that is backed by an image file
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;
        file.sync_all().await?;

        log::debug!("created image {:?} with {} blocks", path, size / BLOCK_SIZE as u64);

        Ok(Self {
            file: Mutex::new(Some(file)),
            block_count: size / BLOCK_SIZE as u64,
            path,
            read_only: false,
        })
    }

    /// Open an existing image file
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = file.metadata().await?.len();

        Ok(Self {
            file: Mutex::new(Some(file)),
            block_count: size / BLOCK_SIZE as u64,
            path,
            read_only,
        })
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_block(&self, block_num: u64, len: usize) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if len != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(len));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.check_block(block_num, buf.len())?;

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        self.check_block(block_num, data.len())?;

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            // write_block promises durability on return
            file.sync_data().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8)
            .await
            .unwrap();
        assert_eq!(device.block_count(), 8);

        let test_data = [0xAAu8; 4096];
        device.write_block(0, &test_data).await.unwrap();

        let mut read_buf = [0u8; 4096];
        device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        // Out of range blocks are rejected
        let err = device.read_block(8, &mut read_buf).await.unwrap_err();
        assert!(matches!(err, BlockDeviceError::InvalidBlockNumber(8)));
    }

    #[tokio::test]
    async fn test_write_at_updates_part_of_block() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("partial.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 2)
            .await
            .unwrap();
        device.write_block(1, &[0x11u8; 4096]).await.unwrap();
        device.write_at(1, 4088, &7u64.to_le_bytes()).await.unwrap();

        let mut buf = [0u8; 4096];
        device.read_block(1, &mut buf).await.unwrap();
        assert_eq!(&buf[..4088], &[0x11u8; 4088][..]);
        assert_eq!(&buf[4088..], &7u64.to_le_bytes());

        let err = device.write_at(1, 4090, &[0u8; 8]).await.unwrap_err();
        assert!(matches!(err, BlockDeviceError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096)
            .await
            .unwrap();
        device.write_block(0, &[0x55u8; 4096]).await.unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, true).await.unwrap();

        let mut read_buf = [0u8; 4096];
        read_only_device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!([0x55u8; 4096], read_buf);

        let write_result = read_only_device.write_block(0, &[0u8; 4096]).await;
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_closed_device_refuses_io() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("closed.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 2)
            .await
            .unwrap();
        device.close().await.unwrap();

        let mut buf = [0u8; 4096];
        assert!(matches!(
            device.read_block(0, &mut buf).await,
            Err(BlockDeviceError::DeviceClosed)
        ));
        assert!(matches!(device.close().await, Err(BlockDeviceError::DeviceClosed)));
    }
}
