//! Subcommands and the helpers they share

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use pmextent::{ExtentStore, FileBackedBlockDevice, StoreConfig};

pub mod compact;
pub mod format;
pub mod inspect;
pub mod lookup;
pub mod stats;
pub mod write;

/// Image and configuration options common to every command
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Image file holding the volume
    pub image: PathBuf,

    /// JSON store configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ImageArgs {
    /// Configuration from `--config`, or the defaults
    pub fn load_config(&self) -> Result<StoreConfig> {
        match &self.config {
            Some(path) => StoreConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(StoreConfig::default()),
        }
    }

    /// Open the volume, rebuilding its free pool
    pub async fn open_store(&self, read_only: bool) -> Result<ExtentStore> {
        let config = self.load_config()?;
        let device = FileBackedBlockDevice::open(&self.image, read_only)
            .await
            .with_context(|| format!("Failed to open image {}", self.image.display()))?;
        ExtentStore::open(Arc::new(device), config)
            .await
            .with_context(|| format!("Failed to open volume on {}", self.image.display()))
    }
}
