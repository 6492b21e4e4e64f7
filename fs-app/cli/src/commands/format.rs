//! Format command for creating pmextent volumes

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::sync::Arc;

use pmextent::{ExtentStore, FileBackedBlockDevice, BLOCK_SIZE};

use super::ImageArgs;

/// Create an image file and format it
#[derive(Parser, Debug)]
#[command(about = "Create and format a pmextent image")]
pub struct FormatArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Size of the image in MiB
    #[arg(short, long, default_value_t = 64)]
    pub size: u64,

    /// Number of inode records
    #[arg(short, long, default_value_t = 1024)]
    pub inodes: u64,

    /// Overwrite an existing image without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: FormatArgs) -> Result<()> {
    let path = &args.image.image;
    let config = args.image.load_config()?;

    let size = args
        .size
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow!("Requested size is too large"))?;
    if size < 4 * BLOCK_SIZE as u64 {
        return Err(anyhow!("An image needs at least 4 blocks"));
    }

    // Confirm before overwriting
    if path.exists() && !args.force {
        println!(
            "WARNING: {} already exists and will be overwritten.",
            path.display()
        );
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    info!(
        "Formatting {} ({} MiB, {} inodes)...",
        path.display(),
        args.size,
        args.inodes
    );

    let device = FileBackedBlockDevice::create(path, size)
        .await
        .with_context(|| format!("Failed to create image {}", path.display()))?;
    let store = ExtentStore::format(Arc::new(device), args.inodes, config)
        .await
        .with_context(|| format!("Failed to format {}", path.display()))?;

    let geometry = store.geometry();
    println!(
        "Formatted {}: {} blocks, {} inodes, data blocks {}",
        path.display(),
        geometry.block_count,
        geometry.inode_count,
        geometry.data_region()
    );
    store.close().await?;
    Ok(())
}
