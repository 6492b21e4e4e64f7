//! Copy-on-write pages into an inode

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use pmextent::BLOCK_SIZE;

use super::ImageArgs;

/// Write whole pages to an inode at a logical page offset
#[derive(Parser, Debug)]
#[command(about = "Write pages to an inode")]
pub struct WriteArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Inode number
    #[arg(short = 'n', long)]
    pub ino: u64,

    /// First logical page
    #[arg(short, long, default_value_t = 0)]
    pub offset: u64,

    /// File whose contents are written, zero-padded to whole pages
    #[arg(short = 'f', long, conflicts_with = "fill")]
    pub input: Option<PathBuf>,

    /// Byte value to fill the pages with
    #[arg(long)]
    pub fill: Option<u8>,

    /// Pages to write with --fill
    #[arg(short, long, default_value_t = 1)]
    pub pages: usize,
}

pub async fn run(args: WriteArgs) -> Result<()> {
    let mut data = match (&args.input, args.fill) {
        (Some(path), _) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(byte)) => vec![byte; args.pages * BLOCK_SIZE],
        (None, None) => return Err(anyhow!("Either --input or --fill is required")),
    };
    if data.is_empty() {
        return Err(anyhow!("Nothing to write"));
    }
    let padded = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
    data.resize(padded, 0);

    let store = args.image.open_store(false).await?;
    let outcome = store
        .write(args.ino, args.offset, &data)
        .await
        .with_context(|| format!("Failed to write inode {}", args.ino))?;
    store.close().await?;

    info!(
        "inode {}: entry at page {} slot {}, {} entries invalidated",
        args.ino, outcome.position.page, outcome.position.slot, outcome.invalidated
    );
    println!(
        "Wrote {} pages to inode {} at page {} ({} blocks released{})",
        data.len() / BLOCK_SIZE,
        args.ino,
        args.offset,
        outcome.released_blocks,
        if outcome.compacted { ", log compacted" } else { "" }
    );
    Ok(())
}
