//! Resolve logical pages to physical blocks

use anyhow::{Context, Result};
use clap::Parser;

use super::ImageArgs;

/// Look up the physical block behind logical pages of an inode
#[derive(Parser, Debug)]
#[command(about = "Look up logical pages of an inode")]
pub struct LookupArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Inode number
    #[arg(short = 'n', long)]
    pub ino: u64,

    /// First logical page
    pub offset: u64,

    /// Number of pages to resolve
    #[arg(long, default_value_t = 1)]
    pub count: u64,
}

pub async fn run(args: LookupArgs) -> Result<()> {
    let store = args.image.open_store(true).await?;
    for offset in args.offset..args.offset.saturating_add(args.count) {
        let block = store
            .lookup(args.ino, offset)
            .await
            .with_context(|| format!("Failed to look up page {} of inode {}", offset, args.ino))?;
        match block {
            Some(block) => println!("{} -> {}", offset, block),
            None => println!("{} -> unmapped", offset),
        }
    }
    Ok(())
}
