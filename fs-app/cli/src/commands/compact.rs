//! Compact extent logs on demand

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

use super::ImageArgs;

/// Rewrite logs into their minimal form
#[derive(Parser, Debug)]
#[command(about = "Compact extent logs")]
pub struct CompactArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Inode number
    #[arg(short = 'n', long, conflicts_with = "all")]
    pub ino: Option<u64>,

    /// Compact every non-empty log
    #[arg(short, long)]
    pub all: bool,
}

pub async fn run(args: CompactArgs) -> Result<()> {
    let store = args.image.open_store(false).await?;
    let inodes = match (args.ino, args.all) {
        (Some(ino), _) => vec![ino],
        (None, true) => store.active_inodes().await,
        (None, false) => return Err(anyhow!("Either --ino or --all is required")),
    };

    for ino in inodes {
        let outcome = store
            .compact(ino)
            .await
            .with_context(|| format!("Failed to compact inode {}", ino))?;
        info!("inode {}: {:?}", ino, outcome);
        println!(
            "Inode {}: {} entries in {} pages -> {} entries in {} pages",
            ino,
            outcome.entries_before,
            outcome.pages_before,
            outcome.entries_after,
            outcome.pages_after
        );
    }
    store.close().await?;
    Ok(())
}
