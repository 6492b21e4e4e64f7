//! Dump an inode's log or the free pool

use anyhow::Result;
use clap::Parser;

use super::ImageArgs;

/// Show the entries of an inode's log, or the free pool when no inode is given
#[derive(Parser, Debug)]
#[command(about = "Inspect an extent log or the free pool")]
pub struct InspectArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Inode number
    #[arg(short = 'n', long)]
    pub ino: Option<u64>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: InspectArgs) -> Result<()> {
    let store = args.image.open_store(true).await?;

    let Some(ino) = args.ino else {
        let pool = store.free_pool();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&pool)?);
        } else {
            println!(
                "Free pool: {} blocks in {} ranges (largest {}) of {}",
                pool.free_blocks, pool.range_count, pool.largest_free, pool.bounds
            );
            for range in &pool.ranges {
                println!("  {} ({} blocks)", range, range.size());
            }
        }
        return Ok(());
    };

    let report = store.inspect(ino).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Inode {}: head {}, tail {}, {} pages",
        report.ino,
        report.head,
        report
            .tail
            .map(|t| format!("page {} slot {}", t.page, t.slot))
            .unwrap_or_else(|| "empty".to_string()),
        report.pages.len()
    );
    println!(
        "Entries: {} ({} invalidated)",
        report.entries.len(),
        report.invalid_entries
    );
    for e in &report.entries {
        let target = if e.entry.is_hole() {
            "hole".to_string()
        } else {
            format!("block {}", e.entry.physical_block)
        };
        println!(
            "  [{}:{}] pages {}+{} -> {}, invalid count {}",
            e.position.page,
            e.position.slot,
            e.entry.logical_offset,
            e.entry.page_count,
            target,
            e.entry.invalid_count
        );
    }
    println!("Live mapping:");
    for run in &report.mapping {
        println!("  pages {}..{} -> blocks {}..", run.start, run.end, run.block);
    }
    Ok(())
}
