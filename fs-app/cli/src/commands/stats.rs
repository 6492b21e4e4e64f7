//! Volume summary and operation counters

use anyhow::Result;
use clap::Parser;

use super::ImageArgs;

/// Print volume geometry, free space and the counters gathered while opening
#[derive(Parser, Debug)]
#[command(about = "Show volume statistics")]
pub struct StatsArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatsArgs) -> Result<()> {
    let store = args.image.open_store(true).await?;
    let report = store.report().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let geometry = report.geometry;
    println!("Blocks:        {}", geometry.block_count);
    println!("Inodes:        {} ({} in use)", geometry.inode_count, report.active_inodes);
    println!("Data region:   {}", geometry.data_region());
    println!(
        "Free:          {} blocks in {} ranges (largest {})",
        report.free_pool.free_blocks, report.free_pool.range_count, report.free_pool.largest_free
    );
    println!("{}", report.telemetry);
    Ok(())
}
