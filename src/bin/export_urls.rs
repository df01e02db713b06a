//! Batch exporter: streams newly-visited URLs to one-per-line text files.
//!
//! Reads the crawl database produced by the `crawler` binary and writes
//! every visited URL past the saved cursor into timestamped batch files,
//! then records the cursor so the next run resumes where this one ended.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crawler_core::Store;
use crawler_core::export::{DEFAULT_EXPORT_BATCH_SIZE, UrlBatchExporter};
use tracing::info;

/// Export newly-visited URLs from a crawl database.
#[derive(Parser, Debug)]
#[command(name = "export-urls")]
#[command(author, version, about)]
struct Args {
    /// Path of the crawler SQLite state file
    #[arg(long, default_value = "crawler.db")]
    db: PathBuf,

    /// Output directory for batch files and the cursor state
    #[arg(long, default_value = "exports")]
    out_dir: PathBuf,

    /// URLs per batch file
    #[arg(long, default_value_t = DEFAULT_EXPORT_BATCH_SIZE)]
    batch_size: i64,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet { "error" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Store::connect(&args.db)
        .await
        .context("failed to open crawl state database")?;

    let mut exporter = UrlBatchExporter::new(store.clone(), &args.out_dir, args.batch_size)
        .await
        .context("failed to prepare export directory")?;

    let batches = exporter.export_all().await?;
    if batches == 0 {
        info!("no new URLs to export");
    } else {
        info!(batches, last_id = exporter.last_id(), "export complete");
    }

    store.close().await.context("failed to close crawl state")?;
    Ok(())
}
