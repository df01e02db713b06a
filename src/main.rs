//! CLI entry point for the crawler.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crawler_core::{
    AdmissionPolicy, AllowAllPolicy, CrawlPolicy, Crawler, DomainParser, HttpFetcher, Metrics,
    Store, sitemap,
};
use tracing::{debug, info};
use url::Url;

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = args.to_config();

    let start = Url::parse(&config.start_url)
        .with_context(|| format!("invalid start URL: {}", config.start_url))?;
    let domain = start
        .host_str()
        .context("start URL has no host to scope the crawl to")?
        .to_string();

    info!(start_url = %config.start_url, domain = %domain, db = %config.db_path.display(), "crawler starting");

    // Fatal initialisation: a store that cannot open or migrate aborts
    // with a non-zero exit before any worker starts.
    let store = Store::connect_with_batch_size(&config.db_path, config.batch_size)
        .await
        .context("failed to open crawl state database")?;

    let fetcher = Arc::new(
        HttpFetcher::new(&config.user_agent, config.controller.initial)
            .context("failed to build HTTP client")?,
    );
    let parser = Arc::new(DomainParser::new(domain));
    let policy: Arc<dyn AdmissionPolicy> = if args.no_policy {
        info!("crawl policies disabled (experimental mode)");
        Arc::new(AllowAllPolicy)
    } else {
        Arc::new(CrawlPolicy::new(
            config.max_depth(),
            config.policy.deny_extensions.clone(),
            config.policy.allow_path_prefixes.clone(),
        ))
    };
    let metrics = Arc::new(Metrics::new());

    let sitemap_seeds = if config.use_sitemap {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .context("failed to build sitemap HTTP client")?;
        sitemap::fetch_sitemap_urls(&client, &config.start_url).await
    } else {
        Vec::new()
    };

    let crawler = Crawler::new(store.clone(), fetcher, parser, policy, metrics, &config)?;

    // SIGINT: commit whatever is buffered and exit 0. The token is the
    // single shutdown initiator; the run loop handles the rest.
    let token = crawler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, finishing in-flight fetches");
            token.cancel();
        }
    });

    let summary = crawler.run(&config.start_url, sitemap_seeds).await?;
    store.close().await.context("failed to close crawl state")?;

    info!(
        visited = summary.visited,
        errors = summary.errors,
        uptime_secs = summary.uptime.as_secs(),
        "crawler exited safely"
    );

    Ok(())
}
