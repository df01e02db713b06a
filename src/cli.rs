//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use crawler_core::config::DEFAULT_WORKER_COUNT;
use crawler_core::policy::FULL_SITE_MAX_DEPTH;
use crawler_core::{CrawlConfig, PolicyConfig};

/// Domain-scoped, resumable web crawler.
///
/// Crawls a single site breadth-first from a seed URL, keeping the queue,
/// visited set, and error log in a SQLite file so a crawl can be paused
/// or killed and resumed without re-fetching anything.
#[derive(Parser, Debug)]
#[command(name = "crawler")]
#[command(author, version, about)]
pub struct Args {
    /// Seed URL; its host scopes the crawl
    pub start_url: String,

    /// Path of the SQLite state file
    #[arg(long, default_value = "crawler.db")]
    pub db: PathBuf,

    /// Number of crawl workers (must cover the controller's upper clamp)
    #[arg(short = 'w', long, default_value_t = DEFAULT_WORKER_COUNT)]
    pub workers: usize,

    /// Maximum crawl depth
    #[arg(long)]
    pub max_depth: Option<i64>,

    /// Seed the queue from sitemap.xml at depth 1
    #[arg(long)]
    pub use_sitemap: bool,

    /// Full-site crawl mode (relaxed but still bounded depth)
    #[arg(long)]
    pub full_site: bool,

    /// Disable crawl policies (experimental mode)
    #[arg(long)]
    pub no_policy: bool,

    /// Override the User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Overlays the parsed flags onto the default configuration.
    #[must_use]
    pub fn to_config(&self) -> CrawlConfig {
        let mut config = CrawlConfig::new(self.start_url.clone());
        config.db_path.clone_from(&self.db);
        config.worker_count = self.workers;
        config.use_sitemap = self.use_sitemap;
        if let Some(user_agent) = &self.user_agent {
            config.user_agent.clone_from(user_agent);
        }

        let max_depth = match (self.max_depth, self.full_site) {
            (Some(depth), _) => Some(depth),
            (None, true) => Some(FULL_SITE_MAX_DEPTH),
            (None, false) => None,
        };
        config.policy = PolicyConfig {
            max_depth,
            ..PolicyConfig::default()
        };

        config
    }
}
