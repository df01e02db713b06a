//! Static crawl configuration.
//!
//! One [`CrawlConfig`] value is assembled at startup (defaults overlaid
//! with CLI flags) and threaded through construction of the store,
//! fetcher, controller, policy, and coordinator.

use std::path::PathBuf;
use std::time::Duration;

use crate::crawl::DEFAULT_FETCH_TIMEOUT;
use crate::policy::DEFAULT_MAX_DEPTH;
use crate::store::DEFAULT_BATCH_SIZE;
use crate::user_agent;

/// Default number of crawl workers. Must stay at or above the
/// controller's upper clamp or the parallelism cap can never be reached.
pub const DEFAULT_WORKER_COUNT: usize = 25;

/// Default seconds between coordinator-triggered store commits.
pub const DEFAULT_AUTO_COMMIT_INTERVAL: Duration = Duration::from_secs(300);

/// Sleep between polls when the queue is empty.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(500);

/// How long the queue must stay empty with zero in-flight URLs before
/// the crawl concludes it is done.
pub const DEFAULT_QUIESCENCE_GRACE: Duration = Duration::from_secs(2);

/// Bounds and window of the adaptive concurrency controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Starting parallelism.
    pub initial: usize,
    /// Lower clamp.
    pub min: usize,
    /// Upper clamp.
    pub max: usize,
    /// Samples accumulated before each re-evaluation.
    pub window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial: 5,
            min: 1,
            max: 20,
            window: 20,
        }
    }
}

/// Admission policy knobs.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Maximum crawl depth; `None` selects the default.
    pub max_depth: Option<i64>,
    /// Denied path extensions; `None` selects the default list.
    pub deny_extensions: Option<Vec<String>>,
    /// Optional path prefix allowlist.
    pub allow_path_prefixes: Option<Vec<String>>,
}

/// Full configuration for one crawl process.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Seed URL; its host scopes the whole crawl.
    pub start_url: String,
    /// Path of the SQLite state file.
    pub db_path: PathBuf,
    /// User-Agent sent on every request.
    pub user_agent: String,
    /// Number of crawl workers.
    pub worker_count: usize,
    /// Per-request fetch timeout.
    pub fetch_timeout: Duration,
    /// Mutations buffered before the store forces a commit.
    pub batch_size: u32,
    /// Seconds between coordinator-triggered commits.
    pub auto_commit_interval: Duration,
    /// Seconds between metrics reporter lines.
    pub report_interval: Duration,
    /// Sleep between polls on an empty queue.
    pub idle_poll: Duration,
    /// Idle time required before the crawl self-terminates.
    pub quiescence_grace: Duration,
    /// Controller bounds and window.
    pub controller: ControllerConfig,
    /// Admission policy settings.
    pub policy: PolicyConfig,
    /// Whether to seed from sitemap.xml at depth 1.
    pub use_sitemap: bool,
}

impl CrawlConfig {
    /// Configuration with all defaults for the given seed URL.
    #[must_use]
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
            db_path: PathBuf::from("crawler.db"),
            user_agent: user_agent::default_crawler_user_agent(),
            worker_count: DEFAULT_WORKER_COUNT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            auto_commit_interval: DEFAULT_AUTO_COMMIT_INTERVAL,
            report_interval: crate::crawl::DEFAULT_REPORT_INTERVAL,
            idle_poll: DEFAULT_IDLE_POLL,
            quiescence_grace: DEFAULT_QUIESCENCE_GRACE,
            controller: ControllerConfig::default(),
            policy: PolicyConfig::default(),
            use_sitemap: false,
        }
    }

    /// Effective policy max depth.
    #[must_use]
    pub fn max_depth(&self) -> i64 {
        self.policy.max_depth.unwrap_or(DEFAULT_MAX_DEPTH)
    }
}
