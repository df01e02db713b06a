//! The concurrent crawl core.
//!
//! [`Crawler`] ties the store, fetcher, parser, policy, and metrics
//! together under a fixed worker pool:
//! - workers pull `(url, depth)` items from the durable queue, re-check
//!   the visited set, mark, fetch under a permit, and enqueue the
//!   admitted links they discover;
//! - every fetch outcome feeds the [`ConcurrencyController`], whose
//!   adjustments are applied to the fetcher's permit pool;
//! - a single reporter task logs progress, and a timed task commits the
//!   store batch;
//! - one cancellation token drives shutdown, whether it comes from a
//!   signal or from quiescence detection.
//!
//! The crawl is complete when the queue is empty and no worker holds an
//! in-flight URL; workers track this with a shared in-flight counter and
//! an idle clock, and cancel the token themselves once the condition has
//! held for a grace period.

mod controller;
mod fetcher;
mod metrics;

pub use controller::{ConcurrencyController, ControllerError};
pub use fetcher::{DEFAULT_FETCH_TIMEOUT, Fetch, FetchOutcome, HttpFetcher};
pub use metrics::{DEFAULT_REPORT_INTERVAL, Metrics};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CrawlConfig;
use crate::parser::ExtractLinks;
use crate::policy::AdmissionPolicy;
use crate::store::{Store, StoreError};

/// Error type for crawl orchestration.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// A store operation failed during seeding or final commit.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Controller bounds were inconsistent.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Too few workers to ever reach the controller's upper clamp.
    #[error("worker count {workers} is below the controller max {max}; the parallelism cap could never be reached")]
    InsufficientWorkers {
        /// Configured worker count.
        workers: usize,
        /// Controller upper clamp.
        max: usize,
    },
}

/// Final tallies of one crawl run.
#[derive(Debug, Clone, Copy)]
pub struct CrawlSummary {
    /// URLs marked visited during this process.
    pub visited: u64,
    /// Fetch and store failures counted during this process.
    pub errors: u64,
    /// Wall-clock duration of the run.
    pub uptime: Duration,
}

/// State shared by workers and background tasks.
struct Shared {
    store: Store,
    fetcher: Arc<dyn Fetch>,
    parser: Arc<dyn ExtractLinks>,
    policy: Arc<dyn AdmissionPolicy>,
    metrics: Arc<Metrics>,
    controller: Mutex<ConcurrencyController>,
    token: CancellationToken,
    /// URLs currently between dequeue and completed processing. Includes
    /// dequeue attempts in progress, so `queue empty && in_flight == 0`
    /// really means nobody holds work.
    in_flight: AtomicUsize,
    /// When the crawl last became fully idle; cleared by any sign of work.
    idle_since: Mutex<Option<Instant>>,
    fetch_timeout: Duration,
    idle_poll: Duration,
    quiescence_grace: Duration,
}

impl Shared {
    fn lock_controller(&self) -> std::sync::MutexGuard<'_, ConcurrencyController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_idle(&self) {
        *self.idle_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Called after an empty dequeue. True once the queue has stayed
    /// empty with zero in-flight URLs for the full grace period.
    fn quiescence_reached(&self) -> bool {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            self.clear_idle();
            return false;
        }
        let mut idle = self.idle_since.lock().unwrap_or_else(PoisonError::into_inner);
        let since = idle.get_or_insert_with(Instant::now);
        since.elapsed() >= self.quiescence_grace
    }
}

/// Worker-pool orchestrator driving a crawl to quiescence.
///
/// One `Crawler` runs one crawl. External shutdown (signal handling)
/// goes through [`Crawler::cancel`]; quiescence detection triggers the
/// same path from inside. Both are idempotent.
pub struct Crawler {
    shared: Arc<Shared>,
    worker_count: usize,
    report_interval: Duration,
    auto_commit_interval: Duration,
}

impl Crawler {
    /// Wires the crawl core together.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Controller`] for inconsistent controller
    /// bounds and [`CrawlError::InsufficientWorkers`] when the worker
    /// pool could never reach the controller's upper clamp.
    pub fn new(
        store: Store,
        fetcher: Arc<dyn Fetch>,
        parser: Arc<dyn ExtractLinks>,
        policy: Arc<dyn AdmissionPolicy>,
        metrics: Arc<Metrics>,
        config: &CrawlConfig,
    ) -> Result<Self, CrawlError> {
        let controller = ConcurrencyController::new(
            config.controller.initial,
            config.controller.min,
            config.controller.max,
            config.controller.window,
        )?;

        if config.worker_count < controller.max() {
            return Err(CrawlError::InsufficientWorkers {
                workers: config.worker_count,
                max: controller.max(),
            });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                fetcher,
                parser,
                policy,
                metrics,
                controller: Mutex::new(controller),
                token: CancellationToken::new(),
                in_flight: AtomicUsize::new(0),
                idle_since: Mutex::new(None),
                fetch_timeout: config.fetch_timeout,
                idle_poll: config.idle_poll,
                quiescence_grace: config.quiescence_grace,
            }),
            worker_count: config.worker_count,
            report_interval: config.report_interval,
            auto_commit_interval: config.auto_commit_interval,
        })
    }

    /// Requests shutdown. Idempotent; safe from any task or signal
    /// handler. Workers finish their in-flight fetch, the store batch is
    /// committed, and [`Crawler::run`] returns normally.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    /// Token observed by every worker and background task; exposed so
    /// the binary can tie it to signal handling.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Seeds the queue and drives the crawl until quiescence or
    /// cancellation.
    ///
    /// `sitemap_seeds` enter at depth 1, the start URL at depth 0.
    /// Workers, the metrics reporter, and the timed commit task all run
    /// until the token fires; their teardown tolerates
    /// cancellation-as-normal. The store batch is committed before this
    /// returns; closing the store is the caller's last step.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Store`] when seeding or the final commit
    /// fails. Per-URL failures during the crawl are counted and logged,
    /// never returned.
    #[instrument(skip_all, fields(start_url = %start_url, workers = self.worker_count))]
    pub async fn run(
        &self,
        start_url: &str,
        sitemap_seeds: Vec<String>,
    ) -> Result<CrawlSummary, CrawlError> {
        self.shared.store.enqueue(start_url, 0).await?;
        if !sitemap_seeds.is_empty() {
            let count = sitemap_seeds.len();
            for url in sitemap_seeds {
                self.shared.store.enqueue(&url, 1).await?;
            }
            info!(count, "seeded queue from sitemap at depth 1");
        }

        info!("starting crawl");

        // Exactly one reporter per crawl.
        let reporter = tokio::spawn(reporter_task(
            Arc::clone(&self.shared),
            self.report_interval,
        ));
        let committer = tokio::spawn(auto_commit_task(
            Arc::clone(&self.shared),
            self.auto_commit_interval,
        ));

        let mut workers = JoinSet::new();
        for wid in 0..self.worker_count {
            workers.spawn(worker_loop(Arc::clone(&self.shared), wid));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(error = %error, "worker task panicked");
            }
        }

        // Workers are gone (quiescence or external cancel); stop the
        // background tasks the same way.
        self.shared.token.cancel();
        await_background(reporter, "reporter").await;
        await_background(committer, "auto-commit").await;

        self.shared.store.commit().await?;

        let (visited, errors) = self.shared.metrics.snapshot();
        let uptime = self.shared.metrics.uptime();
        info!(visited, errors, uptime_secs = uptime.as_secs(), "crawl finished");

        Ok(CrawlSummary {
            visited,
            errors,
            uptime,
        })
    }
}

/// Awaits a background task, tolerating its cancellation.
async fn await_background(handle: JoinHandle<()>, name: &str) {
    if let Err(error) = handle.await {
        if !error.is_cancelled() {
            warn!(task = name, error = %error, "background task failed");
        }
    }
}

/// One crawl worker: dequeue, re-check, mark, fetch, feed the
/// controller, enqueue discovered links. A single URL's failure never
/// terminates the pool.
async fn worker_loop(shared: Arc<Shared>, wid: usize) {
    debug!(worker = wid, "worker started");

    while !shared.token.is_cancelled() {
        // Bracket the dequeue itself so a peer observing zero in-flight
        // knows nobody is about to receive work.
        shared.in_flight.fetch_add(1, Ordering::AcqRel);

        let item = match shared.store.dequeue().await {
            Ok(item) => item,
            Err(error) => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                warn!(worker = wid, error = %error, "dequeue failed");
                shared.metrics.inc_error();
                if idle_pause(&shared).await {
                    break;
                }
                continue;
            }
        };

        let Some((url, depth)) = item else {
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            if shared.quiescence_reached() {
                info!(worker = wid, "queue drained, initiating shutdown");
                shared.token.cancel();
                break;
            }
            if idle_pause(&shared).await {
                break;
            }
            continue;
        };

        shared.clear_idle();
        process_url(&shared, &url, depth).await;
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(worker = wid, "worker stopped");
}

/// Sleeps one idle-poll interval. Returns true when cancelled instead.
async fn idle_pause(shared: &Shared) -> bool {
    tokio::select! {
        () = shared.token.cancelled() => true,
        () = tokio::time::sleep(shared.idle_poll) => false,
    }
}

/// Processes one dequeued URL end to end.
///
/// Ordering: the visited mark happens before the fetch and before any
/// enqueue of discovered links, so a crash in between loses the
/// discovery but never re-fetches the URL.
async fn process_url(shared: &Shared, url: &str, depth: i64) {
    match shared.store.is_visited(url).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(error) => {
            shared.metrics.inc_error();
            warn!(url = %url, error = %error, "visited re-check failed");
            return;
        }
    }

    if let Err(error) = shared.store.mark_visited(url, depth).await {
        shared.metrics.inc_error();
        warn!(url = %url, error = %error, "mark visited failed");
        return;
    }
    shared.metrics.inc_visited();

    let outcome = shared.fetcher.fetch(url, shared.fetch_timeout).await;

    let adjusted = {
        let mut controller = shared.lock_controller();
        controller.record(outcome.success, outcome.rtt);
        controller.should_adjust().then(|| controller.adjust())
    };
    if let Some(new_limit) = adjusted {
        shared.fetcher.resize(new_limit);
        info!(concurrency = new_limit, "adjusted fetch concurrency");
    }

    let Some(body) = outcome.body else {
        shared.metrics.inc_error();
        if let Err(error) = shared
            .store
            .log_error(url, "fetch_failed", "HTTP error / timeout / non-200")
            .await
        {
            warn!(url = %url, error = %error, "error log write failed");
        }
        return;
    };

    let links = shared
        .parser
        .extract_links(&body, url, outcome.content_type.as_deref());
    let next_depth = depth + 1;
    for link in links {
        if !shared.policy.allowed(&link, next_depth) {
            continue;
        }
        if let Err(error) = shared.store.enqueue(&link, next_depth).await {
            shared.metrics.inc_error();
            warn!(url = %link, error = %error, "enqueue failed");
        }
    }
}

/// Periodic progress line; never crashes the crawl.
async fn reporter_task(shared: Arc<Shared>, interval: Duration) {
    loop {
        tokio::select! {
            () = shared.token.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }

        let (visited, errors) = shared.metrics.snapshot();
        let queue = match shared.store.queue_size().await {
            Ok(size) => size,
            Err(error) => {
                warn!(error = %error, "queue depth probe failed");
                continue;
            }
        };
        let uptime = shared.metrics.uptime().as_secs();
        #[allow(clippy::cast_precision_loss)]
        let rate = if uptime > 0 {
            visited as f64 / uptime as f64
        } else {
            0.0
        };
        info!(
            visited,
            queue,
            errors,
            uptime_secs = uptime,
            rate_urls_per_sec = format_args!("{rate:.2}"),
            "crawl metrics"
        );
    }
}

/// Timed durability: commits the store batch on an interval so a crash
/// loses at most the configured window of mutations.
async fn auto_commit_task(shared: Arc<Shared>, interval: Duration) {
    loop {
        tokio::select! {
            () = shared.token.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }

        match shared.store.commit().await {
            Ok(()) => debug!("timed store commit"),
            Err(error) => warn!(error = %error, "timed store commit failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::parser::DomainParser;
    use crate::policy::CrawlPolicy;

    /// In-memory fetcher serving canned pages; unknown URLs fail.
    struct StaticFetcher {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl Fetch for StaticFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> FetchOutcome {
            match self.pages.get(url) {
                Some(body) => FetchOutcome {
                    body: Some(body.clone()),
                    rtt: Duration::from_millis(10),
                    success: true,
                    content_type: Some("text/html".to_string()),
                },
                None => FetchOutcome {
                    body: None,
                    rtt: Duration::from_millis(10),
                    success: false,
                    content_type: None,
                },
            }
        }

        fn resize(&self, _new_limit: usize) {}
    }

    fn test_config() -> CrawlConfig {
        let mut config = CrawlConfig::new("https://a.test/");
        config.worker_count = 20;
        config.idle_poll = Duration::from_millis(20);
        config.quiescence_grace = Duration::from_millis(100);
        config.report_interval = Duration::from_millis(50);
        config
    }

    fn crawler_with_pages(
        store: Store,
        pages: HashMap<String, String>,
        config: &CrawlConfig,
    ) -> Crawler {
        Crawler::new(
            store,
            Arc::new(StaticFetcher { pages }),
            Arc::new(DomainParser::new("a.test")),
            Arc::new(CrawlPolicy::default()),
            Arc::new(Metrics::new()),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_worker_count_below_controller_max() {
        let mut config = test_config();
        config.worker_count = 5; // controller max is 20

        let store = tokio_test::block_on(Store::connect_in_memory()).unwrap();
        let result = Crawler::new(
            store,
            Arc::new(StaticFetcher {
                pages: HashMap::new(),
            }),
            Arc::new(DomainParser::new("a.test")),
            Arc::new(CrawlPolicy::default()),
            Arc::new(Metrics::new()),
            &config,
        );
        assert!(matches!(
            result,
            Err(CrawlError::InsufficientWorkers { workers: 5, max: 20 })
        ));
    }

    #[tokio::test]
    async fn test_crawl_terminates_on_single_self_linking_page() {
        let store = Store::connect_in_memory().await.unwrap();
        let pages = HashMap::from([(
            "https://a.test/".to_string(),
            r#"<a href="/">loop</a>"#.to_string(),
        )]);

        let config = test_config();
        let crawler = crawler_with_pages(store.clone(), pages, &config);
        let summary = crawler.run("https://a.test/", Vec::new()).await.unwrap();

        assert_eq!(summary.visited, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(store.queue_size().await.unwrap(), 0);
        assert_eq!(store.error_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_counted_and_logged() {
        let store = Store::connect_in_memory().await.unwrap();
        let config = test_config();
        let crawler = crawler_with_pages(store.clone(), HashMap::new(), &config);

        let summary = crawler.run("https://a.test/", Vec::new()).await.unwrap();

        assert_eq!(summary.visited, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(store.error_count().await.unwrap(), 1);
        // Failed URLs stay visited and are not retried.
        assert!(store.is_visited("https://a.test/").await.unwrap());
    }

    #[tokio::test]
    async fn test_external_cancel_stops_the_crawl() {
        let store = Store::connect_in_memory().await.unwrap();
        // A two-page loop keeps discovering already-visited links, so the
        // crawl would only stop via quiescence; cancel it early instead.
        let pages = HashMap::from([
            (
                "https://a.test/".to_string(),
                r#"<a href="/b">b</a>"#.to_string(),
            ),
            (
                "https://a.test/b".to_string(),
                r#"<a href="/">home</a>"#.to_string(),
            ),
        ]);

        let mut config = test_config();
        config.quiescence_grace = Duration::from_secs(60);
        let crawler = Arc::new(crawler_with_pages(store.clone(), pages, &config));

        let runner = Arc::clone(&crawler);
        let handle = tokio::spawn(async move { runner.run("https://a.test/", Vec::new()).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        crawler.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.visited >= 1);
    }

    #[tokio::test]
    async fn test_sitemap_seeds_enter_at_depth_one() {
        let store = Store::connect_in_memory().await.unwrap();
        let pages = HashMap::from([
            ("https://a.test/".to_string(), String::new()),
            ("https://a.test/from-sitemap".to_string(), String::new()),
        ]);

        let config = test_config();
        let crawler = crawler_with_pages(store.clone(), pages, &config);
        let summary = crawler
            .run(
                "https://a.test/",
                vec!["https://a.test/from-sitemap".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(summary.visited, 2);
        assert!(store.is_visited("https://a.test/from-sitemap").await.unwrap());
    }
}
