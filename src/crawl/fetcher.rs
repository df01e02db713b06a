//! HTTP fetch under a dynamically resizable permit pool.
//!
//! The [`Fetch`] trait is the seam the coordinator crawls through; the
//! production [`HttpFetcher`] wraps one long-lived `reqwest` client whose
//! in-flight request count is capped by a semaphore. The cap follows the
//! concurrency controller: growth releases permits immediately, shrink is
//! passive — in-flight fetches are never cancelled, their permits are
//! simply swallowed on release until the pool matches the new cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default per-request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a worker needs to know about one fetch attempt.
///
/// Failures are folded in rather than raised: a timeout, connection
/// error, non-200 status, or body decode failure yields
/// `success == false` with `body == None` and the rtt measured from start
/// to the point of failure.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Decoded response body; present only on success.
    pub body: Option<String>,
    /// Round-trip time from request start to completion or failure.
    pub rtt: Duration,
    /// True only for HTTP status 200.
    pub success: bool,
    /// Content-Type header, when the server answered at all.
    pub content_type: Option<String>,
}

impl FetchOutcome {
    fn failure(rtt: Duration, content_type: Option<String>) -> Self {
        Self {
            body: None,
            rtt,
            success: false,
            content_type,
        }
    }
}

/// Capability to retrieve a URL's body under a parallelism cap.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Retrieves `url`, waiting for a permit first.
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome;

    /// Applies a new in-flight cap. Growth takes effect immediately;
    /// shrink must never cancel an in-flight request.
    fn resize(&self, new_limit: usize);
}

/// `reqwest`-backed fetcher with a resizable counting permit pool.
///
/// One HTTP session (connection pool, gzip, fixed User-Agent) is built at
/// construction and lives until drop. Per-request resources unwind on
/// every return path; the permit is released or swallowed by RAII.
///
/// Pool bookkeeping invariant: with `F` permits in flight, `A` idle in
/// the semaphore, and `D` owed to an unfinished shrink,
/// `F + A - D == capacity` at all times.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    permits: Arc<Semaphore>,
    /// Current cap; mutated only under the lock so concurrent resizes
    /// cannot interleave their permit arithmetic.
    capacity: Mutex<usize>,
    /// Permits owed after a shrink exceeded the idle pool; swallowed as
    /// in-flight fetches retire.
    deficit: AtomicUsize,
}

impl HttpFetcher {
    /// Builds the fetcher with `initial_limit` permits and a fixed
    /// User-Agent.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error if the HTTP client cannot be
    /// constructed.
    pub fn new(user_agent: &str, initial_limit: usize) -> Result<Self, reqwest::Error> {
        let initial_limit = initial_limit.max(1);
        let client = Client::builder().user_agent(user_agent).gzip(true).build()?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(initial_limit)),
            capacity: Mutex::new(initial_limit),
            deficit: AtomicUsize::new(0),
        })
    }

    /// Permits currently idle; diagnostics and test hook.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Current in-flight cap.
    #[must_use]
    pub fn capacity(&self) -> usize {
        *self
            .capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases a permit, or swallows it against an outstanding shrink.
    fn retire(&self, permit: OwnedSemaphorePermit) {
        let mut owed = self.deficit.load(Ordering::Acquire);
        while owed > 0 {
            match self.deficit.compare_exchange(
                owed,
                owed - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    permit.forget();
                    return;
                }
                Err(current) => owed = current,
            }
        }
        drop(permit);
    }

    async fn fetch_inner(&self, url: &str, timeout: Duration) -> FetchOutcome {
        let start = Instant::now();

        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(url = %url, error = %error, "request failed");
                return FetchOutcome::failure(start.elapsed(), None);
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(std::string::ToString::to_string);

        if status != StatusCode::OK {
            debug!(url = %url, status = status.as_u16(), "non-200 response");
            return FetchOutcome::failure(start.elapsed(), content_type);
        }

        match response.text().await {
            Ok(body) => FetchOutcome {
                body: Some(body),
                rtt: start.elapsed(),
                success: true,
                content_type,
            },
            Err(error) => {
                debug!(url = %url, error = %error, "body decode failed");
                FetchOutcome::failure(start.elapsed(), content_type)
            }
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_closed) => {
                // Only reachable if the semaphore were closed, which this
                // type never does; treat it as an instant failure.
                warn!(url = %url, "permit pool closed");
                return FetchOutcome::failure(Duration::ZERO, None);
            }
        };

        let outcome = self.fetch_inner(url, timeout).await;
        self.retire(permit);
        outcome
    }

    fn resize(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let mut capacity = self
            .capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if new_limit > *capacity {
            // Cancel any owed shrink first, then release the rest.
            let mut remaining = new_limit - *capacity;
            loop {
                let owed = self.deficit.load(Ordering::Acquire);
                if owed == 0 {
                    break;
                }
                let take = owed.min(remaining);
                if self
                    .deficit
                    .compare_exchange(owed, owed - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    remaining -= take;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            if remaining > 0 {
                self.permits.add_permits(remaining);
            }
        } else if new_limit < *capacity {
            // Take idle permits now; the rest is owed and swallowed as
            // in-flight fetches retire. Nothing is cancelled.
            let shrink = *capacity - new_limit;
            let forgotten = self.permits.forget_permits(shrink);
            if forgotten < shrink {
                self.deficit.fetch_add(shrink - forgotten, Ordering::AcqRel);
            }
        }

        *capacity = new_limit;
    }
}
