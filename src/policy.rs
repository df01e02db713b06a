//! URL admission policy.
//!
//! The coordinator asks the policy before enqueueing any discovered link.
//! Rejection is silent: a filtered URL is simply never queued and is not
//! counted as an error.

use url::Url;

/// Predicate deciding whether a URL at a given depth enters the queue.
pub trait AdmissionPolicy: Send + Sync {
    /// True when `url` may be crawled at `depth`.
    fn allowed(&self, url: &str, depth: i64) -> bool;
}

/// Default maximum crawl depth.
pub const DEFAULT_MAX_DEPTH: i64 = 3;

/// Relaxed depth used by full-site mode; still bounded.
pub const FULL_SITE_MAX_DEPTH: i64 = 8;

/// Path suffixes excluded from crawling by default.
pub const DEFAULT_DENY_EXTENSIONS: &[&str] = &[".pdf", ".jpg", ".png", ".zip", ".exe", ".mp4"];

/// Depth- and path-based admission policy.
///
/// Rejects URLs beyond `max_depth`, URLs whose path ends in a denied
/// extension, and, when a prefix allowlist is configured, URLs whose path
/// starts with none of the prefixes. URLs that do not parse are rejected
/// outright since they could never be fetched.
#[derive(Debug, Clone)]
pub struct CrawlPolicy {
    max_depth: i64,
    deny_extensions: Vec<String>,
    allow_path_prefixes: Option<Vec<String>>,
}

impl Default for CrawlPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, None, None)
    }
}

impl CrawlPolicy {
    /// Creates a policy; `None` arguments select the defaults (standard
    /// denied extensions, no prefix allowlist).
    #[must_use]
    pub fn new(
        max_depth: i64,
        deny_extensions: Option<Vec<String>>,
        allow_path_prefixes: Option<Vec<String>>,
    ) -> Self {
        let deny_extensions = deny_extensions.unwrap_or_else(|| {
            DEFAULT_DENY_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect()
        });
        Self {
            max_depth,
            deny_extensions,
            allow_path_prefixes,
        }
    }

    /// Configured depth cap.
    #[must_use]
    pub fn max_depth(&self) -> i64 {
        self.max_depth
    }
}

impl AdmissionPolicy for CrawlPolicy {
    fn allowed(&self, url: &str, depth: i64) -> bool {
        if depth > self.max_depth {
            return false;
        }

        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let path = parsed.path().to_lowercase();

        if self.deny_extensions.iter().any(|ext| path.ends_with(ext)) {
            return false;
        }

        match &self.allow_path_prefixes {
            Some(prefixes) => prefixes.iter().any(|prefix| path.starts_with(prefix)),
            None => true,
        }
    }
}

/// Admits every URL at any depth; selected by the experimental
/// no-policy mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl AdmissionPolicy for AllowAllPolicy {
    fn allowed(&self, _url: &str, _depth: i64) -> bool {
        true
    }
}
