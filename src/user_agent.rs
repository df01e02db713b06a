//! Shared User-Agent string for crawl and sitemap HTTP traffic.
//!
//! Single source for the UA format so every request identifies the tool
//! consistently (good citizenship; RFC 9308).

/// Default User-Agent identifying the crawler and its version.
#[must_use]
pub(crate) fn default_crawler_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("crawler/{version} (site-mirroring-tool)")
}
