//! Optional sitemap.xml seed discovery.
//!
//! When enabled, the crawl seeds its queue from `/sitemap.xml` at depth 1
//! in addition to the start URL. A sitemap index is followed one level
//! into its child sitemaps. Every failure here (missing file, wrong
//! content type, malformed XML) degrades to an empty seed list with a
//! warning; the crawl proceeds from the start URL alone.

use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};
use url::Url;

/// Timeout for sitemap requests; more generous than page fetches since
/// sitemap files can be large.
pub const SITEMAP_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches `/sitemap.xml` relative to `base_url` and returns the listed
/// URLs. A `sitemapindex` root is followed into each child sitemap.
pub async fn fetch_sitemap_urls(client: &Client, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        eprintln!("DIAG base url parse failed for {base_url}");
        warn!(base_url = %base_url, "cannot derive sitemap location from start URL");
        return Vec::new();
    };
    let Ok(sitemap_url) = base.join("/sitemap.xml") else {
        eprintln!("DIAG join failed for base {base}");
        return Vec::new();
    };
    eprintln!("DIAG sitemap_url = {sitemap_url}");

    let Some(body) = fetch_xml(client, sitemap_url.as_str()).await else {
        eprintln!("DIAG fetch_xml returned None for {sitemap_url}");
        warn!(url = %sitemap_url, "sitemap.xml unavailable or not XML, skipping");
        return Vec::new();
    };
    eprintln!("DIAG body len = {}", body.len());

    match root_element(&body).as_deref() {
        Some("urlset") => collect_locs(&body),
        Some("sitemapindex") => {
            let mut urls = Vec::new();
            for child in collect_locs(&body) {
                let Some(child_body) = fetch_xml(client, &child).await else {
                    debug!(url = %child, "child sitemap unavailable, skipping");
                    continue;
                };
                if root_element(&child_body).as_deref() == Some("urlset") {
                    urls.extend(collect_locs(&child_body));
                }
            }
            urls
        }
        _ => {
            warn!(url = %sitemap_url, "sitemap.xml is not a valid sitemap, skipping");
            Vec::new()
        }
    }
}

/// GETs a URL and returns its body when the response is a successful XML
/// document; anything else is `None`.
async fn fetch_xml(client: &Client, url: &str) -> Option<String> {
    let response = match client
        .get(url)
        .timeout(SITEMAP_TIMEOUT)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("DIAG fetch_xml send error for {url}: {e:?}");
            return None;
        }
    };

    if !response.status().is_success() {
        eprintln!("DIAG fetch_xml non-success status {} for {url}", response.status());
        return None;
    }

    let is_xml = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_lowercase().contains("xml"));
    eprintln!("DIAG content-type header = {:?}, is_xml={is_xml}", response.headers().get(CONTENT_TYPE));
    if !is_xml {
        return None;
    }

    response.text().await.ok()
}

/// Local name of the document's root element, namespace stripped.
fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(element) | Event::Empty(element)) => {
                return String::from_utf8(element.local_name().as_ref().to_vec()).ok();
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Text content of every `<loc>` element in the document.
fn collect_locs(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let mut locs = Vec::new();
    let mut in_loc = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                in_loc = element.local_name().as_ref() == b"loc";
            }
            Ok(Event::End(element)) => {
                if element.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(Event::Text(text)) => {
                if in_loc {
                    if let Ok(value) = text.unescape() {
                        let value = value.trim();
                        if !value.is_empty() {
                            locs.push(value.to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
    }

    locs
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://a.test/page1</loc></url>
  <url><loc>https://a.test/page2</loc></url>
</urlset>"#;

    fn xml_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("Content-Type", "application/xml")
            .set_body_string(body)
    }

    #[test]
    fn test_root_element_strips_namespace() {
        assert_eq!(root_element(URLSET).as_deref(), Some("urlset"));
        assert_eq!(root_element("<html></html>").as_deref(), Some("html"));
        assert_eq!(root_element("not xml at all"), None);
    }

    #[test]
    fn test_collect_locs_reads_text_content() {
        let locs = collect_locs(URLSET);
        assert_eq!(locs, vec!["https://a.test/page1", "https://a.test/page2"]);
    }

    #[tokio::test]
    async fn test_urlset_sitemap_yields_listed_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(xml_response(URLSET))
            .mount(&server)
            .await;

        let client = Client::new();
        let urls = fetch_sitemap_urls(&client, &server.uri()).await;
        assert_eq!(urls, vec!["https://a.test/page1", "https://a.test/page2"]);
    }

    #[tokio::test]
    async fn test_sitemap_index_is_followed_one_level() {
        let server = MockServer::start().await;
        let index = format!(
            r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>{}/child.xml</loc></sitemap>
</sitemapindex>"#,
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(xml_response(&index))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/child.xml"))
            .respond_with(xml_response(URLSET))
            .mount(&server)
            .await;

        let client = Client::new();
        let urls = fetch_sitemap_urls(&client, &server.uri()).await;
        assert_eq!(urls, vec!["https://a.test/page1", "https://a.test/page2"]);
    }

    #[tokio::test]
    async fn test_non_xml_content_type_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_body_string("<html>not a sitemap</html>"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        assert!(fetch_sitemap_urls(&client, &server.uri()).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_root_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(xml_response("<feed><loc>https://a.test/x</loc></feed>"))
            .mount(&server)
            .await;

        let client = Client::new();
        assert!(fetch_sitemap_urls(&client, &server.uri()).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sitemap_yields_empty_seed_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        assert!(fetch_sitemap_urls(&client, &server.uri()).await.is_empty());
    }
}
