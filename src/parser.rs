//! Same-domain link extraction.
//!
//! Successful fetches hand their body here; the parser returns the set of
//! absolute, fragment-stripped URLs on the seed's host. XML-flavoured
//! bodies (per the response Content-Type) are scanned with an XML reader,
//! everything else goes through an HTML parse.

use std::collections::HashSet;

use quick_xml::Reader;
use quick_xml::events::Event;
use scraper::{Html, Selector};
use url::Url;

/// Link extraction contract consumed by the coordinator.
pub trait ExtractLinks: Send + Sync {
    /// Returns absolute same-domain URLs discovered in `body`, resolved
    /// against `base_url` with fragments removed.
    fn extract_links(
        &self,
        body: &str,
        base_url: &str,
        content_type: Option<&str>,
    ) -> HashSet<String>;
}

/// Extracts anchors and keeps only links on the configured host.
#[derive(Debug, Clone)]
pub struct DomainParser {
    domain: String,
    anchor_selector: Selector,
}

impl DomainParser {
    /// Creates a parser scoped to `domain` (a bare host name).
    ///
    /// # Panics
    ///
    /// Panics if the static anchor selector fails to parse, which cannot
    /// happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            anchor_selector: Selector::parse("a[href]").expect("static selector is valid"),
        }
    }

    /// Host this parser keeps links for.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl ExtractLinks for DomainParser {
    fn extract_links(
        &self,
        body: &str,
        base_url: &str,
        content_type: Option<&str>,
    ) -> HashSet<String> {
        let Ok(base) = Url::parse(base_url) else {
            return HashSet::new();
        };

        let is_xml = content_type.is_some_and(|value| value.to_lowercase().contains("xml"));
        let hrefs = if is_xml {
            xml_hrefs(body)
        } else {
            html_hrefs(body, &self.anchor_selector)
        };

        hrefs
            .iter()
            .filter_map(|href| {
                let mut resolved = base.join(href).ok()?;
                resolved.set_fragment(None);
                (resolved.host_str() == Some(self.domain.as_str()))
                    .then(|| resolved.to_string())
            })
            .collect()
    }
}

/// Collects `href` attributes from `a` elements of an HTML document.
fn html_hrefs(body: &str, anchor_selector: &Selector) -> Vec<String> {
    let document = Html::parse_document(body);
    document
        .select(anchor_selector)
        .filter_map(|element| element.value().attr("href"))
        .map(std::string::ToString::to_string)
        .collect()
}

/// Collects `href` attributes from `a` elements of an XML document.
/// Stops quietly at the first malformed event.
fn xml_hrefs(body: &str) -> Vec<String> {
    let mut reader = Reader::from_str(body);
    let mut hrefs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(element) | Event::Empty(element)) => {
                if element.local_name().as_ref() != b"a" {
                    continue;
                }
                for attribute in element.attributes().flatten() {
                    if attribute.key.local_name().as_ref() == b"href" {
                        if let Ok(value) = attribute.unescape_value() {
                            hrefs.push(value.into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hrefs
}
