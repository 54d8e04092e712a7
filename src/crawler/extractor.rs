//! Content extraction boundary
//!
//! An [`Extractor`] turns a response into candidate links plus arbitrary
//! structured records. The dispatcher only calls extractors whose
//! `accepts` matches the response content type.

use scraper::{Html, Selector};
use serde_json::json;
use std::collections::HashSet;
use url::Url;

use super::CrawlError;
use crate::types::Response;

/// Output of one extraction pass
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Absolute http(s) links, deduplicated, in document order
    pub links: Vec<Url>,
    pub records: Vec<serde_json::Value>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.records.is_empty()
    }
}

pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this extractor understands the given content type
    fn accepts(&self, content_type: &str) -> bool;

    fn extract(&self, response: &Response) -> Result<Extraction, CrawlError>;
}

/// Collects `a[href]` links and the page title from HTML
#[derive(Debug, Clone, Default)]
pub struct HtmlLinkExtractor;

impl HtmlLinkExtractor {
    pub fn new() -> Self {
        Self
    }

    fn selector(css: &str) -> Result<Selector, CrawlError> {
        Selector::parse(css).map_err(|e| CrawlError::Config(format!("bad selector {}: {:?}", css, e)))
    }
}

impl Extractor for HtmlLinkExtractor {
    fn name(&self) -> &str {
        "html-links"
    }

    fn accepts(&self, content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        ct.is_empty() || ct.contains("text/html") || ct.contains("application/xhtml")
    }

    fn extract(&self, response: &Response) -> Result<Extraction, CrawlError> {
        let document = Html::parse_document(&response.text());

        // <base href> overrides the document URL for relative links
        let base_selector = Self::selector("base[href]")?;
        let base = document
            .select(&base_selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .and_then(|href| response.url().join(href).ok())
            .unwrap_or_else(|| response.url().clone());

        let link_selector = Self::selector("a[href]")?;
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for element in document.select(&link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let Ok(mut url) = base.join(href) else {
                continue;
            };
            if url.scheme() != "http" && url.scheme() != "https" {
                continue;
            }
            url.set_fragment(None);
            if seen.insert(url.as_str().to_string()) {
                links.push(url);
            }
        }

        let title_selector = Self::selector("title")?;
        let title = document
            .select(&title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        let records = vec![json!({
            "url": response.url().as_str(),
            "status": response.status,
            "title": title,
            "links": links.len(),
        })];

        Ok(Extraction { links, records })
    }
}
