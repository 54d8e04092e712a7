//! Crawl engine
//!
//! Admission (filters, dedup, robots), per-destination throttling,
//! response caching and the dispatch pipeline that ties them together.

pub mod cache;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod hooks;
pub mod limits;
pub mod robots;
pub mod transport;

pub use cache::{Cache, CachedResponse, FileCache, MemoryCache};
pub use dedup::{fingerprint, Fingerprinter, MemoryVisitedStore, SledVisitedStore, VisitedStore};
pub use dispatcher::{CrawlStats, Crawler, Outcome, SkipReason};
pub use error::CrawlError;
pub use extractor::{Extraction, Extractor, HtmlLinkExtractor};
pub use fetcher::FetchExecutor;
pub use hooks::{Follow, HeaderDecision, RequestDecision};
pub use limits::{LimitRule, Limiter, Slot, Throttle};
pub use robots::{RobotsCache, RobotsPolicy};
pub use transport::{ExchangeOptions, ReqwestTransport, Transport, TransportResponse};

/// Query parameters that never change the resource being addressed
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "sid",
    "sessionid",
];

/// Canonical form of a URL for fingerprinting
///
/// Drops the fragment and tracking parameters, strips a trailing slash on
/// non-root paths and sorts the query. Scheme and host are already
/// lowercase after parsing; path and query keep their case.
pub(crate) fn normalize_url(url: &url::Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(&path[..path.len() - 1]);
    }

    if let Some(query) = normalized.query() {
        let mut params: Vec<_> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let key = p.split('=').next().unwrap_or("");
                !TRACKING_PARAMS.contains(&key.to_lowercase().as_str())
            })
            .map(str::to_string)
            .collect();

        if params.is_empty() {
            normalized.set_query(None);
        } else {
            params.sort();
            normalized.set_query(Some(&params.join("&")));
        }
    }

    normalized.into()
}
