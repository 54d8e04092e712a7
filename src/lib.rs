//! trawl: a polite, hook-driven web crawl engine
//!
//! Requests flow through a single dispatch pipeline featuring:
//! - URL, domain and depth filters plus robots.txt checks
//! - Fingerprint deduplication with pluggable visited stores (memory, sled)
//! - Per-destination throttling via ordered limit rules
//! - An on-disk response cache keyed by request URL
//! - Request, header, response, extraction and error hooks
//! - A worker queue with in-memory or sled-backed storage

pub mod config;
pub mod crawler;
pub mod queue;
pub mod types;
pub mod util;

pub use config::Config;
pub use crawler::{CrawlError, CrawlStats, Crawler, Follow, LimitRule, Outcome, SkipReason};
pub use queue::{Queue, QueueHandle};
pub use types::*;
