//! Error taxonomy for the crawl engine

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while admitting, fetching or delivering a request
#[derive(Debug, Error)]
pub enum CrawlError {
    // Configuration errors: raised at setup, never mid-crawl
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid limit rule: {0}")]
    InvalidLimitRule(String),
    #[error("Failed to parse URL: {0}")]
    InvalidUrl(String),

    // Admission drops: only surfaced as errors for explicit entry points
    #[error("Domain not allowed: {0}")]
    ForbiddenDomain(String),
    #[error("URL rejected by filters: {0}")]
    UrlFiltered(String),
    #[error("Max depth {0} exceeded")]
    MaxDepth(u32),
    #[error("URL already visited: {0}")]
    AlreadyVisited(String),
    #[error("URL blocked by robots.txt: {0}")]
    RobotsDisallowed(String),
    #[error("Max request count {0} reached")]
    MaxRequests(u64),

    // Transport failures
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Request cancelled")]
    Cancelled,
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    // Policy abort
    #[error("Response aborted after headers")]
    AbortedAfterHeaders,

    // Storage / backend errors
    #[error("Queue is full (max size {0})")]
    QueueFull(usize),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

impl CrawlError {
    /// Network-level failure of a single exchange
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Transport(_) | Self::Timeout(_) | Self::Cancelled | Self::HttpStatus(_)
        )
    }

    /// A deliberate stop chosen by a hook, not a network failure
    pub fn is_policy_abort(&self) -> bool {
        matches!(self, Self::AbortedAfterHeaders)
    }

    /// Request was dropped by an admission check
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::ForbiddenDomain(_)
                | Self::UrlFiltered(_)
                | Self::MaxDepth(_)
                | Self::AlreadyVisited(_)
                | Self::RobotsDisallowed(_)
                | Self::MaxRequests(_)
        )
    }
}

impl From<sled::Error> for CrawlError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
