//! Dispatcher types: outcomes, skip reasons and statistics

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crawler::CrawlError;
use crate::types::Request;

/// Why a candidate was dropped before any fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    AlreadyVisited,
    ForbiddenDomain,
    UrlFiltered,
    MaxDepth,
    RobotsDisallowed,
    MaxRequests,
}

impl SkipReason {
    pub const ALL: [SkipReason; 6] = [
        Self::AlreadyVisited,
        Self::ForbiddenDomain,
        Self::UrlFiltered,
        Self::MaxDepth,
        Self::RobotsDisallowed,
        Self::MaxRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyVisited => "already_visited",
            Self::ForbiddenDomain => "forbidden_domain",
            Self::UrlFiltered => "url_filtered",
            Self::MaxDepth => "max_depth",
            Self::RobotsDisallowed => "robots_disallowed",
            Self::MaxRequests => "max_requests",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    /// Error reported when an explicit entry point is dropped
    pub(crate) fn into_error(self, request: &Request, max_depth: u32, max_requests: u64) -> CrawlError {
        let url = request.url.to_string();
        match self {
            Self::AlreadyVisited => CrawlError::AlreadyVisited(url),
            Self::ForbiddenDomain => CrawlError::ForbiddenDomain(url),
            Self::UrlFiltered => CrawlError::UrlFiltered(url),
            Self::MaxDepth => CrawlError::MaxDepth(max_depth),
            Self::RobotsDisallowed => CrawlError::RobotsDisallowed(url),
            Self::MaxRequests => CrawlError::MaxRequests(max_requests),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one dispatched request
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Response handed to the hooks, live or from cache
    Delivered { status: u16, cached: bool },
    /// Admitted and handed to a background task
    Scheduled,
    Skipped(SkipReason),
    /// Stopped by a request or header hook
    Aborted,
    /// A request hook asked for this request to be scheduled again later
    Deferred(Request),
    /// Fetch or delivery failed; the error hooks have seen it
    Failed { error: String },
}

impl Outcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Live counters
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub admitted: AtomicU64,
    pub delivered: AtomicU64,
    pub cache_hits: AtomicU64,
    pub failed: AtomicU64,
    pub aborted: AtomicU64,
    pub deferred: AtomicU64,
    skipped: [AtomicU64; 6],
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skip(&self, reason: SkipReason) {
        self.skipped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CrawlStats {
        let mut skipped = [0; 6];
        for (slot, counter) in skipped.iter_mut().zip(&self.skipped) {
            *slot = counter.load(Ordering::Relaxed);
        }
        CrawlStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            skipped,
        }
    }
}

/// Point-in-time crawl statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Requests that passed admission
    pub admitted: u64,
    /// Responses delivered to hooks (cache hits included)
    pub delivered: u64,
    pub cache_hits: u64,
    pub failed: u64,
    pub aborted: u64,
    pub deferred: u64,
    skipped: [u64; 6],
}

impl CrawlStats {
    pub fn skipped(&self, reason: SkipReason) -> u64 {
        self.skipped[reason.index()]
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.iter().sum()
    }
}

impl fmt::Display for CrawlStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "admitted={} delivered={} cache_hits={} failed={} aborted={} deferred={} skipped={}",
            self.admitted,
            self.delivered,
            self.cache_hits,
            self.failed,
            self.aborted,
            self.deferred,
            self.total_skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_counters_by_reason() {
        let counters = StatsCounters::default();
        counters.skip(SkipReason::AlreadyVisited);
        counters.skip(SkipReason::AlreadyVisited);
        counters.skip(SkipReason::MaxDepth);
        StatsCounters::incr(&counters.delivered);

        let stats = counters.snapshot();
        assert_eq!(stats.skipped(SkipReason::AlreadyVisited), 2);
        assert_eq!(stats.skipped(SkipReason::MaxDepth), 1);
        assert_eq!(stats.skipped(SkipReason::RobotsDisallowed), 0);
        assert_eq!(stats.total_skipped(), 3);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_skip_reason_indices_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for reason in SkipReason::ALL {
            assert!(seen.insert(reason.index()));
            assert!(reason.index() < 6);
        }
    }
}
