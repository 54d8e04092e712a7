//! Fetch executor: throttle admission, the exchange, and slot release

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::hooks::HeaderDecision;
use super::limits::Throttle;
use super::transport::{ExchangeOptions, Transport, TransportResponse};
use super::CrawlError;
use crate::types::{Request, ResponseHead};

/// Fetch counters
#[derive(Debug, Default)]
pub struct FetchStats {
    pub total_fetches: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub cancelled: AtomicU64,
    pub throttled: AtomicU64,
}

/// Performs one exchange under the matching limit rule
pub struct FetchExecutor {
    transport: Arc<dyn Transport>,
    throttle: Arc<Throttle>,
    max_body_size: usize,
    stats: FetchStats,
}

impl FetchExecutor {
    pub fn new(transport: Arc<dyn Transport>, throttle: Arc<Throttle>, max_body_size: usize) -> Self {
        Self {
            transport,
            throttle,
            max_body_size,
            stats: FetchStats::default(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    /// Execute `request`.
    ///
    /// Waits for a slot of the first matching limit rule, performs the
    /// exchange and releases the slot (sleeping out the rule's delay) on
    /// success and failure alike. Cancelling the request's token interrupts
    /// both the wait and the exchange and returns at once; the slot then
    /// frees itself once the delay has passed.
    pub async fn execute(
        &self,
        request: &Request,
        on_headers: Option<&(dyn Fn(&ResponseHead) -> HeaderDecision + Send + Sync)>,
    ) -> Result<TransportResponse, CrawlError> {
        self.stats.total_fetches.fetch_add(1, Ordering::Relaxed);
        let cancel = request.cancellation_token();
        if cancel.is_cancelled() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(CrawlError::Cancelled);
        }

        let limiter = self.throttle.matching(request.host());
        let slot = match &limiter {
            Some(limiter) => {
                self.stats.throttled.fetch_add(1, Ordering::Relaxed);
                let admitted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    slot = limiter.admit() => Some(slot),
                };
                match admitted {
                    Some(slot) => Some(slot?),
                    None => {
                        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                        return Err(CrawlError::Cancelled);
                    }
                }
            }
            None => None,
        };

        let options = ExchangeOptions {
            max_body_size: self.max_body_size,
            on_headers,
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
            result = self.transport.perform(request, &options) => result,
        };

        // A cancelled caller returns now; dropping the slot frees it after its delay
        match (slot, &result) {
            (Some(slot), Err(CrawlError::Cancelled)) => drop(slot),
            (Some(slot), _) => slot.release().await,
            (None, _) => {}
        }

        match &result {
            Ok(response) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Fetched {} {} -> {} ({} bytes, {:?})",
                    request.method,
                    request.url,
                    response.head.status,
                    response.body.len(),
                    start.elapsed()
                );
            }
            Err(CrawlError::Cancelled) => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Cancelled {} {}", request.method, request.url);
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!("Fetch of {} failed: {}", request.url, e);
            }
        }

        result
    }
}
