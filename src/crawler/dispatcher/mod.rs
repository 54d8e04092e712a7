//! Dispatcher: admission, execution and delivery of requests
//!
//! Every candidate request goes through
//! filters → dedup → robots → request cap → request hooks → cache → fetch,
//! and a successful fetch is handed to the response, extraction and
//! scraped hooks in that order. Requests the hooks produce are dispatched
//! inline (default), as background tasks (`async_mode`), or handed to an
//! attached [`Queue`](crate::queue::Queue).

mod filter;
mod types;

pub use types::{CrawlStats, Outcome, SkipReason};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use filter::UrlFilter;
use types::StatsCounters;

use super::cache::{is_cacheable, Cache, FileCache};
use super::dedup::{fingerprint, Fingerprinter, MemoryVisitedStore, VisitedStore};
use super::extractor::{Extraction, Extractor, HtmlLinkExtractor};
use super::fetcher::FetchExecutor;
use super::hooks::{
    Candidate, ErrorHook, ExtractHook, Follow, HeaderDecision, HeadersHook, RequestDecision,
    RequestHook, ResponseHook, ScrapedHook, SkippedHook,
};
use super::limits::{LimitRule, Throttle};
use super::robots::RobotsCache;
use super::transport::{ReqwestTransport, Transport, TransportConfig};
use super::CrawlError;
use crate::config::CrawlerConfig;
use crate::queue::QueueHandle;
use crate::types::{Method, Request, Response, ResponseHead};

/// How admission drops are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Explicitly submitted by the caller: drops are errors
    Entry,
    /// Produced by a hook or pulled from a queue: drops are silent
    Derived,
}

#[derive(Default)]
struct Hooks {
    request: RwLock<Vec<RequestHook>>,
    headers: RwLock<Vec<HeadersHook>>,
    response: RwLock<Vec<ResponseHook>>,
    extract: RwLock<Vec<(Arc<dyn Extractor>, ExtractHook)>>,
    error: RwLock<Vec<ErrorHook>>,
    scraped: RwLock<Vec<ScrapedHook>>,
    skipped: RwLock<Vec<SkippedHook>>,
}

struct Inner {
    config: CrawlerConfig,
    filter: UrlFilter,
    executor: FetchExecutor,
    robots: Option<RobotsCache>,
    visited: RwLock<Arc<dyn VisitedStore>>,
    cache: RwLock<Option<Arc<dyn Cache>>>,
    fingerprinter: RwLock<Fingerprinter>,
    queue: RwLock<Option<QueueHandle>>,
    hooks: Hooks,
    stats: StatsCounters,
    next_id: AtomicU64,
    /// Requests counted against `max_requests`
    issued: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// The crawl engine. Clones share all state.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<Inner>,
}

impl Crawler {
    /// Build a crawler that fetches over HTTP with `reqwest`
    pub fn new(config: CrawlerConfig) -> Result<Self, CrawlError> {
        let transport = ReqwestTransport::new(&TransportConfig {
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout(),
            ..Default::default()
        })?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Build a crawler on top of a custom transport
    pub fn with_transport(
        config: CrawlerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CrawlError> {
        let filter = UrlFilter::from_config(&config)?;

        let throttle = Arc::new(Throttle::new());
        for rule in &config.limits {
            throttle.add_rule(LimitRule::from(rule))?;
        }

        let cache: Option<Arc<dyn Cache>> = match &config.cache_dir {
            Some(dir) => {
                let cache = FileCache::new(dir);
                cache.init()?;
                Some(Arc::new(cache))
            }
            None => None,
        };

        let robots = (!config.ignore_robots_txt)
            .then(|| RobotsCache::new(config.user_agent.clone(), config.robots_cache_size));

        let executor = FetchExecutor::new(transport, throttle, config.max_body_size);
        let default_fingerprint: Fingerprinter = Arc::new(fingerprint);

        Ok(Self {
            inner: Arc::new(Inner {
                filter,
                executor,
                robots,
                visited: RwLock::new(Arc::new(MemoryVisitedStore::new())),
                cache: RwLock::new(cache),
                fingerprinter: RwLock::new(default_fingerprint),
                queue: RwLock::new(None),
                hooks: Hooks::default(),
                stats: StatsCounters::default(),
                next_id: AtomicU64::new(0),
                issued: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Register a limit rule. Rules match in registration order.
    pub fn limit(&self, rule: LimitRule) -> Result<(), CrawlError> {
        self.inner.executor.throttle().add_rule(rule)
    }

    pub fn set_visited_store(&self, store: Arc<dyn VisitedStore>) {
        *self.inner.visited.write() = store;
    }

    /// Install a response cache, replacing any configured one
    pub fn set_cache(&self, cache: Arc<dyn Cache>) -> Result<(), CrawlError> {
        cache.init()?;
        if let Some(old) = self.inner.cache.write().replace(cache) {
            if let Err(e) = old.close() {
                warn!("Failed to close replaced cache: {}", e);
            }
        }
        Ok(())
    }

    /// Override how requests are reduced to dedup fingerprints
    pub fn set_fingerprinter<F>(&self, f: F)
    where
        F: Fn(&Request) -> u64 + Send + Sync + 'static,
    {
        *self.inner.fingerprinter.write() = Arc::new(f);
    }

    /// Route [`Follow::enqueue`] and deferred requests to a queue
    pub fn attach_queue(&self, queue: QueueHandle) {
        *self.inner.queue.write() = Some(queue);
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Called before a request is sent; may rewrite it or stop it
    pub fn on_request<F>(&self, f: F)
    where
        F: Fn(&mut Request) -> RequestDecision + Send + Sync + 'static,
    {
        self.inner.hooks.request.write().push(Arc::new(f));
    }

    /// Called once status and headers are known; `Abort` stops the download
    pub fn on_response_headers<F>(&self, f: F)
    where
        F: Fn(&ResponseHead, &Request) -> HeaderDecision + Send + Sync + 'static,
    {
        self.inner.hooks.headers.write().push(Arc::new(f));
    }

    pub fn on_response<F>(&self, f: F)
    where
        F: Fn(&Response, &mut Follow) + Send + Sync + 'static,
    {
        self.inner.hooks.response.write().push(Arc::new(f));
    }

    /// Run `extractor` on responses whose content type it accepts
    pub fn on_extract<E, F>(&self, extractor: E, f: F)
    where
        E: Extractor + 'static,
        F: Fn(&Response, &Extraction, &mut Follow) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .extract
            .write()
            .push((Arc::new(extractor), Arc::new(f)));
    }

    /// Shorthand for [`on_extract`](Self::on_extract) with [`HtmlLinkExtractor`]
    pub fn on_html<F>(&self, f: F)
    where
        F: Fn(&Response, &Extraction, &mut Follow) + Send + Sync + 'static,
    {
        self.on_extract(HtmlLinkExtractor::new(), f);
    }

    /// Called with the failed request, the response if one arrived, and the error
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Request, Option<&Response>, &CrawlError, &mut Follow) + Send + Sync + 'static,
    {
        self.inner.hooks.error.write().push(Arc::new(f));
    }

    /// Called after every other response hook
    pub fn on_scraped<F>(&self, f: F)
    where
        F: Fn(&Response, &mut Follow) + Send + Sync + 'static,
    {
        self.inner.hooks.scraped.write().push(Arc::new(f));
    }

    /// Called for every request dropped by admission
    pub fn on_skipped<F>(&self, f: F)
    where
        F: Fn(&Request, SkipReason) + Send + Sync + 'static,
    {
        self.inner.hooks.skipped.write().push(Arc::new(f));
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// GET `url`. Filter, robots and request-cap drops are returned as errors.
    pub async fn visit(&self, url: &str) -> Result<Outcome, CrawlError> {
        self.request(Request::parse(url)?).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<Outcome, CrawlError> {
        let mut request = Request::parse(url)?.with_body(body);
        request.method = Method::Post;
        self.request(request).await
    }

    /// Dispatch a caller-built request as an entry point. A request returned
    /// in [`Outcome::Deferred`] may be passed back here; it is not re-admitted.
    pub async fn request(&self, request: Request) -> Result<Outcome, CrawlError> {
        self.dispatch_as(request, Origin::Entry).await
    }

    /// Dispatch a request whose admission drops are reported as
    /// `Outcome::Skipped` rather than errors. Queue workers use this.
    pub async fn dispatch(&self, request: Request) -> Result<Outcome, CrawlError> {
        self.dispatch_as(request, Origin::Derived).await
    }

    /// Execute `request` again, skipping admission
    pub async fn retry(&self, mut request: Request) -> Outcome {
        request.deferred = false;
        self.deliver(request).await
    }

    /// Resolve once every background fetch (and everything it spawned) is done
    pub async fn wait(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    /// Cancel every in-flight and future fetch
    pub fn cancel(&self) {
        info!("Crawl cancelled");
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn stats(&self) -> CrawlStats {
        self.inner.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn dispatch_as(&self, mut request: Request, origin: Origin) -> Result<Outcome, CrawlError> {
        if self.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }

        if request.deferred {
            // Admitted on its first pass; admission would now see it as visited
            request.deferred = false;
        } else {
            if let Some(reason) = self.admit(&request).await? {
                return self.skipped(&request, reason, origin);
            }
            request.id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            StatsCounters::incr(&self.inner.stats.admitted);
        }

        if self.inner.config.async_mode {
            let this = self.clone();
            self.inner.tasks.spawn(async move {
                let url = request.url.clone();
                match this.deliver(request).await {
                    Outcome::Deferred(request) => this.requeue_deferred(request),
                    outcome => debug!("{} -> {:?}", url, outcome),
                }
            });
            return Ok(Outcome::Scheduled);
        }

        Ok(self.deliver(request).await)
    }

    /// First admission check that rejects `request`, if any
    async fn admit(&self, request: &Request) -> Result<Option<SkipReason>, CrawlError> {
        let inner = &self.inner;

        if let Err(reason) = inner.filter.check(request) {
            return Ok(Some(reason));
        }

        if !inner.config.allow_url_revisit {
            let fp = (inner.fingerprinter.read().clone())(request);
            let visited = inner.visited.read().clone();
            if visited.check_and_mark(fp)? {
                return Ok(Some(SkipReason::AlreadyVisited));
            }
        }

        if let Some(robots) = &inner.robots {
            let transport = inner.executor.transport().as_ref();
            if !robots.is_allowed(&request.url, transport).await {
                return Ok(Some(SkipReason::RobotsDisallowed));
            }
        }

        let cap = inner.config.max_requests;
        if cap > 0 {
            let under_cap = inner
                .issued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < cap).then_some(n + 1))
                .is_ok();
            if !under_cap {
                return Ok(Some(SkipReason::MaxRequests));
            }
        }

        Ok(None)
    }

    fn skipped(&self, request: &Request, reason: SkipReason, origin: Origin) -> Result<Outcome, CrawlError> {
        self.inner.stats.skip(reason);
        debug!("Skipped {} ({})", request.url, reason);

        let hooks = self.inner.hooks.skipped.read().clone();
        for hook in &hooks {
            hook(request, reason);
        }

        if origin == Origin::Entry && reason != SkipReason::AlreadyVisited {
            let config = &self.inner.config;
            return Err(reason.into_error(request, config.max_depth, config.max_requests));
        }
        Ok(Outcome::Skipped(reason))
    }

    /// Request hooks, cache, fetch and delivery for an admitted request
    async fn deliver(&self, mut request: Request) -> Outcome {
        match self.run_request_hooks(&mut request) {
            RequestDecision::Proceed => {}
            RequestDecision::Abort => {
                StatsCounters::incr(&self.inner.stats.aborted);
                debug!("Request hook aborted {}", request.url);
                return Outcome::Aborted;
            }
            RequestDecision::RetryLater => {
                StatsCounters::incr(&self.inner.stats.deferred);
                debug!("Request hook deferred {}", request.url);
                request.deferred = true;
                return Outcome::Deferred(request);
            }
        }

        let header_hooks = self.inner.hooks.headers.read().clone();
        let cache = self.inner.cache.read().clone().filter(|_| is_cacheable(&request));

        if let Some(cache) = &cache {
            match cache.get(&request) {
                Ok(Some(entry)) if entry.is_servable() => {
                    let head = ResponseHead {
                        status: entry.status,
                        headers: entry.headers.clone(),
                        url: request.url.clone(),
                    };
                    if header_hooks.iter().any(|h| h(&head, &request) == HeaderDecision::Abort) {
                        StatsCounters::incr(&self.inner.stats.aborted);
                        return Outcome::Aborted;
                    }
                    StatsCounters::incr(&self.inner.stats.cache_hits);
                    debug!("Cache hit for {}", request.url);
                    let response = entry.into_response(Arc::new(request));
                    return self.handle_response(response, true).await;
                }
                Ok(_) => {}
                Err(e) => warn!("Cache lookup for {} failed: {}", request.url, e),
            }
        }

        let check = |head: &ResponseHead| {
            if header_hooks.iter().any(|h| h(head, &request) == HeaderDecision::Abort) {
                HeaderDecision::Abort
            } else {
                HeaderDecision::Continue
            }
        };
        let on_headers: Option<&(dyn Fn(&ResponseHead) -> HeaderDecision + Send + Sync)> =
            if header_hooks.is_empty() {
                None
            } else {
                Some(&check)
            };

        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(CrawlError::Cancelled),
            result = self.inner.executor.execute(&request, on_headers) => result,
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(CrawlError::AbortedAfterHeaders) => {
                StatsCounters::incr(&self.inner.stats.aborted);
                return Outcome::Aborted;
            }
            Err(e) => return self.fail(Arc::new(request), None, e).await,
        };

        if fetched.head.url != request.url {
            self.reconcile_redirect(&mut request, fetched.head.url.clone());
        }

        let response = Response {
            status: fetched.head.status,
            headers: fetched.head.headers,
            body: fetched.body,
            request: Arc::new(request),
        };

        if let Some(cache) = &cache {
            if response.status < super::cache::SERVER_ERROR_THRESHOLD {
                if let Err(e) = cache.put(&response.request, &response) {
                    warn!("Failed to cache {}: {}", response.url(), e);
                }
            }
        }

        if response.status >= 400 && !self.inner.config.parse_http_error_response {
            let status = response.status;
            let request = Arc::clone(&response.request);
            return self.fail(request, Some(&response), CrawlError::HttpStatus(status)).await;
        }

        self.handle_response(response, false).await
    }

    fn run_request_hooks(&self, request: &mut Request) -> RequestDecision {
        let hooks = self.inner.hooks.request.read().clone();
        for hook in &hooks {
            match hook(request) {
                RequestDecision::Proceed => continue,
                decision => return decision,
            }
        }
        RequestDecision::Proceed
    }

    /// Adopt the post-redirect URL and mark it visited
    fn reconcile_redirect(&self, request: &mut Request, final_url: url::Url) {
        debug!("{} redirected to {}", request.url, final_url);
        request.url = final_url;
        // Redirects of a POST are followed as GET without a body
        if request.method == Method::Post {
            request.method = Method::Get;
            request.body.clear();
        }

        if !self.inner.config.allow_url_revisit {
            let fp = (self.inner.fingerprinter.read().clone())(request);
            let visited = self.inner.visited.read().clone();
            if let Err(e) = visited.mark(fp) {
                warn!("Failed to mark {} visited: {}", request.url, e);
            }
        }
    }

    /// Response, extraction and scraped hooks, then follow-ups
    async fn handle_response(&self, response: Response, cached: bool) -> Outcome {
        StatsCounters::incr(&self.inner.stats.delivered);
        let status = response.status;
        let mut follow = Follow::new(Arc::clone(&response.request));

        let hooks = self.inner.hooks.response.read().clone();
        for hook in &hooks {
            hook(&response, &mut follow);
        }

        let extract_hooks = self.inner.hooks.extract.read().clone();
        let content_type = response.content_type().to_string();
        let mut extractions: HashMap<String, Extraction> = HashMap::new();
        let mut extract_errors = Vec::new();
        for (extractor, hook) in &extract_hooks {
            if !extractor.accepts(&content_type) {
                continue;
            }
            let name = extractor.name().to_string();
            if !extractions.contains_key(&name) {
                match extractor.extract(&response) {
                    Ok(extraction) => {
                        extractions.insert(name.clone(), extraction);
                    }
                    Err(e) => {
                        extract_errors.push(e);
                        continue;
                    }
                }
            }
            if let Some(extraction) = extractions.get(&name) {
                hook(&response, extraction, &mut follow);
            }
        }

        if !extract_errors.is_empty() {
            let error_hooks = self.inner.hooks.error.read().clone();
            for error in &extract_errors {
                warn!("Extraction failed for {}: {}", response.url(), error);
                for hook in &error_hooks {
                    hook(&response.request, Some(&response), error, &mut follow);
                }
            }
        }

        let hooks = self.inner.hooks.scraped.read().clone();
        for hook in &hooks {
            hook(&response, &mut follow);
        }

        drop(response);
        self.follow_up(follow).await;
        Outcome::Delivered { status, cached }
    }

    async fn fail(&self, request: Arc<Request>, response: Option<&Response>, error: CrawlError) -> Outcome {
        StatsCounters::incr(&self.inner.stats.failed);
        debug!("Request to {} failed: {}", request.url, error);

        let mut follow = Follow::new(Arc::clone(&request));
        let hooks = self.inner.hooks.error.read().clone();
        for hook in &hooks {
            hook(&request, response, &error, &mut follow);
        }

        self.follow_up(follow).await;
        Outcome::Failed {
            error: error.to_string(),
        }
    }

    /// Dispatch whatever the hooks asked for
    fn follow_up(&self, follow: Follow) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for candidate in follow.into_candidates() {
                match candidate {
                    Candidate::Visit(request) => self.follow_visit(request).await,
                    Candidate::Enqueue(request) => {
                        let queue = self.inner.queue.read().clone();
                        match queue {
                            Some(queue) => {
                                if let Err(e) = queue.add_request(&request) {
                                    warn!("Failed to enqueue {}: {}", request.url, e);
                                }
                            }
                            None => self.follow_visit(request).await,
                        }
                    }
                    Candidate::Retry(request) => {
                        if self.inner.config.async_mode {
                            let this = self.clone();
                            self.inner.tasks.spawn(async move {
                                if let Outcome::Deferred(request) = this.deliver(request).await {
                                    this.requeue_deferred(request);
                                }
                            });
                        } else if let Outcome::Deferred(request) = self.deliver(request).await {
                            self.requeue_deferred(request);
                        }
                    }
                }
            }
        })
    }

    async fn follow_visit(&self, request: Request) {
        let url = request.url.clone();
        match self.dispatch_as(request, Origin::Derived).await {
            Ok(Outcome::Deferred(request)) => self.requeue_deferred(request),
            Ok(_) => {}
            Err(e) => debug!("Follow-up {} not dispatched: {}", url, e),
        }
    }

    /// Hand a deferred request to the attached queue; without one it is dropped
    fn requeue_deferred(&self, request: Request) {
        let queue = self.inner.queue.read().clone();
        match queue {
            Some(queue) => {
                if let Err(e) = queue.add_request(&request) {
                    warn!("Failed to requeue deferred {}: {}", request.url, e);
                }
            }
            None => debug!("Dropping deferred {} (no queue attached)", request.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::transport::{ExchangeOptions, TransportResponse};
    use crate::types::Headers;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Serves a fixed site map; unknown paths are 404
    #[derive(Default)]
    struct SiteTransport {
        pages: HashMap<String, (u16, String)>,
        redirects: HashMap<String, String>,
        calls: AtomicUsize,
        fetched: Mutex<Vec<String>>,
    }

    impl SiteTransport {
        fn page(mut self, url: &str, status: u16, body: &str) -> Self {
            self.pages.insert(url.to_string(), (status, body.to_string()));
            self
        }

        fn redirect(mut self, from: &str, to: &str) -> Self {
            self.redirects.insert(from.to_string(), to.to_string());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for SiteTransport {
        async fn perform(
            &self,
            request: &Request,
            options: &ExchangeOptions<'_>,
        ) -> Result<TransportResponse, CrawlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fetched.lock().push(request.url.to_string());

            let mut url = request.url.clone();
            if let Some(target) = self.redirects.get(url.as_str()) {
                url = url::Url::parse(target).unwrap();
            }
            let (status, body) = self
                .pages
                .get(url.as_str())
                .cloned()
                .unwrap_or((404, String::new()));

            let mut headers = Headers::new();
            headers.set("Content-Type", "text/html");
            let head = ResponseHead { status, headers, url };
            if options.check_headers(&head) == HeaderDecision::Abort {
                return Err(CrawlError::AbortedAfterHeaders);
            }
            Ok(TransportResponse {
                head,
                body: body.into_bytes(),
            })
        }
    }

    fn crawler(config: CrawlerConfig, transport: Arc<SiteTransport>) -> Crawler {
        Crawler::with_transport(
            CrawlerConfig {
                ignore_robots_txt: true,
                ..config
            },
            transport,
        )
        .unwrap()
    }

    fn site() -> SiteTransport {
        SiteTransport::default()
            .page(
                "https://example.com/",
                200,
                r#"<a href="/a">A</a><a href="/b">B</a><a href="https://other.org/">O</a>"#,
            )
            .page("https://example.com/a", 200, r#"<a href="/">home</a><a href="/c">C</a>"#)
            .page("https://example.com/b", 200, "<p>leaf</p>")
            .page("https://example.com/c", 200, "<p>deep</p>")
    }

    #[tokio::test]
    async fn test_recursive_crawl_visits_each_page_once() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            Arc::clone(&transport),
        );
        crawler.on_html(|_, extraction, follow| {
            for link in &extraction.links {
                follow.visit_url(link.clone());
            }
        });

        let outcome = crawler.visit("https://example.com/").await.unwrap();
        assert!(matches!(outcome, Outcome::Delivered { status: 200, cached: false }));

        let mut fetched = transport.fetched.lock().clone();
        fetched.sort();
        assert_eq!(
            fetched,
            vec![
                "https://example.com/",
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c",
            ]
        );

        let stats = crawler.stats();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.skipped(SkipReason::ForbiddenDomain), 1);
        assert_eq!(stats.skipped(SkipReason::AlreadyVisited), 1);
    }

    #[tokio::test]
    async fn test_max_depth_stops_recursion() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                max_depth: 1,
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            Arc::clone(&transport),
        );
        crawler.on_html(|_, extraction, follow| {
            for link in &extraction.links {
                follow.visit_url(link.clone());
            }
        });

        crawler.visit("https://example.com/").await.unwrap();
        assert_eq!(transport.calls(), 3);
        // "/" and "/c" found on /a sit at depth 2
        assert_eq!(crawler.stats().skipped(SkipReason::MaxDepth), 2);
    }

    #[tokio::test]
    async fn test_entry_point_drops_are_errors() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            Arc::clone(&transport),
        );

        let err = crawler.visit("https://other.org/").await.unwrap_err();
        assert!(matches!(err, CrawlError::ForbiddenDomain(_)));

        crawler.visit("https://example.com/b").await.unwrap();
        let again = crawler.visit("https://example.com/b").await.unwrap();
        assert!(matches!(again, Outcome::Skipped(SkipReason::AlreadyVisited)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_http_error_goes_to_error_hook() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            crawler.on_error(move |request, response, error, _| {
                seen.lock().push((
                    request.url.to_string(),
                    response.map(|r| r.status),
                    matches!(error, CrawlError::HttpStatus(404)),
                ));
            });
        }
        let responses = Arc::new(AtomicUsize::new(0));
        {
            let responses = Arc::clone(&responses);
            crawler.on_response(move |_, _| {
                responses.fetch_add(1, Ordering::SeqCst);
            });
        }

        let outcome = crawler.visit("https://example.com/missing").await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(
            seen.lock().clone(),
            vec![("https://example.com/missing".to_string(), Some(404), true)]
        );
        assert_eq!(responses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parse_http_error_response_delivers() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                parse_http_error_response: true,
                ..Default::default()
            },
            transport,
        );
        let outcome = crawler.visit("https://example.com/missing").await.unwrap();
        assert!(matches!(outcome, Outcome::Delivered { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_request_hook_decisions() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        crawler.on_request(|request| match request.url.path() {
            "/a" => RequestDecision::Abort,
            "/b" => RequestDecision::RetryLater,
            _ => {
                request.headers.set("X-Seen", "1");
                RequestDecision::Proceed
            }
        });

        assert!(matches!(
            crawler.visit("https://example.com/a").await.unwrap(),
            Outcome::Aborted
        ));
        match crawler.visit("https://example.com/b").await.unwrap() {
            Outcome::Deferred(request) => assert_eq!(request.url.path(), "/b"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(transport.calls(), 0);

        crawler.visit("https://example.com/c").await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_deferred_request_is_not_readmitted() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        crawler.on_request(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                RequestDecision::RetryLater
            } else {
                RequestDecision::Proceed
            }
        });

        let deferred = match crawler.visit("https://example.com/b").await.unwrap() {
            Outcome::Deferred(request) => request,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(deferred.is_deferred());
        let id = deferred.id;

        let outcome = crawler.request(deferred).await.unwrap();
        assert!(matches!(outcome, Outcome::Delivered { status: 200, .. }));
        assert_eq!(transport.calls(), 1);

        let stats = crawler.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.skipped(SkipReason::AlreadyVisited), 0);
        assert!(id > 0);
    }

    #[tokio::test]
    async fn test_header_hook_abort() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        crawler.on_response_headers(|head, _| {
            if head.content_type().contains("text/html") {
                HeaderDecision::Abort
            } else {
                HeaderDecision::Continue
            }
        });
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let errors = Arc::clone(&errors);
            crawler.on_error(move |_, _, _, _| {
                errors.fetch_add(1, Ordering::SeqCst);
            });
        }

        let outcome = crawler.visit("https://example.com/b").await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(crawler.stats().aborted, 1);
    }

    #[tokio::test]
    async fn test_redirect_target_is_marked_visited() {
        let transport = Arc::new(
            site().redirect("https://example.com/old", "https://example.com/b"),
        );
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));

        let urls = Arc::new(Mutex::new(Vec::new()));
        {
            let urls = Arc::clone(&urls);
            crawler.on_response(move |response, _| {
                urls.lock().push(response.url().to_string());
            });
        }

        crawler.visit("https://example.com/old").await.unwrap();
        assert_eq!(urls.lock().clone(), vec!["https://example.com/b"]);

        let again = crawler.visit("https://example.com/b").await.unwrap();
        assert!(matches!(again, Outcome::Skipped(SkipReason::AlreadyVisited)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_from_error_hook() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = Arc::clone(&attempts);
            crawler.on_error(move |_, _, _, follow| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    follow.retry();
                }
            });
        }

        crawler.visit("https://example.com/missing").await.unwrap();
        assert_eq!(transport.calls(), 3);
        assert_eq!(crawler.stats().failed, 3);
    }

    #[tokio::test]
    async fn test_context_flows_to_derived_requests() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            transport,
        );
        crawler.on_request(|request| {
            if request.depth == 0 {
                request.ctx.put("seed", request.url.to_string());
            }
            RequestDecision::Proceed
        });
        let seeds = Arc::new(Mutex::new(Vec::new()));
        {
            let seeds = Arc::clone(&seeds);
            crawler.on_response(move |response, follow| {
                seeds.lock().push(response.ctx().get("seed"));
                if response.request.depth == 0 {
                    follow.visit("/b");
                }
            });
        }

        crawler.visit("https://example.com/").await.unwrap();
        assert_eq!(
            seeds.lock().clone(),
            vec!["https://example.com/", "https://example.com/"]
        );
    }

    #[tokio::test]
    async fn test_max_requests_cap() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                max_requests: 2,
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            Arc::clone(&transport),
        );
        crawler.on_html(|_, extraction, follow| {
            for link in &extraction.links {
                follow.visit_url(link.clone());
            }
        });

        crawler.visit("https://example.com/").await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert!(crawler.stats().skipped(SkipReason::MaxRequests) >= 1);

        let err = crawler.visit("https://example.com/never").await.unwrap_err();
        assert!(matches!(err, CrawlError::MaxRequests(2)));
    }

    #[tokio::test]
    async fn test_async_mode_wait() {
        let transport = Arc::new(site());
        let crawler = crawler(
            CrawlerConfig {
                async_mode: true,
                allowed_domains: vec!["example.com".into()],
                ..Default::default()
            },
            Arc::clone(&transport),
        );
        crawler.on_html(|_, extraction, follow| {
            for link in &extraction.links {
                follow.visit_url(link.clone());
            }
        });

        let outcome = crawler.visit("https://example.com/").await.unwrap();
        assert!(matches!(outcome, Outcome::Scheduled));
        crawler.wait().await;
        assert_eq!(transport.calls(), 4);
        assert_eq!(crawler.stats().delivered, 4);
    }

    #[tokio::test]
    async fn test_custom_fingerprinter() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        // Treat every page on a host as the same resource
        crawler.set_fingerprinter(|request| request.host().len() as u64);

        crawler.visit("https://example.com/a").await.unwrap();
        let second = crawler.visit("https://example.com/b").await.unwrap();
        assert!(second.is_skipped());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_crawler_rejects_work() {
        let transport = Arc::new(site());
        let crawler = crawler(CrawlerConfig::default(), Arc::clone(&transport));
        crawler.cancel();
        assert!(matches!(
            crawler.visit("https://example.com/").await,
            Err(CrawlError::Cancelled)
        ));
        assert_eq!(transport.calls(), 0);
    }
}
