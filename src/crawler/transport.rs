//! Network boundary
//!
//! [`Transport::perform`] is the only place real I/O happens; everything
//! above it can be driven by a test double.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::hooks::HeaderDecision;
use super::CrawlError;
use crate::types::{Headers, Method, Request, ResponseHead};

/// Header check run once the status line and headers have arrived
pub type HeaderCheck<'a> = &'a (dyn Fn(&ResponseHead) -> HeaderDecision + Send + Sync);

/// Per-exchange knobs
#[derive(Clone, Copy, Default)]
pub struct ExchangeOptions<'a> {
    /// Body cap in bytes; the body is truncated at the cap. 0 = unlimited.
    pub max_body_size: usize,
    pub on_headers: Option<HeaderCheck<'a>>,
}

impl ExchangeOptions<'_> {
    /// Run the header check, if any
    pub fn check_headers(&self, head: &ResponseHead) -> HeaderDecision {
        self.on_headers
            .map(|check| check(head))
            .unwrap_or(HeaderDecision::Continue)
    }

    /// Append `chunk` to `body` without exceeding the cap.
    /// Returns false once the cap is reached.
    pub fn append_capped(&self, body: &mut Vec<u8>, chunk: &[u8]) -> bool {
        if self.max_body_size == 0 {
            body.extend_from_slice(chunk);
            return true;
        }
        let room = self.max_body_size.saturating_sub(body.len());
        let take = room.min(chunk.len());
        body.extend_from_slice(&chunk[..take]);
        body.len() < self.max_body_size
    }
}

/// Result of one exchange. `head.url` is the final URL after redirects.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(
        &self,
        request: &Request,
        options: &ExchangeOptions<'_>,
    ) -> Result<TransportResponse, CrawlError>;
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("trawl/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
        }
    }
}

/// [`Transport`] backed by a pooled `reqwest` client
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }

    fn map_error(&self, e: reqwest::Error) -> CrawlError {
        if e.is_timeout() {
            CrawlError::Timeout(self.timeout)
        } else if e.is_connect() {
            CrawlError::Transport(format!("connection failed: {}", e))
        } else {
            CrawlError::Http(e)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(
        &self,
        request: &Request,
        options: &ExchangeOptions<'_>,
    ) -> Result<TransportResponse, CrawlError> {
        let mut builder = self
            .client
            .request(Self::method(request.method), request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let mut response = builder.send().await.map_err(|e| self.map_error(e))?;

        let headers: Headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let head = ResponseHead {
            status: response.status().as_u16(),
            headers,
            url: response.url().clone(),
        };

        if options.check_headers(&head) == HeaderDecision::Abort {
            debug!("Aborted {} after headers (status {})", head.url, head.status);
            return Err(CrawlError::AbortedAfterHeaders);
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            if !options.append_capped(&mut body, &chunk) {
                debug!("Truncated body of {} at {} bytes", head.url, body.len());
                break;
            }
        }

        Ok(TransportResponse { head, body })
    }
}
