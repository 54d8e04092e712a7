//! Core types for the crawl engine

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::crawler::CrawlError;

// ============================================================================
// HTTP primitives
// ============================================================================

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// Safe to replay from cache
    pub fn is_idempotent_read(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            other => Err(CrawlError::Config(format!("unsupported HTTP method: {}", other))),
        }
    }
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Get the first value for a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of a header with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    /// Add a value, keeping existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Request context
// ============================================================================

/// A value stored in a request [`Context`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContextValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ContextValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for ContextValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// Key-value bag shared between a request, its response and every request
/// derived from it. Clones share the same storage; concurrent `put`s are
/// last-writer-wins.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<RwLock<HashMap<String, ContextValue>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, ContextValue>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.inner.write().insert(key.into(), value.into());
    }

    /// Get a value rendered as a string; empty when the key is absent
    pub fn get(&self, key: &str) -> String {
        self.inner
            .read()
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// Get the typed value
    pub fn get_any(&self, key: &str) -> Option<ContextValue> {
        self.inner.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ContextValue> {
        self.inner.write().remove(key)
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> HashMap<String, ContextValue> {
        self.inner.read().clone()
    }

    /// Independent copy that no longer shares storage with `self`
    pub fn detach(&self) -> Self {
        Self::from_map(self.snapshot())
    }

    /// Whether two handles share the same storage
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.read().iter()).finish()
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::<String, ContextValue>::deserialize(deserializer).map(Self::from_map)
    }
}

// ============================================================================
// Request / Response
// ============================================================================

/// A request flowing through the dispatch pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Process-unique sequence id, assigned on admission
    pub id: u64,
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Hops from the entry request (root = 0)
    pub depth: u32,
    pub ctx: Context,
    /// Set when a request hook deferred this request after it was admitted
    #[serde(default)]
    pub(crate) deferred: bool,
    #[serde(skip, default = "CancellationToken::new")]
    cancel: CancellationToken,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: 0,
            method,
            url,
            headers: Headers::new(),
            body: Vec::new(),
            depth: 0,
            ctx: Context::new(),
            deferred: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    /// Parse `url` and build a GET request
    pub fn parse(url: &str) -> Result<Self, CrawlError> {
        let url = Url::parse(url).map_err(|e| CrawlError::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self::get(url))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Build a request one hop deeper that shares this request's context.
    /// Cancelling this request also cancels the derived one.
    pub fn derive(&self, method: Method, url: Url) -> Self {
        Self::new(method, url)
            .with_depth(self.depth + 1)
            .with_context(self.ctx.clone())
            .with_cancellation(self.cancel.child_token())
    }

    /// Resolve a possibly relative link against this request's URL
    pub fn absolute_url(&self, href: &str) -> Option<Url> {
        let href = href.trim();
        if href.starts_with('#') {
            return None;
        }
        let url = self.url.join(href).ok()?;
        match url.scheme() {
            "http" | "https" => Some(url),
            _ => None,
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Cancel this request; blocked admissions and in-flight exchanges return promptly
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether this request was deferred by a request hook. Dispatching it
    /// again skips admission, since it was already admitted once.
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Status line and headers, available before the body is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
    pub url: Url,
}

impl ResponseHead {
    pub fn content_type(&self) -> &str {
        self.headers.get("content-type").unwrap_or_default()
    }
}

/// A completed response. Immutable once built.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// The originating request (URL/method reconciled after redirects)
    pub request: Arc<Request>,
}

impl Response {
    pub fn ctx(&self) -> &Context {
        &self.request.ctx
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn content_type(&self) -> &str {
        self.headers.get("content-type").unwrap_or_default()
    }

    pub fn is_html(&self) -> bool {
        let ct = self.content_type();
        ct.contains("text/html") || ct.contains("application/xhtml")
    }

    /// Body decoded as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));

        headers.set("CONTENT-TYPE", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Content-Type"), Some("application/json"));

        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("POST".parse::<Method>().unwrap(), Method::Post);
        assert!("BREW".parse::<Method>().is_err());
    }

    #[test]
    fn test_context_shared_between_clones() {
        let ctx = Context::new();
        let shared = ctx.clone();
        shared.put("page", 3_i64);
        assert_eq!(ctx.get("page"), "3");
        assert_eq!(ctx.get_any("page"), Some(ContextValue::Int(3)));
        assert_eq!(ctx.get("missing"), "");

        let detached = ctx.detach();
        detached.put("page", "other");
        assert_eq!(ctx.get("page"), "3");
        assert!(!ctx.ptr_eq(&detached));
    }

    #[test]
    fn test_derived_request_inherits_context() {
        let parent = Request::parse("https://example.com/a/b").unwrap();
        parent.ctx.put("category", "books");

        let url = parent.absolute_url("../c").unwrap();
        let child = parent.derive(Method::Get, url);

        assert_eq!(child.url.as_str(), "https://example.com/c");
        assert_eq!(child.depth, 1);
        assert_eq!(child.ctx.get("category"), "books");
        assert!(child.ctx.ptr_eq(&parent.ctx));

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_absolute_url_rejects_non_http() {
        let req = Request::parse("https://example.com/").unwrap();
        assert!(req.absolute_url("mailto:someone@example.com").is_none());
        assert!(req.absolute_url("javascript:void(0)").is_none());
        assert!(req.absolute_url("#top").is_none());
        assert!(req.absolute_url("/about").is_some());
    }

    #[test]
    fn test_request_bincode_roundtrip_keeps_context() {
        let req = Request::parse("https://example.com/search")
            .unwrap()
            .with_header("Accept", "text/html")
            .with_body(b"q=rust".to_vec())
            .with_depth(2);
        req.ctx.put("origin", "seed");

        let bytes = bincode::serialize(&req).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.url, req.url);
        assert_eq!(decoded.body, b"q=rust");
        assert_eq!(decoded.depth, 2);
        assert_eq!(decoded.headers.get("accept"), Some("text/html"));
        assert_eq!(decoded.ctx.get("origin"), "seed");
        assert!(!decoded.is_cancelled());
    }
}
