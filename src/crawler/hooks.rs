//! Callback signatures and the candidate sink handed to them

use std::sync::Arc;
use url::Url;

use super::dispatcher::SkipReason;
use super::extractor::Extraction;
use super::CrawlError;
use crate::types::{Method, Request, Response, ResponseHead};

/// What to do with a request about to be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Proceed,
    /// Drop the request; reported as aborted, not failed
    Abort,
    /// Hand the request back to the caller to be scheduled again later
    RetryLater,
}

/// Whether to keep downloading once the headers are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    Continue,
    Abort,
}

pub type RequestHook = Arc<dyn Fn(&mut Request) -> RequestDecision + Send + Sync>;
pub type HeadersHook = Arc<dyn Fn(&ResponseHead, &Request) -> HeaderDecision + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&Response, &mut Follow) + Send + Sync>;
pub type ExtractHook = Arc<dyn Fn(&Response, &Extraction, &mut Follow) + Send + Sync>;
pub type ErrorHook =
    Arc<dyn Fn(&Request, Option<&Response>, &CrawlError, &mut Follow) + Send + Sync>;
pub type ScrapedHook = Arc<dyn Fn(&Response, &mut Follow) + Send + Sync>;
pub type SkippedHook = Arc<dyn Fn(&Request, SkipReason) + Send + Sync>;

/// A request produced by a hook, waiting to be dispatched
#[derive(Debug)]
pub(crate) enum Candidate {
    /// Run through admission and dispatch in the crawler's mode
    Visit(Request),
    /// Hand to the attached queue (or dispatch if none is attached)
    Enqueue(Request),
    /// Re-enter execution directly, skipping admission
    Retry(Request),
}

/// Collects follow-up requests from inside a hook.
///
/// Links are resolved against the request that produced the response, and
/// derived requests inherit its context and sit one level deeper.
#[derive(Debug)]
pub struct Follow {
    parent: Arc<Request>,
    candidates: Vec<Candidate>,
}

impl Follow {
    pub(crate) fn new(parent: Arc<Request>) -> Self {
        Self {
            parent,
            candidates: Vec::new(),
        }
    }

    /// The request whose hooks are running
    pub fn parent(&self) -> &Request {
        &self.parent
    }

    /// Visit a link, relative or absolute. Returns false for links that do
    /// not resolve to an http(s) URL.
    pub fn visit(&mut self, href: &str) -> bool {
        self.push_derived(Method::Get, href, Vec::new(), Candidate::Visit)
    }

    /// Visit an already resolved URL
    pub fn visit_url(&mut self, url: Url) {
        let request = self.parent.derive(Method::Get, url);
        self.candidates.push(Candidate::Visit(request));
    }

    /// POST to a link with the given body
    pub fn post(&mut self, href: &str, body: impl Into<Vec<u8>>) -> bool {
        self.push_derived(Method::Post, href, body.into(), Candidate::Visit)
    }

    /// Dispatch a fully built request as-is
    pub fn request(&mut self, request: Request) {
        self.candidates.push(Candidate::Visit(request));
    }

    /// Hand a link to the attached queue instead of dispatching it inline
    pub fn enqueue(&mut self, href: &str) -> bool {
        self.push_derived(Method::Get, href, Vec::new(), Candidate::Enqueue)
    }

    /// Execute the parent request again, bypassing admission checks
    pub fn retry(&mut self) {
        self.candidates
            .push(Candidate::Retry(self.parent.as_ref().clone()));
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub(crate) fn into_candidates(self) -> Vec<Candidate> {
        self.candidates
    }

    fn push_derived(
        &mut self,
        method: Method,
        href: &str,
        body: Vec<u8>,
        wrap: fn(Request) -> Candidate,
    ) -> bool {
        let Some(url) = self.parent.absolute_url(href) else {
            return false;
        };
        let request = self.parent.derive(method, url).with_body(body);
        self.candidates.push(wrap(request));
        true
    }
}
