//! Visited-request bookkeeping
//!
//! Every admitted request is reduced to a 64-bit fingerprint. Once a
//! fingerprint is marked it stays marked for the lifetime of the store;
//! there is no eviction.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

use super::CrawlError;
use crate::types::Request;

/// Caller-supplied fingerprint function
pub type Fingerprinter = Arc<dyn Fn(&Request) -> u64 + Send + Sync>;

/// Default fingerprint: method + canonical URL + body
pub fn fingerprint(request: &Request) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(super::normalize_url(&request.url).as_bytes());
    if !request.body.is_empty() {
        hasher.update(b"\n");
        hasher.update(&request.body);
    }
    hasher.digest()
}

/// Store of visited fingerprints. Implementations synchronise internally.
pub trait VisitedStore: Send + Sync {
    /// Record a fingerprint as visited
    fn mark(&self, fingerprint: u64) -> Result<(), CrawlError>;

    /// Whether a fingerprint was marked
    fn seen(&self, fingerprint: u64) -> Result<bool, CrawlError>;

    /// Mark and report whether it was already marked, as one step.
    /// Two concurrent callers with the same fingerprint get exactly one `false`.
    fn check_and_mark(&self, fingerprint: u64) -> Result<bool, CrawlError>;

    /// Number of fingerprints recorded
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process visited store
#[derive(Debug, Default)]
pub struct MemoryVisitedStore {
    seen: Mutex<HashSet<u64>>,
}

impl MemoryVisitedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VisitedStore for MemoryVisitedStore {
    fn mark(&self, fingerprint: u64) -> Result<(), CrawlError> {
        self.seen.lock().insert(fingerprint);
        Ok(())
    }

    fn seen(&self, fingerprint: u64) -> Result<bool, CrawlError> {
        Ok(self.seen.lock().contains(&fingerprint))
    }

    fn check_and_mark(&self, fingerprint: u64) -> Result<bool, CrawlError> {
        Ok(!self.seen.lock().insert(fingerprint))
    }

    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Visited store persisted in a sled tree, so a resumed crawl skips
/// everything the previous run already fetched
pub struct SledVisitedStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledVisitedStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CrawlError> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree("visited")?;
        Ok(Self { db, tree })
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> Result<(), CrawlError> {
        self.db.flush()?;
        Ok(())
    }
}

impl VisitedStore for SledVisitedStore {
    fn mark(&self, fingerprint: u64) -> Result<(), CrawlError> {
        self.tree.insert(fingerprint.to_be_bytes(), &[1u8][..])?;
        Ok(())
    }

    fn seen(&self, fingerprint: u64) -> Result<bool, CrawlError> {
        Ok(self.tree.contains_key(fingerprint.to_be_bytes())?)
    }

    fn check_and_mark(&self, fingerprint: u64) -> Result<bool, CrawlError> {
        let swapped = self.tree.compare_and_swap(
            fingerprint.to_be_bytes(),
            None as Option<&[u8]>,
            Some(&[1u8][..]),
        )?;
        Ok(swapped.is_err())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}
