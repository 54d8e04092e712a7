//! Response cache keyed by the canonical request URL
//!
//! Only GET requests without `Cache-Control: no-cache` are cached. Entries
//! with a server-error status are stored but never served.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::CrawlError;
use crate::types::{Headers, Request, Response};

/// Statuses at or above this are treated as cache misses
pub const SERVER_ERROR_THRESHOLD: u16 = 500;

/// Stored form of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: Utc::now(),
        }
    }

    /// Whether this entry may be replayed instead of a live fetch
    pub fn is_servable(&self) -> bool {
        self.status < SERVER_ERROR_THRESHOLD
    }

    pub fn into_response(self, request: Arc<Request>) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
            request,
        }
    }
}

/// Whether a request is eligible for cache lookup and storage
pub fn is_cacheable(request: &Request) -> bool {
    if !request.method.is_idempotent_read() {
        return false;
    }
    let no_cache = request
        .headers
        .get("cache-control")
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));
    !no_cache
}

/// Hex SHA-256 of the request URL without its fragment
pub fn cache_key(request: &Request) -> String {
    let mut url = request.url.clone();
    url.set_fragment(None);
    let digest = Sha256::digest(url.as_str().as_bytes());
    hex::encode(digest)
}

/// Cache backend. Implementations synchronise internally.
pub trait Cache: Send + Sync {
    fn init(&self) -> Result<(), CrawlError>;

    fn get(&self, request: &Request) -> Result<Option<CachedResponse>, CrawlError>;

    fn put(&self, request: &Request, response: &Response) -> Result<(), CrawlError>;

    fn close(&self) -> Result<(), CrawlError> {
        Ok(())
    }
}

/// On-disk cache: one file per entry under a two-character shard directory
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the entry for `key`
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("00");
        self.dir.join(shard).join(key)
    }
}

impl Cache for FileCache {
    fn init(&self) -> Result<(), CrawlError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            CrawlError::Config(format!(
                "cannot create cache directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    fn get(&self, request: &Request) -> Result<Option<CachedResponse>, CrawlError> {
        let path = self.entry_path(&cache_key(request));
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CrawlError::Cache(format!("{}: {}", path.display(), e))),
        };
        let entry: CachedResponse = bincode::deserialize(&data)?;
        Ok(Some(entry))
    }

    fn put(&self, request: &Request, response: &Response) -> Result<(), CrawlError> {
        let key = cache_key(request);
        let path = self.entry_path(&key);
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }

        let encoded = bincode::serialize(&CachedResponse::from_response(response))?;

        // Readers only ever see a complete file
        let temp_path = path.with_file_name(format!("{}.{:016x}.tmp", key, rand::random::<u64>()));
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!("Cached {} ({} bytes) at {}", request.url, encoded.len(), path.display());
        Ok(())
    }
}

/// Bounded in-memory cache, mostly useful for tests and short runs
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CachedResponse>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Cache for MemoryCache {
    fn init(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    fn get(&self, request: &Request) -> Result<Option<CachedResponse>, CrawlError> {
        Ok(self.entries.lock().get(&cache_key(request)).cloned())
    }

    fn put(&self, request: &Request, response: &Response) -> Result<(), CrawlError> {
        self.entries
            .lock()
            .put(cache_key(request), CachedResponse::from_response(response));
        Ok(())
    }

    fn close(&self) -> Result<(), CrawlError> {
        self.entries.lock().clear();
        Ok(())
    }
}
