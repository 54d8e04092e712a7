//! Queue storage backends
//!
//! Items are opaque byte strings handed out in FIFO order. Retrieval
//! removes the item in the same step, so each item is consumed once.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;

use crate::crawler::CrawlError;

/// Storage behind a [`Queue`](super::Queue). Implementations synchronise internally.
pub trait Storage: Send + Sync {
    fn init(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    fn add_request(&self, item: Vec<u8>) -> Result<(), CrawlError>;

    /// Pop the oldest item; `None` when empty
    fn get_request(&self) -> Result<Option<Vec<u8>>, CrawlError>;

    fn size(&self) -> Result<usize, CrawlError>;
}

/// Bounded in-memory FIFO
#[derive(Debug)]
pub struct MemoryStorage {
    items: Mutex<VecDeque<Vec<u8>>>,
    max_size: usize,
}

impl MemoryStorage {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Storage for MemoryStorage {
    fn add_request(&self, item: Vec<u8>) -> Result<(), CrawlError> {
        let mut items = self.items.lock();
        if items.len() >= self.max_size {
            return Err(CrawlError::QueueFull(self.max_size));
        }
        items.push_back(item);
        Ok(())
    }

    fn get_request(&self) -> Result<Option<Vec<u8>>, CrawlError> {
        Ok(self.items.lock().pop_front())
    }

    fn size(&self) -> Result<usize, CrawlError> {
        Ok(self.items.lock().len())
    }
}

/// Durable FIFO in a sled tree, keyed by a monotonically increasing id
pub struct SledStorage {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CrawlError> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree("queue")?;
        Ok(Self { db, tree })
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> Result<(), CrawlError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn add_request(&self, item: Vec<u8>) -> Result<(), CrawlError> {
        let id = self.db.generate_id()?;
        self.tree.insert(id.to_be_bytes(), item)?;
        Ok(())
    }

    fn get_request(&self) -> Result<Option<Vec<u8>>, CrawlError> {
        Ok(self.tree.pop_min()?.map(|(_, value)| value.to_vec()))
    }

    fn size(&self) -> Result<usize, CrawlError> {
        Ok(self.tree.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_memory_storage_fifo() {
        let storage = MemoryStorage::new(10);
        storage.add_request(b"a".to_vec()).unwrap();
        storage.add_request(b"b".to_vec()).unwrap();

        assert_eq!(storage.size().unwrap(), 2);
        assert_eq!(storage.get_request().unwrap(), Some(b"a".to_vec()));
        assert_eq!(storage.get_request().unwrap(), Some(b"b".to_vec()));
        assert_eq!(storage.get_request().unwrap(), None);
    }

    #[test]
    fn test_memory_storage_rejects_beyond_max_size() {
        let storage = MemoryStorage::new(2);
        storage.add_request(b"1".to_vec()).unwrap();
        storage.add_request(b"2".to_vec()).unwrap();

        let err = storage.add_request(b"3".to_vec()).unwrap_err();
        assert!(matches!(err, CrawlError::QueueFull(2)));
        assert_eq!(storage.size().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_pops_consume_each_item_once() {
        let storage = Arc::new(MemoryStorage::new(1000));
        for i in 0..500u32 {
            storage.add_request(i.to_be_bytes().to_vec()).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(item) = storage.get_request().unwrap() {
                        got.push(item);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<Vec<u8>> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 500);
    }

    #[test]
    fn test_sled_storage_fifo_and_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.sled");

        {
            let storage = SledStorage::open(&path).unwrap();
            storage.init().unwrap();
            storage.add_request(b"first".to_vec()).unwrap();
            storage.add_request(b"second".to_vec()).unwrap();
            storage.add_request(b"third".to_vec()).unwrap();
            assert_eq!(storage.get_request().unwrap(), Some(b"first".to_vec()));
            storage.flush().unwrap();
        }

        let reopened = SledStorage::open(&path).unwrap();
        assert_eq!(reopened.size().unwrap(), 2);
        assert_eq!(reopened.get_request().unwrap(), Some(b"second".to_vec()));
        reopened.add_request(b"fourth".to_vec()).unwrap();
        assert_eq!(reopened.get_request().unwrap(), Some(b"third".to_vec()));
        assert_eq!(reopened.get_request().unwrap(), Some(b"fourth".to_vec()));
        assert_eq!(reopened.get_request().unwrap(), None);
    }
}
