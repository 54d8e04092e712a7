//! Worker queue
//!
//! Decouples discovering requests from executing them. A fixed pool of
//! workers pulls serialized requests from a [`Storage`] backend and runs
//! each through the crawler. The run ends when storage is empty and no
//! worker is busy.

mod storage;

pub use storage::{MemoryStorage, SledStorage, Storage};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{QueueBackend, QueueConfig};
use crate::crawler::{CrawlError, Crawler, Outcome};
use crate::types::Request;

/// Producer side of a queue, cheap to clone
#[derive(Clone)]
pub struct QueueHandle {
    storage: Arc<dyn Storage>,
    wake: Arc<Notify>,
}

impl QueueHandle {
    /// Serialize and store a request, waking the run loop
    pub fn add_request(&self, request: &Request) -> Result<(), CrawlError> {
        let bytes = bincode::serialize(request)?;
        self.storage.add_request(bytes)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Store a GET request for `url`
    pub fn add_url(&self, url: &str) -> Result<(), CrawlError> {
        self.add_request(&Request::parse(url)?)
    }

    pub fn size(&self) -> Result<usize, CrawlError> {
        self.storage.size()
    }
}

/// A worker waiting for its next request
type Ready = oneshot::Sender<Request>;

pub struct Queue {
    threads: usize,
    handle: QueueHandle,
}

impl Queue {
    pub fn new(threads: usize, storage: Arc<dyn Storage>) -> Result<Self, CrawlError> {
        if threads == 0 {
            return Err(CrawlError::Config("queue needs at least one thread".to_string()));
        }
        storage.init()?;
        Ok(Self {
            threads,
            handle: QueueHandle {
                storage,
                wake: Arc::new(Notify::new()),
            },
        })
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, CrawlError> {
        let storage: Arc<dyn Storage> = match config.backend {
            QueueBackend::Memory => Arc::new(MemoryStorage::new(config.max_size)),
            QueueBackend::Sled => {
                let path = config.path.as_ref().ok_or_else(|| {
                    CrawlError::Config("queue.path is required for the sled backend".to_string())
                })?;
                Arc::new(SledStorage::open(path)?)
            }
        };
        Self::new(config.threads, storage)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Producer handle, e.g. for [`Crawler::attach_queue`]
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn add_request(&self, request: &Request) -> Result<(), CrawlError> {
        self.handle.add_request(request)
    }

    pub fn add_url(&self, url: &str) -> Result<(), CrawlError> {
        self.handle.add_url(url)
    }

    pub fn size(&self) -> Result<usize, CrawlError> {
        self.handle.size()
    }

    pub fn is_empty(&self) -> Result<bool, CrawlError> {
        Ok(self.size()? == 0)
    }

    /// Run until storage is empty and every worker is idle.
    ///
    /// Requests added while the run is in progress (from hooks or other
    /// producers) are picked up by the same run. A storage fault stops the
    /// run and is returned.
    pub async fn run(&self, crawler: &Crawler) -> Result<(), CrawlError> {
        info!(
            "Queue starting with {} workers, {} queued",
            self.threads,
            self.size()?
        );

        loop {
            self.run_workers(crawler).await?;
            // Background fetches from async mode may still add items
            crawler.wait().await;
            if self.size()? == 0 {
                break;
            }
        }

        info!("Queue drained: {}", crawler.stats());
        Ok(())
    }

    async fn run_workers(&self, crawler: &Crawler) -> Result<(), CrawlError> {
        let (ready_tx, mut ready_rx) = mpsc::channel::<Ready>(self.threads);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

        let mut workers = JoinSet::new();
        for id in 0..self.threads {
            workers.spawn(worker(
                id,
                crawler.clone(),
                self.handle.clone(),
                ready_tx.clone(),
                done_tx.clone(),
            ));
        }
        drop(ready_tx);
        drop(done_tx);

        let storage = &self.handle.storage;
        let mut idle: Vec<Ready> = Vec::with_capacity(self.threads);
        let mut active = 0usize;

        let result = loop {
            // Hand out as much work as there are idle workers
            if let Err(e) = self.dispatch_to_idle(&mut idle, &mut active) {
                break Err(e);
            }

            let size = match storage.size() {
                Ok(size) => size,
                Err(e) => break Err(e),
            };
            if active == 0 && size == 0 {
                break Ok(());
            }

            tokio::select! {
                ready = ready_rx.recv() => match ready {
                    Some(worker) => idle.push(worker),
                    None => break Err(CrawlError::Storage("all queue workers exited".to_string())),
                },
                Some(()) = done_rx.recv() => {
                    active = active.saturating_sub(1);
                }
                _ = self.handle.wake.notified() => {}
            }
        };

        // Closing both ends of the handoff stops the workers
        drop(idle);
        drop(ready_rx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Queue worker panicked: {}", e);
            }
        }

        if let Err(e) = &result {
            warn!("Queue stopped: {}", e);
        }
        result
    }

    fn dispatch_to_idle(&self, idle: &mut Vec<Ready>, active: &mut usize) -> Result<(), CrawlError> {
        let storage = &self.handle.storage;
        while let Some(worker) = idle.pop() {
            let Some(bytes) = storage.get_request()? else {
                idle.push(worker);
                break;
            };
            let request: Request = match bincode::deserialize(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Dropping undecodable queue item: {}", e);
                    idle.push(worker);
                    continue;
                }
            };
            if worker.send(request).is_err() {
                // Worker went away between signalling and handoff
                storage.add_request(bytes)?;
                continue;
            }
            *active += 1;
        }
        Ok(())
    }
}

async fn worker(
    id: usize,
    crawler: Crawler,
    queue: QueueHandle,
    ready: mpsc::Sender<Ready>,
    done: mpsc::UnboundedSender<()>,
) {
    loop {
        let (tx, rx) = oneshot::channel();
        if ready.send(tx).await.is_err() {
            break;
        }
        let Ok(request) = rx.await else {
            break;
        };

        let url = request.url.clone();
        match crawler.dispatch(request).await {
            Ok(Outcome::Deferred(request)) => {
                if let Err(e) = queue.add_request(&request) {
                    warn!("Worker {}: could not requeue {}: {}", id, url, e);
                }
            }
            Ok(outcome) => debug!("Worker {}: {} -> {:?}", id, url, outcome),
            Err(e) => debug!("Worker {}: {} failed: {}", id, url, e),
        }

        if done.send(()).is_err() {
            break;
        }
    }
}
