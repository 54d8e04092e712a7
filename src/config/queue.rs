//! Queue configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where queued requests are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Sled,
}

/// Worker queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of workers pulling from the queue
    pub threads: usize,
    /// Maximum queued requests for the memory backend
    pub max_size: usize,
    pub backend: QueueBackend,
    /// Database path for the sled backend
    pub path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            max_size: 100_000,
            backend: QueueBackend::Memory,
            path: None,
        }
    }
}
