//! Engine configuration
//!
//! Defaults: 64 KiB pipes and chunks, 64 cached statements, exclusive locking
//! and WAL journaling.

use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

/// Engine configuration shared by every database of a backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Byte capacity of pipes opened on blob sources
    pub pipe_capacity: usize,
    /// Maximum bytes moved per read or write step when streaming blobs
    pub chunk_size: usize,
    /// Prepared statements cached per connection. Also holds the iterators' statements.
    pub statement_cache_capacity: usize,
    /// `PRAGMA locking_mode = EXCLUSIVE`
    pub exclusive_locking: bool,
    /// `PRAGMA journal_mode = WAL`
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            exclusive_locking: true,
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create a config with custom blob streaming sizes
    pub fn new(pipe_capacity: usize, chunk_size: usize) -> Self {
        Self {
            pipe_capacity,
            chunk_size,
            ..Self::default()
        }
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pipe capacity, never zero
    pub(crate) fn effective_pipe_capacity(&self) -> usize {
        self.pipe_capacity.max(1)
    }

    /// Chunk size, never zero
    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
