use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default per-level capacity of the tree node caches. A sizing hint, not a
/// contract: overflow flushes the oldest positions to the backing store.
pub const DEFAULT_TREE_CACHE_CAPACITY: usize = 750_000;

/// Default worker hint for the dump/restore stream and bulk loader.
pub const DEFAULT_STREAM_PARALLELISM: usize = 16;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Filesystem path for persistent data.
    pub dir: PathBuf,
    /// Keep everything in memory; no log is written or replayed.
    pub in_memory: bool,
    /// Sync the backing log to disk on every commit (durable, slower).
    pub sync_writes: bool,
    /// Per-level tree cache capacity hint.
    pub tree_cache_capacity: usize,
    /// Parallelism hint handed to the backing stream and bulk loader.
    pub stream_parallelism: usize,
    /// Backing-store version retention tunable. The engine forces this to
    /// `i64::MAX` on open: immutability means every version is kept.
    pub num_versions_to_keep: i64,
}

impl Options {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            in_memory: false,
            sync_writes: true,
            tree_cache_capacity: DEFAULT_TREE_CACHE_CAPACITY,
            stream_parallelism: DEFAULT_STREAM_PARALLELISM,
            num_versions_to_keep: i64::MAX,
        }
    }

    pub fn in_memory(mut self, yes: bool) -> Self {
        self.in_memory = yes;
        self
    }

    pub fn sync_writes(mut self, yes: bool) -> Self {
        self.sync_writes = yes;
        self
    }

    pub fn tree_cache_capacity(mut self, capacity: usize) -> Self {
        self.tree_cache_capacity = capacity;
        self
    }

    pub fn stream_parallelism(mut self, parallelism: usize) -> Self {
        self.stream_parallelism = parallelism;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new("data")
    }
}
