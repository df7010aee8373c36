// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::events::{EventListener, NoopListener};
use crate::merge_operator::MergeOperator;
use crate::version::DEFAULT_LEVEL_COUNT;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engine configuration
#[derive(Clone)]
pub struct Config {
    /// Folder the engine operates in
    pub path: PathBuf,

    /// Number of levels (default: 7)
    pub level_count: usize,

    /// Target size of output table files (default: 64 MiB)
    pub target_file_size: u64,

    /// Factor that bounds an output file's overlap with the grandparent
    /// level: `max_overlap_bytes = factor * target_file_size` (default: 10)
    pub max_grandparent_overlap_factor: u64,

    /// Size threshold of the write buffer (default: 16 MiB)
    ///
    /// A flush starts once the ready-for-flush bytes reach half of this.
    pub memtable_size: u64,

    /// Maximum number of concurrently running compactions (default: 4)
    pub max_concurrent_compactions: usize,

    /// Maximum number of concurrently running downloads (default: 2)
    pub max_concurrent_downloads: usize,

    /// Number of previous version (manifest) files to retain (default: 2)
    pub num_previous_manifests: usize,

    /// Operator that combines `Merge` operands
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Observer of flush/compaction events
    pub listener: Arc<dyn EventListener>,

    /// Opens the engine in read-only mode (no flushes, no compactions)
    pub read_only: bool,
}

impl Config {
    /// Creates a config for the given folder.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            level_count: DEFAULT_LEVEL_COUNT,
            target_file_size: 64 * 1_024 * 1_024,
            max_grandparent_overlap_factor: 10,
            memtable_size: 16 * 1_024 * 1_024,
            max_concurrent_compactions: 4,
            max_concurrent_downloads: 2,
            num_previous_manifests: 2,
            merge_operator: None,
            listener: Arc::new(NoopListener),
            read_only: false,
        }
    }

    /// Sets the target table file size.
    #[must_use]
    pub fn target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = bytes;
        self
    }

    /// Sets the write buffer size threshold.
    #[must_use]
    pub fn memtable_size(mut self, bytes: u64) -> Self {
        self.memtable_size = bytes;
        self
    }

    /// Sets the maximum number of concurrently running compactions.
    #[must_use]
    pub fn max_concurrent_compactions(mut self, n: usize) -> Self {
        self.max_concurrent_compactions = n;
        self
    }

    /// Sets the merge operator.
    #[must_use]
    pub fn merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(op);
        self
    }

    /// Sets the event listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Maximum grandparent overlap in bytes for a single output file.
    #[must_use]
    pub fn max_overlap_bytes(&self) -> u64 {
        self.max_grandparent_overlap_factor * self.target_file_size
    }

    /// Opens the engine.
    pub fn open(self) -> crate::Result<crate::Engine> {
        crate::Engine::open(self)
    }
}
