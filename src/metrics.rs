// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};

/// Runtime metrics
///
/// Are not stored durably, so metrics will reset after a restart/crash.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Number of completed flushes
    pub(crate) flush_count: AtomicUsize,

    /// Number of completed table-rewriting compactions
    pub(crate) compaction_count: AtomicUsize,

    /// Number of trivial-move compactions
    pub(crate) move_count: AtomicUsize,

    /// Number of copy compactions
    pub(crate) copy_count: AtomicUsize,

    /// Number of delete-only compactions
    pub(crate) delete_only_count: AtomicUsize,

    /// Number of compactions that were cancelled cooperatively
    pub(crate) cancelled_count: AtomicUsize,

    /// Number of bytes written into new tables
    pub(crate) bytes_written: AtomicU64,

    /// Number of tables created
    pub(crate) tables_created: AtomicUsize,

    /// Number of keys kept alive only because of an open snapshot
    pub(crate) keys_pinned_by_snapshots: AtomicU64,

    /// Number of point tombstones dropped during compaction
    pub(crate) tombstones_elided: AtomicU64,

    /// Number of sequence numbers zeroed during compaction
    pub(crate) seqnos_zeroed: AtomicU64,
}

impl Metrics {
    /// Number of completed flushes.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Relaxed)
    }

    /// Number of completed table-rewriting compactions.
    pub fn compaction_count(&self) -> usize {
        self.compaction_count.load(Relaxed)
    }

    /// Number of trivial-move compactions.
    pub fn move_count(&self) -> usize {
        self.move_count.load(Relaxed)
    }

    /// Number of copy compactions.
    pub fn copy_count(&self) -> usize {
        self.copy_count.load(Relaxed)
    }

    /// Number of delete-only compactions.
    pub fn delete_only_count(&self) -> usize {
        self.delete_only_count.load(Relaxed)
    }

    /// Number of compactions that aborted because of cancellation.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled_count.load(Relaxed)
    }

    /// Number of bytes written into new tables.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Relaxed)
    }

    /// Number of tables created.
    pub fn tables_created(&self) -> usize {
        self.tables_created.load(Relaxed)
    }

    /// Number of keys kept alive only because of an open snapshot.
    pub fn keys_pinned_by_snapshots(&self) -> u64 {
        self.keys_pinned_by_snapshots.load(Relaxed)
    }

    /// Number of point tombstones dropped during compaction.
    pub fn tombstones_elided(&self) -> u64 {
        self.tombstones_elided.load(Relaxed)
    }

    /// Number of sequence numbers zeroed during compaction.
    pub fn seqnos_zeroed(&self) -> u64 {
        self.seqnos_zeroed.load(Relaxed)
    }
}
