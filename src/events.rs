// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::compaction::CompactionKind;
use crate::table::TableId;
use std::time::Duration;

/// Payload of a finished flush
#[derive(Clone, Debug)]
pub struct FlushEvent {
    pub job_id: u64,

    /// IDs of the flushed memtables
    pub memtables: Vec<u64>,

    /// File numbers of the created L0 tables
    pub outputs: Vec<TableId>,

    pub bytes_flushed: u64,
    pub duration: Duration,

    /// A flush may legitimately produce no rows (everything elided)
    pub empty: bool,

    pub error: Option<String>,
}

/// Payload of a finished compaction
#[derive(Clone, Debug)]
pub struct CompactionEvent {
    pub job_id: u64,
    pub kind: CompactionKind,

    pub start_level: usize,
    pub output_level: usize,

    /// File numbers of the input tables
    pub inputs: Vec<TableId>,

    /// File numbers of the output tables
    pub outputs: Vec<TableId>,

    pub duration: Duration,
    pub error: Option<String>,
}

/// Observer of flush and compaction lifecycle events
///
/// All callbacks are invoked synchronously from worker context, so they
/// should return quickly.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn on_flush_begin(&self, job_id: u64, memtables: &[u64]) {}

    fn on_flush_end(&self, event: &FlushEvent) {}

    fn on_compaction_begin(&self, job_id: u64, kind: CompactionKind, inputs: &[TableId]) {}

    fn on_compaction_end(&self, event: &CompactionEvent) {}
}

/// Listener that does nothing
#[derive(Default)]
pub struct NoopListener;

impl EventListener for NoopListener {}
