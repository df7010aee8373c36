// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The compaction engine of a log-structured merge tree.
//!
//! This crate maintains a multi-level collection of immutable sorted
//! tables plus an in-memory write buffer. It is responsible for:
//!
//! - flushing memtables into L0 tables,
//! - compacting tables between levels to bound read amplification and
//!   reclaim space,
//! - the delete-only, move, copy, elision-only, read-triggered and
//!   rewrite/download compaction variants,
//! - snapshot-stripe–aware tombstone and range-key elision, and
//!   sequence-number zeroing,
//! - deletion hints ("a wide tombstone wholly covers a file"),
//! - consistent point-in-time checkpoints,
//! - obsolete-file collection.
//!
//! It is NOT a storage engine: there is no query path, and the table
//! format it ships is a minimal flat medium that carries the compaction
//! machinery and its tests.
//!
//! # Example usage
//!
//! ```
//! use lsm_compaction::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let engine = Config::new(folder).open()?;
//!
//! engine.insert("my_key", "my_value", /* sequence number */ 0);
//! engine.remove_range("a", "m", 1);
//!
//! // Seal the write buffer and flush it into an L0 table
//! engine.flush_active_memtable()?;
//!
//! // Let the scheduler arbitrate flushes, compactions and downloads
//! engine.run_scheduler_pass()?;
//! #
//! # Ok::<(), lsm_compaction::Error>(())
//! ```

#![doc(html_root_url = "https://docs.rs/lsm-compaction")]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        }
    };
}

mod buffer_pool;
mod checksum;

#[doc(hidden)]
pub mod coding;

pub mod compaction;
mod config;
mod engine;
mod error;
mod events;

#[doc(hidden)]
pub mod file;

#[doc(hidden)]
pub mod inuse;

mod key;
mod key_range;

#[doc(hidden)]
pub mod level_scanner;

mod memtable;

#[doc(hidden)]
pub mod merge;

mod merge_operator;
mod metrics;

#[doc(hidden)]
pub mod range_key;

mod range_tombstone;

#[doc(hidden)]
pub mod rangedel;

mod seqno;
mod slice;
mod snapshot;

#[doc(hidden)]
pub mod stop_signal;

pub mod table;

#[doc(hidden)]
pub mod version;

pub mod wal;

mod value;

pub use {
    buffer_pool::BufferPool,
    checksum::Checksum,
    coding::{DecodeError, EncodeError},
    config::Config,
    engine::{Engine, Flushable, IngestedTables, SuperVersion},
    error::{Error, Result},
    events::{CompactionEvent, EventListener, FlushEvent, NoopListener},
    key::{InternalKey, KeyKind},
    key_range::KeyRange,
    memtable::{Memtable, MemtableId},
    merge_operator::MergeOperator,
    metrics::Metrics,
    range_key::{RangeKeyEntry, RangeKeyItem, RangeKeySpan},
    range_tombstone::RangeTombstone,
    seqno::SequenceNumberCounter,
    snapshot::{SnapshotList, SnapshotTracker},
    value::{InternalValue, SeqNo, UserKey, UserValue},
    version::{Version, VersionEdit},
};

pub use slice::Slice;
