// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod checkpoint;
pub mod sweeper;

use crate::compaction::hints::DeletionHint;
use crate::compaction::{
    CompactionPicker, DownloadTask, ManualCompaction, PickedCompaction, ReadCompaction,
};
use crate::config::Config;
use crate::file::{fsync_directory, FORMAT_VERSION_FILE, TABLES_FOLDER, WAL_FOLDER};
use crate::key::KeyKind;
use crate::memtable::Memtable;
use crate::metrics::Metrics;
use crate::range_key::{RangeKeyEntry, RangeKeyItem};
use crate::range_tombstone::RangeTombstone;
use crate::snapshot::SnapshotTracker;
use crate::stop_signal::{CancellationFlag, StopSignal};
use crate::table::{CompactionState, Table, TableId};
use crate::value::{InternalValue, SeqNo};
use crate::version::persist::{persist_version, recover_current, write_current};
use crate::version::{Version, VersionEdit};
use crate::{wal, KeyRange, UserKey};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A point-in-time snapshot of the write path: the active memtable, the
/// queue of flushables, and the current [`Version`] of disk files
#[derive(Clone)]
pub struct SuperVersion {
    /// Active memtable that is being written to
    pub active_memtable: Arc<Memtable>,

    /// Sealed memtables and ingested table sets, oldest first
    pub flush_queue: VecDeque<Flushable>,

    /// Current version of disk files
    pub version: Version,
}

/// A set of pre-built tables being ingested as though they were a flush
pub struct IngestedTables {
    pub tables: Vec<Table>,

    /// User-key span to atomically remove from all levels on apply
    pub excise_span: Option<KeyRange>,

    pub seqno: SeqNo,
}

/// A unit in the flush queue
#[derive(Clone)]
pub enum Flushable {
    Memtable(Arc<Memtable>),
    Ingested(Arc<IngestedTables>),
}

impl Flushable {
    /// Bytes that flushing this unit would drain.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Memtable(memtable) => memtable.size(),
            Self::Ingested(ingested) => ingested.tables.iter().map(Table::size).sum(),
        }
    }

    #[must_use]
    pub fn is_ingested(&self) -> bool {
        matches!(self, Self::Ingested(_))
    }

    #[must_use]
    pub fn is_flush_forced(&self) -> bool {
        match self {
            Self::Memtable(memtable) => memtable.is_flush_forced(),
            Self::Ingested(_) => true,
        }
    }
}

/// A compaction currently holding inputs
pub struct InProgressCompaction {
    pub job_id: u64,
    pub bounds: KeyRange,
    pub cancel: CancellationFlag,

    /// File numbers of outputs created so far, protected for the sweeper
    pub outputs: Vec<TableId>,
}

/// Serialises version-edit application and version installation
pub(crate) struct ManifestState {
    pub(crate) folder: PathBuf,

    /// Versions that are no longer current but may still be referenced by
    /// an open snapshot, with the seqno watermark at retirement
    pub(crate) free_list: VecDeque<(Version, SeqNo)>,
}

#[doc(hidden)]
pub struct EngineInner {
    pub config: Config,

    pub(crate) table_id_counter: Arc<AtomicU64>,
    job_id_counter: AtomicU64,
    next_memtable_id: AtomicU64,
    next_wal_num: AtomicU64,

    pub(crate) super_version: RwLock<SuperVersion>,

    /// Manifest lock; may briefly take the super-version write lock, so it
    /// must never be acquired while holding that lock
    pub(crate) manifest: Mutex<ManifestState>,

    pub(crate) snapshots: SnapshotTracker,
    pub(crate) hints: Mutex<Vec<DeletionHint>>,
    pub(crate) in_progress: Mutex<Vec<InProgressCompaction>>,

    pub(crate) manual_queue: Mutex<VecDeque<ManualCompaction>>,
    pub(crate) download_queue: Mutex<VecDeque<DownloadTask>>,
    pub(crate) read_compactions: Mutex<VecDeque<ReadCompaction>>,

    pub(crate) flushing: AtomicBool,
    pub(crate) compacting_count: AtomicUsize,
    pub(crate) downloading_count: AtomicUsize,

    pub(crate) disable_file_deletions: AtomicU32,

    /// Outputs of failed compactions, queued for deletion by file number
    /// (their backing may never have been installed)
    pub(crate) obsolete_outputs: Mutex<Vec<TableId>>,

    pub(crate) stop_signal: StopSignal,

    pub metrics: Arc<Metrics>,

    pub(crate) picker: RwLock<Arc<dyn CompactionPicker>>,
}

/// The compaction engine over one folder
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl std::ops::Deref for Engine {
    type Target = EngineInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Engine {
    /// Opens (or creates) the engine in the configured folder.
    pub fn open(config: Config) -> crate::Result<Self> {
        let path = config.path.clone();

        std::fs::create_dir_all(path.join(TABLES_FOLDER))?;
        std::fs::create_dir_all(path.join(WAL_FOLDER))?;
        fsync_directory(&path)?;

        let version = if path.join(crate::file::CURRENT_VERSION_FILE).try_exists()? {
            log::debug!("Recovering current version from {path:?}");
            recover_current(&path, &path.join(TABLES_FOLDER))?
        } else {
            let version = Version::with_level_count(0, config.level_count);
            let checksum = persist_version(&path, &version)?;
            write_current(&path, version.id(), checksum)?;

            crate::file::rewrite_atomic(
                &path.join(FORMAT_VERSION_FILE),
                crate::table::writer::FORMAT_VERSION.to_string().as_bytes(),
            )?;

            version
        };

        let max_table_id = version
            .referenced_file_ids()
            .into_iter()
            .max()
            .unwrap_or_default();

        let existing_wals = wal::list(&path.join(WAL_FOLDER))?;
        let max_wal = existing_wals.last().map(|(num, _)| *num).unwrap_or_default();

        if existing_wals.is_empty() {
            wal::create_segment(&path.join(WAL_FOLDER), max_wal)?;
        }

        let engine = Self(Arc::new(EngineInner {
            table_id_counter: Arc::new(AtomicU64::new(max_table_id + 1)),
            job_id_counter: AtomicU64::default(),
            next_memtable_id: AtomicU64::new(1),
            next_wal_num: AtomicU64::new(max_wal + 1),
            super_version: RwLock::new(SuperVersion {
                active_memtable: Arc::new(Memtable::new(0, max_wal)),
                flush_queue: VecDeque::new(),
                version: version.clone(),
            }),
            manifest: Mutex::new(ManifestState {
                folder: path,
                free_list: VecDeque::new(),
            }),
            snapshots: SnapshotTracker::default(),
            hints: Mutex::new(vec![]),
            in_progress: Mutex::new(vec![]),
            manual_queue: Mutex::new(VecDeque::new()),
            download_queue: Mutex::new(VecDeque::new()),
            read_compactions: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            compacting_count: AtomicUsize::new(0),
            downloading_count: AtomicUsize::new(0),
            disable_file_deletions: AtomicU32::new(0),
            obsolete_outputs: Mutex::new(vec![]),
            stop_signal: StopSignal::default(),
            metrics: Arc::new(Metrics::default()),
            picker: RwLock::new(Arc::new(crate::compaction::picker::LeveledPicker::new(
                config.target_file_size,
            ))),
            config,
        }));

        Ok(engine)
    }

    /// Replaces the compaction picker.
    pub fn set_picker(&self, picker: Arc<dyn CompactionPicker>) {
        *self.picker.write().expect("lock is poisoned") = picker;
    }

    /// Folder the engine operates in.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    #[must_use]
    pub fn tables_folder(&self) -> PathBuf {
        self.config.path.join(TABLES_FOLDER)
    }

    #[must_use]
    pub fn wal_folder(&self) -> PathBuf {
        self.config.path.join(WAL_FOLDER)
    }

    pub(crate) fn next_table_id(&self) -> TableId {
        self.table_id_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_job_id(&self) -> u64 {
        self.job_id_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Current version of disk files.
    #[must_use]
    pub fn current_version(&self) -> Version {
        self.super_version
            .read()
            .expect("lock is poisoned")
            .version
            .clone()
    }

    /// Stops all background work.
    pub fn close(&self) {
        self.stop_signal.send();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stop_signal.is_stopped()
    }

    // --- write path -------------------------------------------------------

    fn with_active<F: FnOnce(&Memtable)>(&self, f: F) {
        let sv = self.super_version.read().expect("lock is poisoned");
        f(&sv.active_memtable);
    }

    /// Inserts a key-value pair.
    pub fn insert<K: Into<UserKey>, V: Into<crate::UserValue>>(
        &self,
        key: K,
        value: V,
        seqno: SeqNo,
    ) {
        self.with_active(|memtable| {
            memtable.insert(InternalValue::from_components(
                key,
                value,
                seqno,
                KeyKind::Set,
            ));
        });
    }

    /// Inserts a merge operand.
    pub fn merge<K: Into<UserKey>, V: Into<crate::UserValue>>(
        &self,
        key: K,
        operand: V,
        seqno: SeqNo,
    ) {
        self.with_active(|memtable| {
            memtable.insert(InternalValue::from_components(
                key,
                operand,
                seqno,
                KeyKind::Merge,
            ));
        });
    }

    /// Deletes a key.
    pub fn remove<K: Into<UserKey>>(&self, key: K, seqno: SeqNo) {
        self.with_active(|memtable| {
            memtable.insert(InternalValue::new_tombstone(key, seqno));
        });
    }

    /// Weakly deletes a key (erases only the value directly beneath).
    pub fn remove_weak<K: Into<UserKey>>(&self, key: K, seqno: SeqNo) {
        self.with_active(|memtable| {
            memtable.insert(InternalValue::new_single_delete(key, seqno));
        });
    }

    /// Deletes all keys in `[start, end)`.
    pub fn remove_range<K: Into<UserKey>>(&self, start: K, end: K, seqno: SeqNo) {
        self.with_active(|memtable| {
            memtable.insert_range_tombstone(RangeTombstone::new(start, end, seqno));
        });
    }

    /// Sets a range key over `[start, end)`.
    pub fn set_range_key<K: Into<UserKey>, S: Into<crate::UserValue>, V: Into<crate::UserValue>>(
        &self,
        start: K,
        end: K,
        suffix: S,
        value: V,
        seqno: SeqNo,
    ) {
        self.with_active(|memtable| {
            memtable.insert_range_key(RangeKeyItem {
                start: start.into(),
                end: end.into(),
                entry: RangeKeyEntry::set(seqno, suffix, value),
            });
        });
    }

    /// Removes all range keys in `[start, end)`.
    pub fn delete_range_keys<K: Into<UserKey>>(&self, start: K, end: K, seqno: SeqNo) {
        self.with_active(|memtable| {
            memtable.insert_range_key(RangeKeyItem {
                start: start.into(),
                end: end.into(),
                entry: RangeKeyEntry::delete(seqno),
            });
        });
    }

    // --- memtable lifecycle ----------------------------------------------

    /// Seals the active memtable and starts a fresh one on a new WAL segment.
    ///
    /// Returns the sealed memtable, or `None` if it was empty.
    pub fn rotate_memtable(&self) -> crate::Result<Option<Arc<Memtable>>> {
        let wal_num = self.next_wal_num.fetch_add(1, Ordering::AcqRel);
        wal::create_segment(&self.wal_folder(), wal_num)?;

        let mut sv = self.super_version.write().expect("lock is poisoned");

        if sv.active_memtable.is_empty() {
            return Ok(None);
        }

        let memtable_id = self.next_memtable_id.fetch_add(1, Ordering::AcqRel);
        let sealed = std::mem::replace(
            &mut sv.active_memtable,
            Arc::new(Memtable::new(memtable_id, wal_num)),
        );

        log::trace!("Sealing memtable {}", sealed.id());
        sv.flush_queue.push_back(Flushable::Memtable(sealed.clone()));

        Ok(Some(sealed))
    }

    /// Creates a writer for a pre-built table that can be ingested later.
    ///
    /// The table lands in the engine's table folder under a fresh file
    /// number; it is not visible until [`Engine::ingest`] applies.
    pub fn ingestion_writer(&self) -> crate::Result<crate::table::writer::Writer> {
        let id = self.next_table_id();
        let path = self.tables_folder().join(id.to_string());
        crate::table::writer::Writer::new(path, id)
    }

    /// Enqueues pre-built tables for ingestion as a flushable.
    pub fn ingest(&self, tables: Vec<Table>, excise_span: Option<KeyRange>) {
        let seqno = tables.iter().map(|t| t.seqnos().1).max().unwrap_or(0);

        let mut sv = self.super_version.write().expect("lock is poisoned");
        sv.flush_queue.push_back(Flushable::Ingested(Arc::new(
            IngestedTables {
                tables,
                excise_span,
                seqno,
            },
        )));
    }

    /// Sum of flushable bytes waiting in the queue.
    #[must_use]
    pub fn ready_for_flush_bytes(&self) -> u64 {
        self.super_version
            .read()
            .expect("lock is poisoned")
            .flush_queue
            .iter()
            .map(Flushable::size)
            .sum()
    }

    /// Smallest seqno not yet flushed to a table.
    #[must_use]
    pub fn earliest_unflushed_seqno(&self) -> SeqNo {
        let sv = self.super_version.read().expect("lock is poisoned");

        sv.flush_queue
            .iter()
            .filter_map(|flushable| match flushable {
                Flushable::Memtable(m) => m.get_lowest_seqno(),
                Flushable::Ingested(i) => Some(i.seqno),
            })
            .chain(sv.active_memtable.get_lowest_seqno())
            .min()
            .unwrap_or(SeqNo::MAX)
    }

    /// Smallest WAL segment number still needed by an unflushed memtable.
    #[must_use]
    pub fn min_unflushed_log_num(&self) -> u64 {
        let sv = self.super_version.read().expect("lock is poisoned");

        sv.flush_queue
            .iter()
            .filter_map(|flushable| match flushable {
                Flushable::Memtable(m) => Some(m.log_num),
                Flushable::Ingested(_) => None,
            })
            .chain(std::iter::once(sv.active_memtable.log_num))
            .min()
            .expect("iterator is never empty")
    }

    // --- snapshots --------------------------------------------------------

    /// Registers an open snapshot at the given seqno.
    pub fn open_snapshot(&self, seqno: SeqNo) {
        self.snapshots.open(seqno);
    }

    /// Unregisters a snapshot.
    pub fn close_snapshot(&self, seqno: SeqNo) {
        self.snapshots.close(seqno);
    }

    // --- version edits ----------------------------------------------------

    /// Applies a version edit under the manifest lock and installs the new
    /// version ("log and apply").
    ///
    /// On persist failure the current version stays untouched.
    pub fn apply_version_edit(&self, version_edit: &VersionEdit) -> crate::Result<Version> {
        let mut manifest = self.manifest.lock().expect("lock is poisoned");
        self.apply_version_edit_locked(&mut manifest, version_edit)
    }

    pub(crate) fn apply_version_edit_locked(
        &self,
        manifest: &mut ManifestState,
        version_edit: &VersionEdit,
    ) -> crate::Result<Version> {
        let current = self.current_version();
        let next = current.apply(version_edit)?;

        let checksum = persist_version(&manifest.folder, &next)?;
        write_current(&manifest.folder, next.id(), checksum)?;

        {
            let mut sv = self.super_version.write().expect("lock is poisoned");
            sv.version = next.clone();
        }

        let watermark = self.snapshots.earliest();
        manifest.free_list.push_back((current, watermark));

        Ok(next)
    }

    /// Releases free-list versions that no open snapshot can reference
    /// anymore.
    pub(crate) fn release_old_versions(&self) {
        let mut manifest = self.manifest.lock().expect("lock is poisoned");
        let earliest = self.snapshots.earliest();

        while let Some((_, watermark)) = manifest.free_list.front() {
            // A version retired while snapshot W was the earliest open one
            // is safe to drop once that snapshot has closed
            if *watermark == SeqNo::MAX || earliest > *watermark {
                manifest.free_list.pop_front();
            } else {
                break;
            }
        }
    }

    // --- compaction bookkeeping ------------------------------------------

    pub(crate) fn register_in_progress(
        &self,
        job_id: u64,
        bounds: KeyRange,
    ) -> CancellationFlag {
        let cancel = CancellationFlag::default();

        self.in_progress
            .lock()
            .expect("lock is poisoned")
            .push(InProgressCompaction {
                job_id,
                bounds,
                cancel: cancel.clone(),
                outputs: vec![],
            });

        cancel
    }

    pub(crate) fn unregister_in_progress(&self, job_id: u64) {
        self.in_progress
            .lock()
            .expect("lock is poisoned")
            .retain(|c| c.job_id != job_id);
    }

    pub(crate) fn record_output(&self, job_id: u64, table_id: TableId) {
        let mut in_progress = self.in_progress.lock().expect("lock is poisoned");

        if let Some(entry) = in_progress.iter_mut().find(|c| c.job_id == job_id) {
            entry.outputs.push(table_id);
        }
    }

    /// Sets the cancel flag of every in-flight compaction whose key range
    /// overlaps `bounds`.
    pub(crate) fn cancel_overlapping(&self, bounds: &KeyRange, exclude_job: Option<u64>) {
        let in_progress = self.in_progress.lock().expect("lock is poisoned");

        for entry in in_progress.iter() {
            if Some(entry.job_id) == exclude_job {
                continue;
            }

            if entry.bounds.overlaps_with_key_range(bounds) {
                log::debug!(
                    "Cancelling compaction job {} (overlaps {bounds})",
                    entry.job_id,
                );
                entry.cancel.cancel();
            }
        }
    }

    /// Reverts or finalises the compacting markers of a compaction's inputs.
    ///
    /// On rollback all inputs return to `NotCompacting`. On success, inputs
    /// that left the version become `Compacted`; a trivially moved table is
    /// still live and returns to `NotCompacting`.
    pub(crate) fn clear_compacting_state(&self, picked: &PickedCompaction, rollback: bool) {
        let live = self.current_version().referenced_file_ids();

        for table in picked.iter_input_tables() {
            let state = if rollback || live.contains(&table.id()) {
                CompactionState::NotCompacting
            } else {
                CompactionState::Compacted
            };

            table.set_compaction_state(state);
        }
    }

    pub(crate) fn mark_compacting(&self, picked: &PickedCompaction) {
        for table in picked.iter_input_tables() {
            assert!(
                !table.is_compacting(),
                "table {} is already being compacted",
                table.id(),
            );
            table.set_compaction_state(CompactionState::Compacting);
        }
    }

    pub(crate) fn queue_obsolete_outputs(&self, ids: &[TableId]) {
        self.obsolete_outputs
            .lock()
            .expect("lock is poisoned")
            .extend(ids);
    }

    // --- manual / download / read queues ---------------------------------

    /// Enqueues a manual compaction over a key range.
    pub fn compact_range<K: Into<UserKey>>(&self, start: K, end: K, level: Option<usize>) {
        self.manual_queue
            .lock()
            .expect("lock is poisoned")
            .push_back(ManualCompaction {
                bounds: KeyRange::new((start.into(), end.into())),
                level,
                retries: 0,
            });
    }

    /// Enqueues a download (materialisation) of a virtual table.
    pub fn download_table(&self, table_id: TableId, level: usize) {
        self.download_queue
            .lock()
            .expect("lock is poisoned")
            .push_back(DownloadTask { table_id, level });
    }

    /// Re-queues a read compaction that could not run.
    pub(crate) fn reschedule_read_compaction(&self, rc: ReadCompaction) {
        self.read_compactions
            .lock()
            .expect("lock is poisoned")
            .push_back(rc);
    }

    // --- file deletions ---------------------------------------------------

    /// Defers all file deletions until re-enabled.
    pub fn disable_file_deletions(&self) {
        self.disable_file_deletions.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enables file deletions.
    pub fn enable_file_deletions(&self) {
        self.disable_file_deletions.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub(crate) fn file_deletions_disabled(&self) -> bool {
        self.disable_file_deletions.load(Ordering::Acquire) > 0
    }
}
