// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::runner::{run_merge, MergeParams};
use crate::engine::{Engine, Flushable, IngestedTables};
use crate::events::FlushEvent;
use crate::memtable::Memtable;
use crate::merge::BoxedIterator;
use crate::stop_signal::CancellationFlag;
use crate::table::{key_successor, Table};
use crate::version::{Version, VersionEdit};
use crate::KeyRange;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Instant;

/// A flushed table is assumed to be about 5x smaller than the memtable
/// content it drains. Real compression ratios vary; this is a fixed
/// approximation.
const APPROX_COMPRESSION_RATIO: f64 = 0.2;

/// A scheduled flush, ready to run on a worker
pub struct FlushJob {
    pub job_id: u64,

    /// Prefix of the flush queue; an ingested flushable is always alone
    pub flushables: Vec<Flushable>,

    pub cancel: CancellationFlag,
}

/// Runs a flush job, reporting events and rolling back on failure.
pub fn run(engine: &Engine, job: &FlushJob) -> crate::Result<()> {
    let start = Instant::now();

    let memtable_ids = job
        .flushables
        .iter()
        .filter_map(|f| match f {
            Flushable::Memtable(m) => Some(m.id()),
            Flushable::Ingested(_) => None,
        })
        .collect::<Vec<_>>();

    engine.config.listener.on_flush_begin(job.job_id, &memtable_ids);

    let result = run_inner(engine, job);

    let (outputs, error) = match &result {
        Ok(outputs) => (outputs.clone(), None),
        Err(e) => (vec![], Some(e.to_string())),
    };

    if let Err(e) = &result {
        let orphans = {
            let in_progress = engine.in_progress.lock().expect("lock is poisoned");
            in_progress
                .iter()
                .find(|c| c.job_id == job.job_id)
                .map(|c| c.outputs.clone())
                .unwrap_or_default()
        };
        engine.queue_obsolete_outputs(&orphans);

        log::error!("Flush job {} failed: {e:?}", job.job_id);
    } else {
        engine.metrics.flush_count.fetch_add(1, Relaxed);
    }

    engine.config.listener.on_flush_end(&FlushEvent {
        job_id: job.job_id,
        memtables: memtable_ids,
        bytes_flushed: job.flushables.iter().map(Flushable::size).sum(),
        empty: outputs.is_empty() && error.is_none(),
        outputs,
        duration: start.elapsed(),
        error,
    });

    result.map(|_| ())
}

fn run_inner(engine: &Engine, job: &FlushJob) -> crate::Result<Vec<crate::table::TableId>> {
    // The ingested-flushable fast path never streams data
    if let Some(Flushable::Ingested(ingested)) = job.flushables.first() {
        assert!(
            job.flushables.len() == 1,
            "an ingested flushable must be flushed alone",
        );
        return run_ingest(engine, job, &ingested.clone());
    }

    let memtables = job
        .flushables
        .iter()
        .map(|f| match f {
            Flushable::Memtable(m) => m.clone(),
            Flushable::Ingested(_) => unreachable!("checked above"),
        })
        .collect::<Vec<_>>();

    run_memtable_flush(engine, job, &memtables)
}

/// Bumps the grandparent overlap budget so a flush over a heavily
/// fragmented base level cannot shatter into thousands of tiny files.
fn adjust_max_overlap_bytes(
    engine: &Engine,
    max_overlap_bytes: u64,
    inuse_bytes: u64,
    grandparent_bytes: u64,
) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let approx_bytes = APPROX_COMPRESSION_RATIO * inuse_bytes as f64;

    let approx_file_count = (approx_bytes / engine.config.target_file_size as f64).ceil();
    let acceptable_file_count = (4.0 * approx_file_count).max(1.0);

    #[allow(clippy::cast_precision_loss)]
    let file_count_upper_bound = grandparent_bytes as f64 / max_overlap_bytes as f64;

    if file_count_upper_bound <= acceptable_file_count {
        return max_overlap_bytes;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let adjusted =
        (max_overlap_bytes as f64 * (file_count_upper_bound / acceptable_file_count)) as u64;

    log::debug!(
        "Fattening flush overlap budget {max_overlap_bytes} -> {adjusted} \
         (grandparent bytes: {grandparent_bytes})",
    );

    adjusted
}

fn run_memtable_flush(
    engine: &Engine,
    job: &FlushJob,
    memtables: &[Arc<Memtable>],
) -> crate::Result<Vec<crate::table::TableId>> {
    let version = engine.current_version();
    let snapshots = engine.snapshots.sample();

    let bounds = {
        let mut min = None;
        let mut max = None;

        for memtable in memtables {
            if let Some((lo, hi)) = memtable.key_bounds() {
                if min.as_ref().is_none_or(|m| lo < *m) {
                    min = Some(lo);
                }
                if max.as_ref().is_none_or(|m| hi > *m) {
                    max = Some(hi);
                }
            }
        }

        match (min, max) {
            (Some(min), Some(max)) => KeyRange::new((min, max)),
            _ => {
                log::debug!("Flush job {} drained no rows", job.job_id);
                return finish_flush(engine, job, vec![]);
            }
        }
    };

    let inuse_bytes: u64 = memtables.iter().map(|m| m.size()).sum();

    let base_level = version.base_level();
    let grandparents = version
        .level(base_level)
        .map(|level| level.overlapping(&bounds).cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let grandparent_bytes: u64 = grandparents.iter().map(Table::size).sum();

    let max_overlap_bytes = adjust_max_overlap_bytes(
        engine,
        engine.config.max_overlap_bytes(),
        inuse_bytes,
        grandparent_bytes,
    );

    let mut point_iters: Vec<BoxedIterator> = vec![];
    let mut range_dels = vec![];
    let mut range_keys = vec![];

    for memtable in memtables {
        point_iters.push(Box::new(memtable.iter().map(Ok)));
        range_dels.extend(memtable.range_tombstones());
        range_keys.extend(memtable.range_keys());
    }

    let params = MergeParams {
        job_id: job.job_id,
        cancel: job.cancel.clone(),
        bounds,
        output_level: 0,
        max_output_file_size: engine.config.target_file_size,
        max_overlap_bytes,
        grandparents,
        l0_split_keys: version.l0_split_keys(),

        // A flush cannot see sibling memtables, so in-use key ranges
        // computed from the version alone would be wrong: never elide,
        // never zero
        allow_elision: false,
        allow_zero_seqno: false,
        in_use: vec![],

        snapshots,
        point_iters,
        range_dels,
        range_keys,
    };

    let outcome = run_merge(engine, params)?;

    finish_flush(engine, job, outcome.outputs)
}

/// Applies the flush edit and pops the drained flushables off the queue.
fn finish_flush(
    engine: &Engine,
    job: &FlushJob,
    outputs: Vec<Table>,
) -> crate::Result<Vec<crate::table::TableId>> {
    job.cancel.check()?;

    if !outputs.is_empty() {
        let mut version_edit = VersionEdit::new();
        for table in &outputs {
            version_edit = version_edit.add_table(0, table.clone());
        }

        engine.apply_version_edit(&version_edit)?;
    }

    pop_flushables(engine, job.flushables.len());

    Ok(outputs.iter().map(Table::id).collect())
}

fn pop_flushables(engine: &Engine, n: usize) {
    let mut sv = engine.super_version.write().expect("lock is poisoned");
    for _ in 0..n {
        sv.flush_queue.pop_front();
    }
}

/// Chooses the deepest level the ingested table can land on without
/// shadowing newer data.
///
/// A level whose only overlap is a single point-only file that sparsely
/// straddles the ingest bounds is still usable: that file is split into
/// virtual pieces around the ingested table.
fn pick_ingest_target_level(version: &Version, table: &Table) -> (usize, Option<Table>) {
    let bounds = table.key_range();

    let mut target = 0;
    let mut split = None;

    for (level_idx, level) in version.iter_levels().enumerate().skip(1) {
        let overlapping = level.overlapping(&bounds).collect::<Vec<_>>();

        match *overlapping {
            [] => {
                target = level_idx;
                split = None;
            }
            [candidate]
                if candidate.key_range().min() < bounds.min()
                    && candidate.key_range().max() > bounds.max()
                    && !candidate.is_compacting()
                    && candidate.metadata.range_del_count == 0
                    && candidate.metadata.range_key_count == 0 =>
            {
                target = level_idx;
                split = Some(candidate.clone());
            }
            _ => break,
        }
    }

    (target, split)
}

/// Splits a sparsely straddling file into exact-bounded virtual pieces
/// around `[cut_start, cut_end]` (inclusive).
///
/// Returns `None` (no split) if the file actually holds keys inside the
/// cut, which only a scan of the backing can prove.
fn split_straddling(
    engine: &Engine,
    version_edit: VersionEdit,
    level: usize,
    table: &Table,
    cut_start: &crate::UserKey,
    cut_end: &crate::UserKey,
) -> crate::Result<Option<VersionEdit>> {
    let pool = crate::buffer_pool::BufferPool::default();

    let mut left: Option<(crate::UserKey, crate::UserKey)> = None;
    let mut right: Option<(crate::UserKey, crate::UserKey)> = None;

    for item in table.scan(&pool)? {
        let key = item?.key.user_key;

        if key >= *cut_start && key <= *cut_end {
            return Ok(None);
        }

        let side = if key < *cut_start { &mut left } else { &mut right };
        match side {
            Some((_, hi)) => *hi = key,
            None => *side = Some((key.clone(), key)),
        }
    }

    let backing = table.backing().unwrap_or(table).clone();
    let mut version_edit = version_edit.delete_table(level, table.id());

    if let Some((lo, hi)) = left {
        let piece = Table::new_virtual_with_point_bounds(
            engine.next_table_id(),
            &backing,
            table.key_range().min().clone(),
            cut_start.clone(),
            Some(KeyRange::new((lo, hi))),
        );
        version_edit = version_edit.add_table(level, piece);
    }

    if let Some((lo, hi)) = right {
        let piece = Table::new_virtual_with_point_bounds(
            engine.next_table_id(),
            &backing,
            key_successor(cut_end),
            key_successor(table.key_range().max()),
            Some(KeyRange::new((lo, hi))),
        );
        version_edit = version_edit.add_table(level, piece);
    }

    Ok(Some(version_edit.add_backing(backing)))
}

/// Replaces `table` with up to two virtual pieces covering the parts
/// outside the half-open span `[cut_start, cut_end)`.
fn virtualize_around(
    engine: &Engine,
    version_edit: VersionEdit,
    level: usize,
    table: &Table,
    cut_start: &crate::UserKey,
    cut_end: &crate::UserKey,
) -> VersionEdit {
    let mut version_edit = version_edit.delete_table(level, table.id());

    let backing = table.backing().unwrap_or(table).clone();
    let range = table.key_range();

    // keep [min, cut_start)
    if range.min() < cut_start {
        let piece = Table::new_virtual(
            engine.next_table_id(),
            &backing,
            range.min().clone(),
            cut_start.clone(),
        );
        version_edit = version_edit.add_table(level, piece);
    }

    // keep [cut_end, successor(max))
    if range.max() >= cut_end {
        let piece = Table::new_virtual(
            engine.next_table_id(),
            &backing,
            cut_end.clone(),
            key_successor(range.max()),
        );
        version_edit = version_edit.add_table(level, piece);
    }

    version_edit.add_backing(backing)
}

/// The ingested-flushable fast path: no data is streamed.
///
/// Existing files overlapping the excise span are replaced by virtual
/// remainders; overlapping in-flight compactions are cancelled; the
/// ingested tables are placed at their target levels.
fn run_ingest(
    engine: &Engine,
    job: &FlushJob,
    ingested: &Arc<IngestedTables>,
) -> crate::Result<Vec<crate::table::TableId>> {
    let version = engine.current_version();
    let mut version_edit = VersionEdit::new();

    if let Some(excise) = &ingested.excise_span {
        let excise_bounds = KeyRange::new((excise.min().clone(), excise.max().clone()));

        for (level_idx, level) in version.iter_levels().enumerate() {
            for table in level.iter() {
                if !table.key_range().overlaps_with_span(excise.min(), excise.max()) {
                    continue;
                }

                log::debug!(
                    "Excising table {} at L{level_idx} for ingest",
                    table.id(),
                );

                version_edit = virtualize_around(
                    engine,
                    version_edit,
                    level_idx,
                    table,
                    excise.min(),
                    excise.max(),
                );
            }
        }

        // Any in-flight compaction over the excised span would apply a
        // stale edit
        engine.cancel_overlapping(&excise_bounds, Some(job.job_id));
    }

    for table in &ingested.tables {
        let range = table.key_range();

        let contained_in_excise = ingested.excise_span.as_ref().is_some_and(|excise| {
            excise.min() <= range.min() && range.max() < excise.max()
        });

        let target = if contained_in_excise {
            version.last_level_index()
        } else {
            let (mut target, straddled) = pick_ingest_target_level(&version, table);

            if let Some(straddled) = straddled {
                match split_straddling(
                    engine,
                    version_edit.clone(),
                    target,
                    &straddled,
                    range.min(),
                    range.max(),
                )? {
                    Some(edit) => version_edit = edit,
                    None => {
                        // The file holds keys inside the ingest bounds
                        // after all; fall back to L0, which tolerates
                        // overlap
                        target = 0;
                    }
                }
            }

            target
        };

        log::debug!("Ingesting table {} at L{target}", table.id());
        version_edit = version_edit.add_table(target, table.clone());
    }

    job.cancel.check()?;
    engine.apply_version_edit(&version_edit)?;

    pop_flushables(engine, 1);

    Ok(ingested.tables.iter().map(Table::id).collect())
}
