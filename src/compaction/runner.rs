// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::hints::{derive_hints, invalidate_after_zeroing, HintType};
use super::splitter::{
    FileSizeSplitter, GrandparentSplitter, L0SplitKeySplitter, OutputSplitter,
    PreventSplitUserKeys, SplitDecision, SplitterStack,
};
use super::stream::CompactionStream;
use super::{CompactionKind, PickedCompaction, MAX_INPUT_LEVELS};
use crate::buffer_pool::BufferPool;
use crate::engine::Engine;
use crate::events::CompactionEvent;
use crate::inuse::ElisionCursor;
use crate::level_scanner::LevelScanner;
use crate::merge::{BoxedIterator, MergeIterator};
use crate::range_key::{coalesce, fragment_range_keys, RangeKeyItem};
use crate::range_tombstone::RangeTombstone;
use crate::rangedel::{transform_fragment, Fragmenter};
use crate::stop_signal::CancellationFlag;
use crate::table::{writer::Writer, Table};
use crate::version::VersionEdit;
use crate::{KeyKind, KeyRange, SeqNo, SnapshotList, UserKey};
use std::collections::VecDeque;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

/// A scheduled compaction, ready to run on a worker
pub struct CompactionJob {
    pub job_id: u64,
    pub picked: PickedCompaction,
    pub cancel: CancellationFlag,
}

/// Runs a compaction job, reporting events and rolling back on failure.
pub fn run(engine: &Engine, job: &CompactionJob) -> crate::Result<()> {
    let start = Instant::now();
    let input_ids = job.picked.input_ids();

    engine
        .config
        .listener
        .on_compaction_begin(job.job_id, job.picked.kind, &input_ids);

    let result = run_inner(engine, job);

    let (outputs, error) = match &result {
        Ok(outputs) => (outputs.clone(), None),
        Err(e) => (vec![], Some(e.to_string())),
    };

    if let Err(e) = &result {
        // All input files return to NotCompacting; outputs become obsolete
        // by file number, because their backing may not be installed yet
        engine.clear_compacting_state(&job.picked, true);

        let orphans = {
            let in_progress = engine.in_progress.lock().expect("lock is poisoned");
            in_progress
                .iter()
                .find(|c| c.job_id == job.job_id)
                .map(|c| c.outputs.clone())
                .unwrap_or_default()
        };
        engine.queue_obsolete_outputs(&orphans);

        if e.is_cancelled() {
            engine.metrics.cancelled_count.fetch_add(1, Relaxed);
            log::debug!("Compaction job {} cancelled", job.job_id);
        } else {
            log::error!("Compaction job {} failed: {e:?}", job.job_id);
        }
    } else {
        engine.clear_compacting_state(&job.picked, false);

        match job.picked.kind {
            CompactionKind::Move => engine.metrics.move_count.fetch_add(1, Relaxed),
            CompactionKind::Copy => engine.metrics.copy_count.fetch_add(1, Relaxed),
            CompactionKind::DeleteOnly => {
                engine.metrics.delete_only_count.fetch_add(1, Relaxed)
            }
            _ => engine.metrics.compaction_count.fetch_add(1, Relaxed),
        };
    }

    engine.config.listener.on_compaction_end(&CompactionEvent {
        job_id: job.job_id,
        kind: job.picked.kind,
        start_level: job.picked.start_level(),
        output_level: job.picked.output_level,
        inputs: input_ids,
        outputs,
        duration: start.elapsed(),
        error,
    });

    result.map(|_| ())
}

fn run_inner(engine: &Engine, job: &CompactionJob) -> crate::Result<Vec<crate::table::TableId>> {
    let picked = &job.picked;

    if picked.inputs.len() > MAX_INPUT_LEVELS {
        return Err(crate::Error::InvariantViolation(
            "compaction has too many input levels",
        ));
    }

    let kind = promote_kind(engine, picked);

    match kind {
        CompactionKind::Move => run_move(engine, job),
        CompactionKind::Copy => run_copy(engine, job),
        CompactionKind::DeleteOnly => run_delete_only(engine, job),
        _ => run_rewrite(engine, job),
    }
}

/// A `Default` compaction with exactly one input file, an empty output
/// level and acceptable grandparent overlap is promoted to a trivial move.
fn promote_kind(engine: &Engine, picked: &PickedCompaction) -> CompactionKind {
    if picked.kind != CompactionKind::Default {
        return picked.kind;
    }

    if picked.input_table_count() != 1 {
        return picked.kind;
    }

    let version = engine.current_version();

    let output_empty = version
        .level(picked.output_level)
        .is_none_or(crate::version::Level::is_empty);

    if !output_empty {
        return picked.kind;
    }

    let grandparent_overlap: u64 = version
        .level(picked.output_level + 1)
        .map(|level| {
            level
                .overlapping(&picked.bounds)
                .map(Table::size)
                .sum::<u64>()
        })
        .unwrap_or_default();

    if grandparent_overlap <= picked.max_overlap_bytes {
        log::debug!("Promoting single-file compaction to trivial move");
        CompactionKind::Move
    } else {
        picked.kind
    }
}

fn single_input(picked: &PickedCompaction) -> crate::Result<(usize, Table)> {
    let input = picked
        .inputs
        .first()
        .ok_or(crate::Error::InvariantViolation("compaction has no inputs"))?;

    let table = input
        .tables
        .first()
        .ok_or(crate::Error::InvariantViolation("compaction has no inputs"))?;

    Ok((input.level, table.clone()))
}

/// Moves a single table into the output level, preserving bounds and
/// seqnos exactly.
fn run_move(engine: &Engine, job: &CompactionJob) -> crate::Result<Vec<crate::table::TableId>> {
    let (level, table) = single_input(&job.picked)?;

    log::debug!(
        "Moving table {} from L{level} to L{}",
        table.id(),
        job.picked.output_level,
    );

    job.cancel.check()?;

    let version_edit = VersionEdit::new()
        .delete_table(level, table.id())
        .add_table(job.picked.output_level, table.clone());

    engine.apply_version_edit(&version_edit)?;

    Ok(vec![table.id()])
}

/// Byte-for-byte copies a single table to a new file number.
///
/// Materialises virtual tables (downloads) and migrates files across
/// storage tiers.
fn run_copy(engine: &Engine, job: &CompactionJob) -> crate::Result<Vec<crate::table::TableId>> {
    let (level, table) = single_input(&job.picked)?;

    let new_id = engine.next_table_id();
    let new_path = engine.tables_folder().join(new_id.to_string());

    log::debug!("Copying table {} to {} (new file {new_id})", table.id(), new_path.display());

    engine.record_output(job.job_id, new_id);

    // I/O without any locks held
    let copied = if table.is_virtual() {
        // A virtual table only aliases part of its backing, so the copy
        // rewrites exactly the visible range
        let pool = BufferPool::default();
        let mut writer = Writer::new(new_path.clone(), new_id)?;

        for item in table.scan(&pool)? {
            writer.write(&item?)?;
        }

        let (range_dels, range_keys) = table.range_blocks(&pool)?;
        for tombstone in range_dels {
            writer.write_range_tombstone(tombstone);
        }
        for item in range_keys {
            writer.write_range_key(item);
        }

        let metadata = writer.finish()?.ok_or(crate::Error::InvariantViolation(
            "cannot materialise an empty virtual table",
        ))?;

        Table::from_metadata(metadata, new_path)
    } else {
        std::fs::copy(&table.path, &new_path)?;

        // The copy carries the old file number in its trailer; the handle
        // is authoritative for the new file number
        let mut metadata = table.metadata.clone();
        metadata.id = new_id;

        Table::from_metadata(metadata, new_path)
    };

    job.cancel.check()?;

    let mut version_edit = VersionEdit::new()
        .delete_table(level, table.id())
        .add_table(job.picked.output_level, copied);

    if table.is_virtual() {
        let backing_id = table.backing_id();
        let version = engine.current_version();

        // Drop the backing if this was its last referencing virtual table
        let still_referenced = version
            .iter_tables()
            .any(|t| t.id() != table.id() && t.is_virtual() && t.backing_id() == backing_id);

        if !still_referenced {
            version_edit = version_edit.remove_backing(backing_id);
        }
    }

    engine.apply_version_edit(&version_edit)?;

    Ok(vec![new_id])
}

/// Emits a version edit that deletes all input files; no new files.
fn run_delete_only(
    engine: &Engine,
    job: &CompactionJob,
) -> crate::Result<Vec<crate::table::TableId>> {
    let mut version_edit = VersionEdit::new();

    for input in &job.picked.inputs {
        for table in &input.tables {
            log::debug!("Delete-only compaction drops table {}", table.id());
            version_edit = version_edit.delete_table(input.level, table.id());
        }
    }

    job.cancel.check()?;
    engine.apply_version_edit(&version_edit)?;

    Ok(vec![])
}

/// The generic rewriting compaction.
fn run_rewrite(engine: &Engine, job: &CompactionJob) -> crate::Result<Vec<crate::table::TableId>> {
    let picked = &job.picked;
    let version = engine.current_version();
    let snapshots = engine.snapshots.sample();

    let inuse_lo = if picked.output_level == 0 {
        0
    } else {
        picked.output_level + 1
    };
    let in_use = version.in_use_key_ranges(inuse_lo, version.last_level_index(), &picked.bounds);

    // Zeroing is allowed iff nothing below the output is in use within the
    // compaction's bounds
    let allow_zero_seqno = in_use.is_empty();

    let pool = BufferPool::default();

    let mut point_iters: Vec<BoxedIterator> = vec![];
    let mut range_dels = vec![];
    let mut range_keys = vec![];

    for input in &picked.inputs {
        if input.level == 0 {
            // L0 tables overlap, so each one gets its own iterator
            for table in &input.tables {
                point_iters.push(Box::new(table.scan(&pool)?));
            }
        } else {
            point_iters.push(Box::new(LevelScanner::new(
                input.tables.clone(),
                pool.clone(),
            )));
        }

        // Range blocks are loaded eagerly and held for the compaction's
        // lifetime: tombstones in adjacent files of one level may overlap
        // in seqno space and are not globally ordered
        for table in &input.tables {
            let (dels, keys) = table.range_blocks(&pool)?;
            range_dels.extend(dels);
            range_keys.extend(keys);
        }
    }

    let grandparents = version
        .level(picked.output_level + 1)
        .map(|level| level.overlapping(&picked.bounds).cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let params = MergeParams {
        job_id: job.job_id,
        cancel: job.cancel.clone(),
        bounds: picked.bounds.clone(),
        output_level: picked.output_level,
        max_output_file_size: picked.max_output_file_size,
        max_overlap_bytes: picked.max_overlap_bytes,
        grandparents,
        l0_split_keys: vec![],
        allow_elision: true,
        allow_zero_seqno,
        in_use,
        snapshots,
        point_iters,
        range_dels,
        range_keys,
    };

    let outcome = run_merge(engine, params)?;

    // Cancellation is checked one final time before the edit applies
    job.cancel.check()?;

    let mut version_edit = VersionEdit::new();

    for input in &picked.inputs {
        for table in &input.tables {
            version_edit = version_edit.delete_table(input.level, table.id());
        }
    }

    for table in &outcome.outputs {
        version_edit = version_edit.add_table(picked.output_level, table.clone());
    }

    let next = engine.apply_version_edit(&version_edit)?;

    let max_input_seqno = picked
        .iter_input_tables()
        .map(|table| table.seqnos().1)
        .max()
        .unwrap_or(0);

    {
        let mut hints = engine.hints.lock().expect("lock is poisoned");

        // Zeroing seqnos can make previously issued hints misfire
        if allow_zero_seqno {
            invalidate_after_zeroing(&mut hints, &picked.bounds, max_input_seqno);
        }

        // Wide tombstones that survived into the outputs may wholly cover
        // lower files now
        if let Some(first) = outcome.outputs.first() {
            hints.extend(derive_hints(
                &next,
                picked.output_level,
                first.id(),
                &outcome.tombstone_spans,
            ));
        }
    }

    Ok(outcome.outputs.iter().map(Table::id).collect())
}

/// Inputs of the generic merge loop, shared between flushes and rewriting
/// compactions
pub(crate) struct MergeParams<'a> {
    pub job_id: u64,
    pub cancel: CancellationFlag,

    pub bounds: KeyRange,
    pub output_level: usize,

    pub max_output_file_size: u64,
    pub max_overlap_bytes: u64,
    pub grandparents: Vec<Table>,
    pub l0_split_keys: Vec<UserKey>,

    /// Flushes disable tombstone elision entirely
    pub allow_elision: bool,
    pub allow_zero_seqno: bool,
    pub in_use: Vec<KeyRange>,
    pub snapshots: SnapshotList,

    pub point_iters: Vec<BoxedIterator<'a>>,
    pub range_dels: Vec<RangeTombstone>,
    pub range_keys: Vec<RangeKeyItem>,
}

pub(crate) struct MergeOutcome {
    pub outputs: Vec<Table>,

    /// Spans of wide tombstones written to the outputs, for hint derivation
    pub tombstone_spans: Vec<(UserKey, UserKey, SeqNo, SeqNo, HintType)>,
}

/// Drives the compaction stream into output tables, cutting files at the
/// splitter's discretion.
#[allow(clippy::too_many_lines)]
pub(crate) fn run_merge(engine: &Engine, params: MergeParams<'_>) -> crate::Result<MergeOutcome> {
    let MergeParams {
        job_id,
        cancel,
        bounds,
        output_level,
        max_output_file_size,
        max_overlap_bytes,
        grandparents,
        l0_split_keys,
        allow_elision,
        allow_zero_seqno,
        in_use,
        snapshots,
        point_iters,
        range_dels,
        range_keys,
    } = params;

    let point_elision = if allow_elision {
        ElisionCursor::new(in_use.clone())
    } else {
        ElisionCursor::disabled()
    };

    let range_elision = ElisionCursor::new(in_use);

    // Fragment and stripe-transform the range tombstones up front
    let fragments = {
        let mut fragmenter = Fragmenter::new();
        fragmenter.extend(range_dels);
        fragmenter.fragment()
    };

    let mut pending_range_dels: VecDeque<RangeTombstone> = fragments
        .iter()
        .flat_map(|fragment| {
            let surviving = if allow_elision {
                transform_fragment(fragment, &snapshots, |start, end| {
                    range_elision.elide_range(start, end)
                })
            } else {
                fragment.seqnos.clone()
            };

            surviving
                .into_iter()
                .map(|seqno| RangeTombstone {
                    start: fragment.start.clone(),
                    end: fragment.end.clone(),
                    seqno,
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let mut pending_range_keys: VecDeque<RangeKeyItem> = fragment_range_keys(&range_keys)
        .iter()
        .map(|span| {
            if allow_elision {
                coalesce(span, &snapshots, |start, end| {
                    range_elision.elide_range(start, end)
                })
            } else {
                coalesce(span, &snapshots, |_, _| false)
            }
        })
        .flat_map(|span| {
            span.keys
                .iter()
                .map(|entry| RangeKeyItem {
                    start: span.start.clone(),
                    end: span.end.clone(),
                    entry: entry.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let merged = MergeIterator::new(point_iters);

    let mut stream = CompactionStream::new(merged, snapshots, allow_zero_seqno, point_elision)
        .with_range_dels(fragments)
        .with_merge_operator(engine.config.merge_operator.clone())
        .with_metrics(engine.metrics.clone())
        .peekable();

    let mut splitter = {
        let mut splitters: Vec<Box<dyn OutputSplitter>> = vec![
            Box::new(FileSizeSplitter::new(max_output_file_size)),
            Box::new(GrandparentSplitter::new(grandparents, max_overlap_bytes)),
        ];

        if output_level == 0 && !l0_split_keys.is_empty() {
            splitters.push(Box::new(L0SplitKeySplitter::new(l0_split_keys)));
        }

        PreventSplitUserKeys::new(SplitterStack::new(splitters))
    };

    let mut outputs: Vec<Table> = vec![];
    let mut tombstone_spans = vec![];
    let mut prev_point_largest: Option<UserKey> = None;

    loop {
        // Cancellation is cooperative: checked at the start of every
        // output-producing iteration
        cancel.check()?;

        let next_point_key = match stream.peek() {
            Some(Ok(item)) => Some(item.key.user_key.clone()),
            Some(Err(_)) => {
                return Err(stream
                    .next()
                    .expect("was just peeked")
                    .expect_err("should be an error"));
            }
            None => None,
        };

        let output_start = [
            next_point_key.clone(),
            pending_range_dels.front().map(|t| t.start.clone()),
            pending_range_keys.front().map(|k| k.start.clone()),
        ]
        .into_iter()
        .flatten()
        .min();

        let Some(output_start) = output_start else {
            break; // everything consumed
        };

        // A limit at or before the output start cannot make progress
        let suggestion = splitter
            .suggestion(&output_start)
            .filter(|limit| *limit > output_start);

        splitter.on_new_output(Some(output_start.as_ref()));

        let mut writer: Option<Writer> = None;
        let mut split_at: Option<UserKey> = None;

        loop {
            let key = match stream.peek() {
                Some(Ok(item)) => item.key.user_key.clone(),
                Some(Err(_)) => {
                    return Err(stream
                        .next()
                        .expect("was just peeked")
                        .expect_err("should be an error"));
                }
                None => break,
            };

            if let Some(limit) = &suggestion {
                if key >= *limit {
                    split_at = Some(limit.clone());
                    break;
                }
            }

            let writer_size = writer.as_ref().map_or(0, Writer::written_size);

            if splitter.should_split_before(&key, writer_size) == SplitDecision::SplitNow {
                split_at = Some(key);
                break;
            }

            let item = stream.next().expect("was just peeked")?;

            if writer.is_none() {
                // Cancellation is checked before a writer is opened
                cancel.check()?;

                let id = engine.next_table_id();
                let path = engine.tables_folder().join(id.to_string());
                engine.record_output(job_id, id);

                writer = Some(Writer::new(path, id)?);
            }

            writer
                .as_mut()
                .expect("writer was just opened")
                .write(&item)?;
        }

        finish_output(
            engine,
            job_id,
            &cancel,
            &bounds,
            writer,
            split_at.as_ref(),
            &mut pending_range_dels,
            &mut pending_range_keys,
            &mut prev_point_largest,
            &mut outputs,
            &mut tombstone_spans,
        )?;
    }

    Ok(MergeOutcome {
        outputs,
        tombstone_spans,
    })
}

/// Emits all pending spans strictly below `split_key` into the writer and
/// finalises the output file, checking the output invariants.
#[allow(clippy::too_many_arguments)]
fn finish_output(
    engine: &Engine,
    job_id: u64,
    cancel: &CancellationFlag,
    bounds: &KeyRange,
    mut writer: Option<Writer>,
    split_key: Option<&UserKey>,
    pending_range_dels: &mut VecDeque<RangeTombstone>,
    pending_range_keys: &mut VecDeque<RangeKeyItem>,
    prev_point_largest: &mut Option<UserKey>,
    outputs: &mut Vec<Table>,
    tombstone_spans: &mut Vec<(UserKey, UserKey, SeqNo, SeqNo, HintType)>,
) -> crate::Result<()> {
    let has_emittable_span = {
        let below = |start: &UserKey| split_key.is_none_or(|s| start < s);

        pending_range_dels.front().is_some_and(|t| below(&t.start))
            || pending_range_keys.front().is_some_and(|k| below(&k.start))
    };

    // A file holding only range entries must not start at its own split
    // key; spans starting at or past it stay pending for the next output
    if writer.is_none() && has_emittable_span {
        cancel.check()?;

        let id = engine.next_table_id();
        let path = engine.tables_folder().join(id.to_string());
        engine.record_output(job_id, id);

        writer = Some(Writer::new(path, id)?);
    }

    let Some(mut writer) = writer else {
        return Ok(());
    };

    // Emit pending range tombstones below the split key, clipped;
    // remainders stay pending, so adjacent outputs may share a fragment
    while let Some(tombstone) = pending_range_dels.front() {
        let emittable = split_key.is_none_or(|split| tombstone.start < *split);
        if !emittable {
            break;
        }

        let mut tombstone = pending_range_dels.pop_front().expect("was just peeked");

        if let Some(split) = split_key {
            if tombstone.end > *split {
                let remainder = RangeTombstone {
                    start: split.clone(),
                    end: tombstone.end.clone(),
                    seqno: tombstone.seqno,
                };
                pending_range_dels.push_front(remainder);
                tombstone.end = split.clone();
            }
        }

        tombstone_spans.push((
            tombstone.start.clone(),
            tombstone.end.clone(),
            tombstone.seqno,
            tombstone.seqno,
            HintType::PointOnly,
        ));

        writer.write_range_tombstone(tombstone);
    }

    while let Some(item) = pending_range_keys.front() {
        let emittable = split_key.is_none_or(|split| item.start < *split);
        if !emittable {
            break;
        }

        let mut item = pending_range_keys.pop_front().expect("was just peeked");

        if let Some(split) = split_key {
            if item.end > *split {
                let mut remainder = item.clone();
                remainder.start = split.clone();
                pending_range_keys.push_front(remainder);
                item.end = split.clone();
            }
        }

        if item.entry.kind == KeyKind::RangeKeyDelete {
            tombstone_spans.push((
                item.start.clone(),
                item.end.clone(),
                item.entry.seqno,
                item.entry.seqno,
                HintType::RangeKeyOnly,
            ));
        }

        writer.write_range_key(item);
    }

    let Some(metadata) = writer.finish()? else {
        return Ok(());
    };

    // Invariant: output bounds lie within the compaction's bounds
    let output_range = metadata.key_range();
    if !bounds.contains_range(&output_range) {
        return Err(crate::Error::InvariantViolation(
            "output bounds escape compaction bounds",
        ));
    }

    // Invariant: no user key may span two outputs
    if let (Some(prev), Some(point_range)) = (&prev_point_largest, &metadata.point_key_range) {
        if point_range.min() <= prev {
            return Err(crate::Error::InvariantViolation(
                "user key split across outputs",
            ));
        }
    }

    // Invariant: emitted range tombstones end at or before the split key
    if let (Some(split), Some(range)) = (split_key, &metadata.range_key_range) {
        if range.max() > split {
            return Err(crate::Error::InvariantViolation(
                "range tombstone escapes split key",
            ));
        }
    }

    if let Some(point_range) = &metadata.point_key_range {
        *prev_point_largest = Some(point_range.max().clone());
    }

    engine.metrics.bytes_written.fetch_add(metadata.file_size, Relaxed);
    engine.metrics.tables_created.fetch_add(1, Relaxed);

    let path = engine.tables_folder().join(metadata.id.to_string());
    log::trace!(
        "Compaction output {} finished ({} bytes)",
        metadata.id,
        metadata.file_size,
    );

    outputs.push(Table::from_metadata(metadata, path));

    Ok(())
}
