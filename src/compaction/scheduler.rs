// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::flush::{self, FlushJob};
use super::hints::resolve_hints;
use super::runner::{self, CompactionJob};
use super::{CompactionKind, LevelInput, PickedCompaction, PickerEnv};
use crate::engine::{Engine, Flushable};
use crate::table::Table;
use crate::KeyRange;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// A unit of work chosen by the scheduler
pub enum WorkUnit {
    Flush(FlushJob),
    Compaction(CompactionJob),
    Download(CompactionJob),
}

fn picker_env(engine: &Engine, extra_in_progress: usize) -> PickerEnv {
    PickerEnv {
        // Disk statistics are a collaborator concern; the engine itself
        // never refuses work for space reasons
        disk_available: u64::MAX,
        earliest_snapshot_seqno: engine.snapshots.earliest(),
        earliest_unflushed_seqno: engine.earliest_unflushed_seqno(),
        in_progress: engine.compacting_count.load(Ordering::Acquire) + extra_in_progress,
        read_compactions: engine
            .read_compactions
            .lock()
            .expect("lock is poisoned")
            .len(),
    }
}

fn aggregate_bounds<'a, I: Iterator<Item = &'a Table>>(tables: I) -> KeyRange {
    KeyRange::aggregate(tables.map(Table::key_range).collect::<Vec<_>>().iter())
}

fn admit(engine: &Engine, units: &mut Vec<WorkUnit>, picked: PickedCompaction, download: bool) {
    let job_id = engine.next_job_id();
    let cancel = engine.register_in_progress(job_id, picked.bounds.clone());

    engine.mark_compacting(&picked);

    let job = CompactionJob {
        job_id,
        picked,
        cancel,
    };

    if download {
        engine.downloading_count.fetch_add(1, Ordering::AcqRel);
        units.push(WorkUnit::Download(job));
    } else {
        engine.compacting_count.fetch_add(1, Ordering::AcqRel);
        units.push(WorkUnit::Compaction(job));
    }
}

/// One scheduling pass.
///
/// Holds the manifest lock for the whole pass so a concurrent ingest
/// cannot invalidate the picker's choices. Never schedules anything when
/// closed or read-only.
#[allow(clippy::too_many_lines)]
pub fn schedule(engine: &Engine) -> crate::Result<Vec<WorkUnit>> {
    if engine.is_closed() || engine.config.read_only {
        return Ok(vec![]);
    }

    let _manifest = engine.manifest.lock().expect("lock is poisoned");

    let mut units: Vec<WorkUnit> = vec![];
    let version = engine.current_version();

    // Promote elapsed delayed-flush deadlines into forced flushes
    {
        let sv = engine.super_version.read().expect("lock is poisoned");
        let now = Instant::now();

        for flushable in &sv.flush_queue {
            if let Flushable::Memtable(memtable) = flushable {
                memtable.check_delayed_flush_deadline(now);
            }
        }
    }

    // 1. Flush, if enough bytes are ready (or forced)
    if !engine.flushing.load(Ordering::Acquire) {
        let flushables = {
            let sv = engine.super_version.read().expect("lock is poisoned");

            // An ingested flushable runs alone; otherwise take the prefix
            // of plain memtables
            match sv.flush_queue.front() {
                Some(Flushable::Ingested(_)) => {
                    vec![sv.flush_queue.front().expect("was just peeked").clone()]
                }
                Some(Flushable::Memtable(_)) => sv
                    .flush_queue
                    .iter()
                    .take_while(|f| !f.is_ingested())
                    .cloned()
                    .collect(),
                None => vec![],
            }
        };

        let ready_bytes: u64 = flushables.iter().map(Flushable::size).sum();
        let forced = flushables.iter().any(Flushable::is_flush_forced);

        if !flushables.is_empty() && (forced || ready_bytes >= engine.config.memtable_size / 2) {
            let job_id = engine.next_job_id();

            let bounds = flushables
                .iter()
                .filter_map(|f| match f {
                    Flushable::Memtable(m) => {
                        m.key_bounds().map(|(lo, hi)| KeyRange::new((lo, hi)))
                    }
                    Flushable::Ingested(i) => Some(aggregate_bounds(i.tables.iter())),
                })
                .collect::<Vec<_>>();

            let bounds = KeyRange::aggregate(bounds.iter());
            let cancel = engine.register_in_progress(job_id, bounds);

            engine.flushing.store(true, Ordering::Release);

            units.push(WorkUnit::Flush(FlushJob {
                job_id,
                flushables,
                cancel,
            }));
        }
    }

    let max_compactions = engine.config.max_concurrent_compactions;
    let mut picked_count = 0;

    let capacity_left = |engine: &Engine, picked_count: usize| {
        engine.compacting_count.load(Ordering::Acquire) + picked_count < max_compactions
    };

    // 2. Delete-only compaction from resolvable hints
    if capacity_left(engine, picked_count) {
        let snapshots = engine.snapshots.sample();

        let deletable = {
            let mut hints = engine.hints.lock().expect("lock is poisoned");
            resolve_hints(&mut hints, &version, &snapshots)
        };

        if !deletable.is_empty() {
            let mut inputs: Vec<LevelInput> = vec![];

            for (level, table) in deletable {
                match inputs.iter_mut().find(|input| input.level == level) {
                    Some(input) => input.tables.push(table),
                    None => inputs.push(LevelInput {
                        level,
                        tables: vec![table],
                    }),
                }
            }

            inputs.sort_by_key(|input| input.level);

            let bounds =
                aggregate_bounds(inputs.iter().flat_map(|input| input.tables.iter()));
            let output_level = inputs.last().expect("inputs are non-empty").level;

            admit(
                engine,
                &mut units,
                PickedCompaction {
                    kind: CompactionKind::DeleteOnly,
                    inputs,
                    output_level,
                    bounds,
                    max_output_file_size: engine.config.target_file_size,
                    max_overlap_bytes: engine.config.max_overlap_bytes(),
                },
                false,
            );
            picked_count += 1;
        }
    }

    // 3. Drain the manual queue; a request that cannot run now stays at
    // the head with its retry counter bumped
    while capacity_left(engine, picked_count) {
        let Some(mut manual) = engine
            .manual_queue
            .lock()
            .expect("lock is poisoned")
            .pop_front()
        else {
            break;
        };

        let env = picker_env(engine, picked_count);
        let picker = engine.picker.read().expect("lock is poisoned").clone();

        match picker.pick_manual(&version, &env, &manual) {
            (Some(picked), _) => {
                admit(engine, &mut units, picked, false);
                picked_count += 1;
            }
            (None, true) => {
                manual.retries += 1;
                log::trace!(
                    "Manual compaction over {} deferred (retry #{})",
                    manual.bounds,
                    manual.retries,
                );

                engine
                    .manual_queue
                    .lock()
                    .expect("lock is poisoned")
                    .push_front(manual);

                break;
            }
            (None, false) => {
                log::trace!("Manual compaction over {} is a no-op", manual.bounds);
            }
        }
    }

    // 4. Automatic picks
    while capacity_left(engine, picked_count) {
        let env = picker_env(engine, picked_count);
        let picker = engine.picker.read().expect("lock is poisoned").clone();

        let Some(picked) = picker
            .pick_auto(&version, &env)
            .or_else(|| picker.pick_elision_only(&version, &env))
        else {
            break;
        };

        admit(engine, &mut units, picked, false);
        picked_count += 1;
    }

    // 5. Downloads
    while engine.downloading_count.load(Ordering::Acquire)
        < engine.config.max_concurrent_downloads
    {
        let Some(task) = engine
            .download_queue
            .lock()
            .expect("lock is poisoned")
            .pop_front()
        else {
            break;
        };

        let Some(table) = version
            .level(task.level)
            .and_then(|level| level.iter().find(|t| t.id() == task.table_id))
            .cloned()
        else {
            log::debug!("Download target {} no longer exists", task.table_id);
            continue;
        };

        if table.is_compacting() {
            continue;
        }

        let bounds = table.key_range();

        admit(
            engine,
            &mut units,
            PickedCompaction {
                kind: CompactionKind::Copy,
                inputs: vec![LevelInput {
                    level: task.level,
                    tables: vec![table],
                }],
                output_level: task.level,
                bounds,
                max_output_file_size: engine.config.target_file_size,
                max_overlap_bytes: engine.config.max_overlap_bytes(),
            },
            true,
        );
    }

    Ok(units)
}

/// Executes one unit on the calling thread (the worker).
///
/// A cancelled compaction is retryable and not reported as an error.
pub fn run_unit(engine: &Engine, unit: WorkUnit) -> crate::Result<()> {
    let result = match unit {
        WorkUnit::Flush(job) => {
            let job_id = job.job_id;
            let result = flush::run(engine, &job);

            engine.flushing.store(false, Ordering::Release);
            engine.unregister_in_progress(job_id);

            result
        }
        WorkUnit::Compaction(job) => {
            let job_id = job.job_id;
            let kind = job.picked.kind;
            let result = runner::run(engine, &job);

            engine.compacting_count.fetch_sub(1, Ordering::AcqRel);
            engine.unregister_in_progress(job_id);

            if kind == CompactionKind::Read {
                if let Err(e) = &result {
                    if e.is_cancelled() {
                        engine.reschedule_read_compaction(super::ReadCompaction {
                            bounds: job.picked.bounds.clone(),
                            level: job.picked.start_level(),
                        });
                    }
                }
            }

            result
        }
        WorkUnit::Download(job) => {
            let job_id = job.job_id;
            let result = runner::run(engine, &job);

            engine.downloading_count.fetch_sub(1, Ordering::AcqRel);
            engine.unregister_in_progress(job_id);

            result
        }
    };

    engine.release_old_versions();

    // The sweeper runs after every version-edit apply
    crate::engine::sweeper::sweep(engine)?;

    match result {
        Err(e) if e.is_cancelled() => Ok(()),
        other => other,
    }
}

impl Engine {
    /// Runs one scheduling pass and executes all chosen units on the
    /// calling thread.
    ///
    /// Returns the number of units that ran.
    pub fn run_scheduler_pass(&self) -> crate::Result<usize> {
        let units = schedule(self)?;
        let count = units.len();

        for unit in units {
            run_unit(self, unit)?;
        }

        Ok(count)
    }

    /// Seals the active memtable and synchronously flushes everything in
    /// the queue.
    pub fn flush_active_memtable(&self) -> crate::Result<()> {
        if let Some(sealed) = self.rotate_memtable()? {
            sealed.force_flush();
        }

        // Forced entries may still be queued even if rotation was a no-op
        while self.run_scheduler_pass()? > 0 {}

        Ok(())
    }
}
