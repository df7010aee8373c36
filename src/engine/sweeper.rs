// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Obsolete-file collection, invoked after every version-edit apply.

use super::Engine;
use crate::table::TableId;
use crate::{wal, HashSet};
use std::path::PathBuf;

/// File numbers still referenced by any live version or in-flight
/// compaction.
fn live_table_ids(engine: &Engine) -> HashSet<TableId> {
    let mut live = engine.current_version().referenced_file_ids();

    {
        let manifest = engine.manifest.lock().expect("lock is poisoned");
        for (version, _) in &manifest.free_list {
            live.extend(version.referenced_file_ids());
        }
    }

    {
        let in_progress = engine.in_progress.lock().expect("lock is poisoned");
        for entry in in_progress.iter() {
            live.extend(entry.outputs.iter().copied());
        }
    }

    live
}

/// Collects all obsolete files, sorted by file number for deterministic
/// output: stale tables, WAL segments below the minimum unflushed segment,
/// and version files beyond the retention count.
pub fn scan_obsolete_files(engine: &Engine) -> crate::Result<Vec<(u64, PathBuf)>> {
    let mut files: Vec<(u64, PathBuf)> = vec![];

    // Failed compaction outputs are queued by file number; the directory
    // scan below re-discovers them, so the queue itself just drains
    engine
        .obsolete_outputs
        .lock()
        .expect("lock is poisoned")
        .clear();

    let live = live_table_ids(engine);

    for entry in std::fs::read_dir(engine.tables_folder())? {
        let entry = entry?;
        let path = entry.path();

        let Some(id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<TableId>().ok())
        else {
            continue;
        };

        if !live.contains(&id) {
            files.push((id, path));
        }
    }

    files.extend(wal::obsolete(
        &engine.wal_folder(),
        engine.min_unflushed_log_num(),
    )?);

    // Version files: everything that is neither current, referenced by the
    // free list, nor within the retention count
    {
        let manifest = engine.manifest.lock().expect("lock is poisoned");

        let mut referenced = HashSet::default();
        referenced.insert(engine.current_version().id());
        for (version, _) in &manifest.free_list {
            referenced.insert(version.id());
        }

        let mut version_files: Vec<(u64, PathBuf)> = vec![];

        for entry in std::fs::read_dir(&manifest.folder)? {
            let entry = entry?;
            let path = entry.path();

            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };

            if !referenced.contains(&id) {
                version_files.push((id, path));
            }
        }

        version_files.sort_by(|a, b| b.0.cmp(&a.0));
        files.extend(version_files.split_off(engine.config.num_previous_manifests.min(version_files.len())));
    }

    files.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    Ok(files)
}

/// Deletes everything [`scan_obsolete_files`] found, unless deletions are
/// currently disabled.
pub fn sweep(engine: &Engine) -> crate::Result<()> {
    if engine.file_deletions_disabled() {
        log::trace!("File deletions are disabled, deferring sweep");
        return Ok(());
    }

    for (num, path) in scan_obsolete_files(engine)? {
        log::trace!("Sweeping obsolete file {num} at {}", path.display());
        std::fs::remove_file(path)?;
    }

    Ok(())
}

impl Engine {
    /// Collects all currently obsolete files without deleting them,
    /// ordered by file number.
    pub fn scan_obsolete_files(&self) -> crate::Result<Vec<PathBuf>> {
        Ok(scan_obsolete_files(self)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Deletes all currently obsolete files, unless deletions are disabled.
    pub fn delete_obsolete_files(&self) -> crate::Result<()> {
        sweep(self)
    }
}
