// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Checkpoint producer: a consistent directory snapshot of the engine,
//! built without pausing writes.

use super::Engine;
use crate::file::{fsync_directory, link_or_copy, rewrite_atomic, FORMAT_VERSION_FILE, TABLES_FOLDER, WAL_FOLDER};
use crate::table::{Table, TableId};
use crate::version::persist::{persist_version, write_current};
use crate::version::{Level, Version};
use crate::{HashMap, KeyRange};
use std::path::Path;

fn is_excluded(table: &Table, restrict_to_spans: Option<&[KeyRange]>) -> bool {
    restrict_to_spans.is_some_and(|spans| {
        let range = table.key_range();
        !spans.iter().any(|span| span.overlaps_with_key_range(&range))
    })
}

fn build_checkpoint(
    version: &Version,
    wal_segments: &[(u64, std::path::PathBuf)],
    destination: &Path,
    restrict_to_spans: Option<&[KeyRange]>,
) -> crate::Result<()> {
    let tables_dst = destination.join(TABLES_FOLDER);
    let wal_dst = destination.join(WAL_FOLDER);

    std::fs::create_dir_all(&tables_dst)?;
    std::fs::create_dir_all(&wal_dst)?;

    let mut kept_levels = vec![];
    let mut required_backings: HashMap<TableId, Table> = HashMap::default();
    let mut linked: crate::HashSet<TableId> = crate::HashSet::default();

    for level in version.iter_levels() {
        let mut tables = vec![];

        for table in level.iter() {
            if is_excluded(table, restrict_to_spans) {
                // Equivalent of the synthetic deletion record in the
                // truncated manifest
                continue;
            }

            if let Some(backing) = table.backing() {
                required_backings.insert(backing.id(), backing.clone());
            }

            let physical_id = table.backing_id();
            if linked.insert(physical_id) {
                link_or_copy(&table.path, &tables_dst.join(physical_id.to_string()))?;
            }

            tables.push(table.clone());
        }

        kept_levels.push(Level { tables });
    }

    // Unused virtual backings are dropped from the checkpoint entirely
    let checkpoint_version = Version::from_levels(version.id(), kept_levels, required_backings);

    let checksum = persist_version(destination, &checkpoint_version)?;

    // WAL segments are copied, never linked: the source may recycle them
    for (num, path) in wal_segments {
        std::fs::copy(path, crate::wal::segment_path(&wal_dst, *num))?;
    }

    fsync_directory(&tables_dst)?;
    fsync_directory(&wal_dst)?;

    // The markers go last, making the checkpoint valid atomically
    rewrite_atomic(
        &destination.join(FORMAT_VERSION_FILE),
        crate::table::writer::FORMAT_VERSION.to_string().as_bytes(),
    )?;
    write_current(destination, checkpoint_version.id(), checksum)?;

    fsync_directory(destination)?;

    Ok(())
}

impl Engine {
    /// Creates a consistent point-in-time snapshot of the engine's files
    /// in `destination`.
    ///
    /// `restrict_to_spans` drops all tables outside the given spans.
    /// On any failure, the destination directory is unlinked.
    pub fn checkpoint(
        &self,
        destination: &Path,
        restrict_to_spans: Option<&[KeyRange]>,
    ) -> crate::Result<()> {
        log::debug!("Creating checkpoint in {}", destination.display());

        // Capture a consistent view under the manifest lock, then release:
        // all I/O below runs without any locks held
        let (version, min_unflushed) = {
            let _manifest = self.manifest.lock().expect("lock is poisoned");
            (self.current_version(), self.min_unflushed_log_num())
        };

        // WALs of queued memtables (and the active one) must be included
        let wal_segments = crate::wal::list(&self.wal_folder())?
            .into_iter()
            .filter(|(num, _)| *num >= min_unflushed)
            .collect::<Vec<_>>();

        std::fs::create_dir_all(destination)?;

        if let Some(parent) = destination.parent() {
            fsync_directory(parent)?;
        }

        let result = build_checkpoint(&version, &wal_segments, destination, restrict_to_spans);

        if let Err(e) = result {
            log::warn!("Checkpoint failed, unlinking {}", destination.display());
            std::fs::remove_dir_all(destination).ok();
            return Err(e);
        }

        Ok(())
    }
}
