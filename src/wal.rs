// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Thin facade over the WAL segment files.
//!
//! The WAL manager proper lives outside this crate; the compaction engine
//! only needs to enumerate segments (for checkpoints) and decide which ones
//! are obsolete (everything below the minimum unflushed segment).

use std::path::{Path, PathBuf};

/// Returns the file name of a WAL segment.
#[must_use]
pub fn segment_file_name(num: u64) -> String {
    format!("{num:06}.wal")
}

/// Returns the path of a WAL segment.
#[must_use]
pub fn segment_path(folder: &Path, num: u64) -> PathBuf {
    folder.join(segment_file_name(num))
}

/// Creates an empty WAL segment file.
pub fn create_segment(folder: &Path, num: u64) -> crate::Result<PathBuf> {
    let path = segment_path(folder, num);
    let file = std::fs::File::create(&path)?;
    file.sync_all()?;
    Ok(path)
}

/// Lists all WAL segments in the folder, ascending by segment number.
pub fn list(folder: &Path) -> crate::Result<Vec<(u64, PathBuf)>> {
    let mut segments = vec![];

    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(num) = name
            .strip_suffix(".wal")
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            segments.push((num, path));
        }
    }

    segments.sort_by_key(|(num, _)| *num);

    Ok(segments)
}

/// Returns the segments that are obsolete given the minimum unflushed
/// segment number.
pub fn obsolete(folder: &Path, min_unflushed: u64) -> crate::Result<Vec<(u64, PathBuf)>> {
    Ok(list(folder)?
        .into_iter()
        .filter(|(num, _)| *num < min_unflushed)
        .collect())
}
