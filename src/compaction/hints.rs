// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::table::{Table, TableId};
use crate::{KeyRange, SeqNo, SnapshotList, UserKey, Version};

/// Which key classes a deletion hint may delete
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HintType {
    /// Derived from a range tombstone; must not delete files with range keys
    PointOnly,

    /// Derived from a range-key delete; must not delete files with point keys
    RangeKeyOnly,

    /// Derived from both
    Both,
}

/// A recorded observation that a wide tombstone wholly covers one or more
/// lower-level files
///
/// Once every relevant snapshot stripe has closed, the covered files can be
/// dropped by a delete-only compaction, without a merge.
#[derive(Clone, Debug)]
pub struct DeletionHint {
    /// Inclusive start of the covered span
    pub start: UserKey,

    /// Exclusive end of the covered span
    pub end: UserKey,

    /// Level of the file containing the tombstone
    pub tombstone_level: usize,

    /// File containing the tombstone
    pub tombstone_file: TableId,

    pub tombstone_smallest_seqno: SeqNo,
    pub tombstone_largest_seqno: SeqNo,

    /// Smallest seqno of the covered files at hint-creation time
    pub file_smallest_seqno: SeqNo,

    pub hint_type: HintType,
}

impl DeletionHint {
    /// A hint is resolvable once the tombstone and the covered files share
    /// a snapshot stripe (no open snapshot separates them).
    #[must_use]
    pub fn is_resolvable(&self, snapshots: &SnapshotList) -> bool {
        snapshots.stripe(self.tombstone_largest_seqno) == snapshots.stripe(self.file_smallest_seqno)
    }

    /// Returns `true` if `table` can be deleted outright under this hint.
    #[must_use]
    pub fn can_delete(&self, table: &Table, snapshots: &SnapshotList) -> bool {
        let (file_lo, file_hi) = table.seqnos();

        if file_hi >= self.tombstone_smallest_seqno {
            return false;
        }

        if file_lo < self.file_smallest_seqno {
            return false;
        }

        if snapshots.stripe(self.tombstone_largest_seqno) != snapshots.stripe(file_lo) {
            return false;
        }

        match self.hint_type {
            HintType::PointOnly if table.metadata.range_key_count > 0 => return false,
            HintType::RangeKeyOnly
                if table.metadata.item_count > 0 || table.metadata.range_del_count > 0 =>
            {
                return false;
            }
            _ => {}
        }

        let range = table.key_range();
        self.start.as_ref() <= range.min().as_ref() && range.max().as_ref() < self.end.as_ref()
    }

    /// Returns `true` if this hint's span overlaps the half-open `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        range.overlaps_with_span(&self.start, &self.end)
    }
}

/// Derives hints for every lower-level file wholly covered by one of the
/// given tombstone spans.
#[must_use]
pub fn derive_hints(
    version: &Version,
    tombstone_level: usize,
    tombstone_file: TableId,
    spans: &[(UserKey, UserKey, SeqNo, SeqNo, HintType)],
) -> Vec<DeletionHint> {
    let mut hints = vec![];

    for (start, end, smallest_seqno, largest_seqno, hint_type) in spans {
        let mut file_smallest_seqno = SeqNo::MAX;
        let mut covered_any = false;

        for level in version.iter_levels().skip(tombstone_level + 1) {
            for table in level.iter() {
                let range = table.key_range();

                if start.as_ref() <= range.min().as_ref()
                    && range.max().as_ref() < end.as_ref()
                    && table.seqnos().1 < *smallest_seqno
                {
                    covered_any = true;
                    file_smallest_seqno = file_smallest_seqno.min(table.seqnos().0);
                }
            }
        }

        if covered_any {
            hints.push(DeletionHint {
                start: start.clone(),
                end: end.clone(),
                tombstone_level,
                tombstone_file,
                tombstone_smallest_seqno: *smallest_seqno,
                tombstone_largest_seqno: *largest_seqno,
                file_smallest_seqno,
                hint_type: *hint_type,
            });
        }
    }

    hints
}

/// Drops hints that a seqno-zeroing compaction may have invalidated.
///
/// A hint is dropped when its span overlaps the compaction's bounds and its
/// tombstone is not older than all of the compaction's inputs.
pub fn invalidate_after_zeroing(
    hints: &mut Vec<DeletionHint>,
    bounds: &KeyRange,
    max_input_seqno: SeqNo,
) {
    let before = hints.len();

    hints.retain(|hint| {
        !(hint.overlaps(bounds) && hint.tombstone_smallest_seqno <= max_input_seqno)
    });

    if hints.len() != before {
        log::debug!(
            "Invalidated {} deletion hint(s) after seqno-zeroing compaction",
            before - hints.len(),
        );
    }
}

/// Resolves hints against the current version.
///
/// Returns the files (with their levels) that can be deleted without a
/// merge, and retains only the hints that are not yet resolvable.
/// Files already being compacted are skipped.
#[must_use]
pub fn resolve_hints(
    hints: &mut Vec<DeletionHint>,
    version: &Version,
    snapshots: &SnapshotList,
) -> Vec<(usize, Table)> {
    let mut deletable: Vec<(usize, Table)> = vec![];

    hints.retain(|hint| {
        if !hint.is_resolvable(snapshots) {
            return true;
        }

        for (level_idx, level) in version.iter_levels().enumerate().skip(hint.tombstone_level + 1)
        {
            for table in level.iter() {
                if table.is_compacting() {
                    continue;
                }

                if deletable.iter().any(|(_, t)| t.id() == table.id()) {
                    continue;
                }

                if hint.can_delete(table, snapshots) {
                    deletable.push((level_idx, table.clone()));
                }
            }
        }

        // resolvable hints are consumed, whether or not files matched
        false
    });

    deletable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableMetadata;
    use test_log::test;

    fn table_with_seqnos(id: TableId, min: &str, max: &str, seqnos: (SeqNo, SeqNo)) -> Table {
        Table::from_metadata(
            TableMetadata {
                id,
                file_size: 100,
                item_count: 1,
                tombstone_count: 0,
                range_del_count: 0,
                range_key_count: 0,
                seqnos,
                point_key_range: Some(KeyRange::new((min.into(), max.into()))),
                range_key_range: None,
            },
            std::path::PathBuf::from(format!("/tmp/{id}")),
        )
    }

    fn hint(t_lo: SeqNo, t_hi: SeqNo, file_lo: SeqNo) -> DeletionHint {
        DeletionHint {
            start: "a".into(),
            end: "z".into(),
            tombstone_level: 1,
            tombstone_file: 99,
            tombstone_smallest_seqno: t_lo,
            tombstone_largest_seqno: t_hi,
            file_smallest_seqno: file_lo,
            hint_type: HintType::PointOnly,
        }
    }

    #[test]
    fn hint_resolvability_stripes() {
        // stripes: [0,10], (10,20], (20,inf)
        let snapshots = SnapshotList::new(vec![10, 20]);

        // tombstone in stripe 1, file seqnos in stripe 0 -> NOT resolvable
        assert!(!hint(12, 15, 5).is_resolvable(&snapshots));

        // both in stripe 1 -> resolvable
        assert!(hint(12, 15, 11).is_resolvable(&snapshots));

        // snapshot at 10 closes -> both in the same stripe now
        let snapshots = SnapshotList::new(vec![20]);
        assert!(hint(12, 15, 5).is_resolvable(&snapshots));
    }

    #[test]
    fn hint_can_delete_checks() {
        let snapshots = SnapshotList::default();
        let h = hint(50, 60, 5);

        // covered: bounds within [a, z), seqnos below tombstone
        assert!(h.can_delete(&table_with_seqnos(1, "b", "c", (5, 10)), &snapshots));

        // file max seqno >= tombstone smallest
        assert!(!h.can_delete(&table_with_seqnos(2, "b", "c", (5, 50)), &snapshots));

        // file seqno below the hint's observed smallest
        assert!(!h.can_delete(&table_with_seqnos(3, "b", "c", (1, 10)), &snapshots));

        // bounds not contained ("z" is not < exclusive end "z")
        assert!(!h.can_delete(&table_with_seqnos(4, "b", "z", (5, 10)), &snapshots));
    }

    #[test]
    fn hint_type_match() {
        let snapshots = SnapshotList::default();

        let mut h = hint(50, 60, 5);
        h.hint_type = HintType::PointOnly;

        let mut meta_with_range_keys = table_with_seqnos(1, "b", "c", (5, 10)).metadata.clone();
        meta_with_range_keys.range_key_count = 1;
        let table = Table::from_metadata(meta_with_range_keys, "/tmp/1".into());

        assert!(!h.can_delete(&table, &snapshots));

        h.hint_type = HintType::Both;
        assert!(h.can_delete(&table, &snapshots));
    }

    #[test]
    fn hint_invalidation_after_zeroing() {
        let mut hints = vec![hint(50, 60, 5)];

        // disjoint bounds: hint survives
        invalidate_after_zeroing(
            &mut hints,
            &KeyRange::new(("za".into(), "zz".into())),
            100,
        );
        assert_eq!(1, hints.len());

        // overlapping bounds but tombstone newer than all inputs: survives
        invalidate_after_zeroing(&mut hints, &KeyRange::new(("a".into(), "c".into())), 40);
        assert_eq!(1, hints.len());

        // overlapping and tombstone within input seqno range: dropped
        invalidate_after_zeroing(&mut hints, &KeyRange::new(("a".into(), "c".into())), 55);
        assert!(hints.is_empty());
    }

    #[test]
    fn resolve_hints_consumes() -> crate::Result<()> {
        use crate::version::VersionEdit;

        let covered = table_with_seqnos(1, "b", "c", (5, 10));
        let version = Version::new(0).apply(&VersionEdit::new().add_table(3, covered))?;

        let mut hints = vec![hint(50, 60, 5)];
        let deletable = resolve_hints(&mut hints, &version, &SnapshotList::default());

        assert_eq!(1, deletable.len());
        assert_eq!(3, deletable.first().expect("should exist").0);
        assert!(hints.is_empty());

        Ok(())
    }

    #[test]
    fn resolve_hints_keeps_unresolvable() -> crate::Result<()> {
        use crate::version::VersionEdit;

        let covered = table_with_seqnos(1, "b", "c", (5, 10));
        let version = Version::new(0).apply(&VersionEdit::new().add_table(3, covered))?;

        // snapshot at 30 separates tombstone (50..60) from file seqnos (5)
        let snapshots = SnapshotList::new(vec![30]);

        let mut hints = vec![hint(50, 60, 5)];
        let deletable = resolve_hints(&mut hints, &version, &snapshots);

        assert!(deletable.is_empty());
        assert_eq!(1, hints.len());

        Ok(())
    }
}
