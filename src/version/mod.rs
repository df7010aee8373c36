// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod edit;
pub mod persist;

pub use edit::VersionEdit;

use crate::table::{Table, TableId};
use crate::{HashMap, KeyRange, SeqNo, UserKey};
use std::sync::Arc;

pub type VersionId = u64;

/// Default number of levels
pub const DEFAULT_LEVEL_COUNT: usize = 7;

/// An ordered set of tables
///
/// L0 is ordered newest-run-first and may contain overlapping tables.
/// L1+ are ordered by key and must be key-disjoint.
#[derive(Clone, Default)]
pub struct Level {
    pub tables: Vec<Table>,
}

impl Level {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns the on-disk size of the level.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.tables.iter().map(Table::size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    /// Key ranges of all tables in this level.
    #[must_use]
    pub fn key_ranges(&self) -> Vec<KeyRange> {
        self.tables.iter().map(Table::key_range).collect()
    }

    /// Tables whose key range overlaps the given range.
    pub fn overlapping<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = &'a Table> {
        self.tables
            .iter()
            .filter(move |table| table.key_range().overlaps_with_key_range(range))
    }

    /// Returns `true` if the level's tables are pairwise key-disjoint.
    #[must_use]
    pub fn is_disjoint(&self) -> bool {
        let ranges = self.key_ranges();
        KeyRange::is_disjoint(&ranges.iter().collect::<Vec<_>>())
    }
}

pub struct VersionInner {
    id: VersionId,
    pub(crate) levels: Vec<Level>,

    /// Physical tables serving as backings for virtual tables
    pub(crate) virtual_backings: HashMap<TableId, Table>,
}

/// A version is an immutable point-in-time view of the tree's structure
///
/// Any time a table is created or deleted, a new version is created.
#[derive(Clone)]
pub struct Version(Arc<VersionInner>);

impl std::ops::Deref for Version {
    type Target = VersionInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Version {
    #[must_use]
    pub fn id(&self) -> VersionId {
        self.id
    }

    #[must_use]
    pub fn new(id: VersionId) -> Self {
        Self::with_level_count(id, DEFAULT_LEVEL_COUNT)
    }

    #[must_use]
    pub fn with_level_count(id: VersionId, level_count: usize) -> Self {
        Self::from_levels(
            id,
            (0..level_count).map(|_| Level::default()).collect(),
            HashMap::default(),
        )
    }

    #[must_use]
    pub fn from_levels(
        id: VersionId,
        levels: Vec<Level>,
        virtual_backings: HashMap<TableId, Table>,
    ) -> Self {
        Self(Arc::new(VersionInner {
            id,
            levels,
            virtual_backings,
        }))
    }

    /// Returns the amount of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Index of the deepest level.
    #[must_use]
    pub fn last_level_index(&self) -> usize {
        self.levels.len() - 1
    }

    #[must_use]
    pub fn level(&self, n: usize) -> Option<&Level> {
        self.levels.get(n)
    }

    pub fn iter_levels(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.levels.iter().flat_map(|level| level.tables.iter())
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Level::len).sum()
    }

    /// The lowest non-empty level >= 1, used as the flush output's
    /// grandparent level.
    #[must_use]
    pub fn base_level(&self) -> usize {
        self.levels
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, level)| !level.is_empty())
            .map_or_else(|| self.last_level_index(), |(idx, _)| idx)
    }

    /// File numbers of all physical files referenced by this version
    /// (direct members plus virtual backings).
    #[must_use]
    pub fn referenced_file_ids(&self) -> crate::HashSet<TableId> {
        self.iter_tables()
            .map(Table::backing_id)
            .chain(self.virtual_backings.keys().copied())
            .collect()
    }

    /// Highest sequence number of any table in this version.
    #[must_use]
    pub fn max_seqno(&self) -> SeqNo {
        self.iter_tables()
            .map(|table| table.seqnos().1)
            .max()
            .unwrap_or(0)
    }

    /// L0 flush split keys, derived from the sublevel boundaries.
    ///
    /// Flush outputs are cut at these keys so new L0 tables stack into
    /// sublevels instead of spanning the whole level.
    #[must_use]
    pub fn l0_split_keys(&self) -> Vec<UserKey> {
        let Some(l0) = self.levels.first() else {
            return vec![];
        };

        let mut keys = l0
            .tables
            .iter()
            .map(|table| table.key_range().min().clone())
            .collect::<Vec<_>>();

        keys.sort();
        keys.dedup();
        keys
    }

    /// In-use key ranges over the levels `lo..=hi`, merged and sorted.
    #[must_use]
    pub fn in_use_key_ranges(&self, lo: usize, hi: usize, bounds: &KeyRange) -> Vec<KeyRange> {
        let levels = self
            .levels
            .iter()
            .map(Level::key_ranges)
            .collect::<Vec<_>>();

        crate::inuse::in_use_key_ranges(&levels, lo, hi, bounds)
    }

    /// Applies a version edit, producing the next version.
    ///
    /// Checks the structural invariants:
    /// - deleted tables must exist in their level,
    /// - key-disjointness of L1+,
    /// - every virtual table's backing must exist in the backing set.
    pub fn apply(&self, version_edit: &VersionEdit) -> crate::Result<Self> {
        let id = self.id + 1;

        let mut levels = self.levels.clone();

        for (level_idx, table_id) in &version_edit.deleted {
            let level = levels
                .get_mut(*level_idx)
                .ok_or(crate::Error::InvariantViolation("level out of bounds"))?;

            let before = level.tables.len();
            level.tables.retain(|table| table.id() != *table_id);

            if level.tables.len() == before {
                return Err(crate::Error::InvariantViolation(
                    "deleted table not found in level",
                ));
            }
        }

        for (level_idx, table) in &version_edit.added {
            let level = levels
                .get_mut(*level_idx)
                .ok_or(crate::Error::InvariantViolation("level out of bounds"))?;

            if *level_idx == 0 {
                level.tables.insert(0, table.clone());
            } else {
                let pos = level
                    .tables
                    .partition_point(|t| t.key_range().min() < table.key_range().min());
                level.tables.insert(pos, table.clone());
            }
        }

        for (level_idx, _) in &version_edit.added {
            if *level_idx > 0 {
                let level = levels.get(*level_idx).expect("was accessed above");
                if !level.is_disjoint() {
                    return Err(crate::Error::InvariantViolation(
                        "tables in level must be key-disjoint",
                    ));
                }
            }
        }

        let mut virtual_backings = self.virtual_backings.clone();

        for backing in &version_edit.added_backings {
            virtual_backings.insert(backing.id(), backing.clone());
        }

        for id in &version_edit.removed_backings {
            virtual_backings.remove(id);
        }

        for level in &levels {
            for table in &level.tables {
                if table.is_virtual() && !virtual_backings.contains_key(&table.backing_id()) {
                    return Err(crate::Error::InvariantViolation(
                        "virtual table references missing backing",
                    ));
                }
            }
        }

        Ok(Self(Arc::new(VersionInner {
            id,
            levels,
            virtual_backings,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableMetadata;
    use test_log::test;

    fn fake_table(id: TableId, min: &str, max: &str) -> Table {
        Table::from_metadata(
            TableMetadata {
                id,
                file_size: 100,
                item_count: 1,
                tombstone_count: 0,
                range_del_count: 0,
                range_key_count: 0,
                seqnos: (0, 1),
                point_key_range: Some(KeyRange::new((min.into(), max.into()))),
                range_key_range: None,
            },
            std::path::PathBuf::from(format!("/tmp/{id}")),
        )
    }

    #[test]
    fn version_apply_add_delete() -> crate::Result<()> {
        let v0 = Version::new(0);

        let edit = VersionEdit::new()
            .add_table(0, fake_table(1, "a", "c"))
            .add_table(1, fake_table(2, "d", "f"));

        let v1 = v0.apply(&edit)?;
        assert_eq!(1, v1.id());
        assert_eq!(2, v1.table_count());

        let edit = VersionEdit::new().delete_table(0, 1);
        let v2 = v1.apply(&edit)?;
        assert_eq!(1, v2.table_count());

        // v1 still sees the old state
        assert_eq!(2, v1.table_count());

        Ok(())
    }

    #[test]
    fn version_apply_rejects_overlap() -> crate::Result<()> {
        let v0 = Version::new(0);

        let edit = VersionEdit::new()
            .add_table(1, fake_table(1, "a", "e"))
            .add_table(1, fake_table(2, "d", "f"));

        assert!(matches!(
            v0.apply(&edit),
            Err(crate::Error::InvariantViolation(_)),
        ));

        Ok(())
    }

    #[test]
    fn version_apply_rejects_missing_deletion() {
        let v0 = Version::new(0);
        let edit = VersionEdit::new().delete_table(0, 42);

        assert!(matches!(
            v0.apply(&edit),
            Err(crate::Error::InvariantViolation(_)),
        ));
    }

    #[test]
    fn version_apply_rejects_orphan_virtual() -> crate::Result<()> {
        let v0 = Version::new(0);

        let physical = fake_table(1, "a", "z");
        let virt = Table::new_virtual(2, &physical, "a", "c");

        let edit = VersionEdit::new().add_table(1, virt.clone());
        assert!(matches!(
            v0.apply(&edit),
            Err(crate::Error::InvariantViolation(_)),
        ));

        let edit = VersionEdit::new().add_table(1, virt).add_backing(physical);
        let v1 = v0.apply(&edit)?;
        assert_eq!(1, v1.table_count());

        Ok(())
    }

    #[test]
    fn version_base_level() -> crate::Result<()> {
        let v0 = Version::new(0);
        assert_eq!(v0.last_level_index(), v0.base_level());

        let v1 = v0.apply(&VersionEdit::new().add_table(3, fake_table(1, "a", "c")))?;
        assert_eq!(3, v1.base_level());

        Ok(())
    }

    #[test]
    fn version_l0_split_keys() -> crate::Result<()> {
        let v0 = Version::new(0);

        let v1 = v0.apply(
            &VersionEdit::new()
                .add_table(0, fake_table(1, "d", "f"))
                .add_table(0, fake_table(2, "a", "c"))
                .add_table(0, fake_table(3, "d", "g")),
        )?;

        assert_eq!(
            vec![UserKey::from("a"), UserKey::from("d")],
            v1.l0_split_keys(),
        );

        Ok(())
    }
}
