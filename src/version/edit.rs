// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::table::{Table, TableId};

/// A transition between two versions
///
/// Applied atomically: either the whole edit becomes the next version, or
/// (on persist failure) the current version stays untouched and all output
/// files of the edit become obsolete.
#[derive(Clone, Debug, Default)]
pub struct VersionEdit {
    /// Tables removed from a level, by file number
    pub deleted: Vec<(usize, TableId)>,

    /// Tables added to a level
    pub added: Vec<(usize, Table)>,

    /// Physical tables registered as backings for virtual tables
    pub added_backings: Vec<Table>,

    /// Backings no longer referenced by any virtual table
    pub removed_backings: Vec<TableId>,
}

impl VersionEdit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delete_table(mut self, level: usize, id: TableId) -> Self {
        self.deleted.push((level, id));
        self
    }

    #[must_use]
    pub fn add_table(mut self, level: usize, table: Table) -> Self {
        self.added.push((level, table));
        self
    }

    #[must_use]
    pub fn add_backing(mut self, table: Table) -> Self {
        self.added_backings.push(table);
        self
    }

    #[must_use]
    pub fn remove_backing(mut self, id: TableId) -> Self {
        self.removed_backings.push(id);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.added.is_empty()
            && self.added_backings.is_empty()
            && self.removed_backings.is_empty()
    }

    /// File numbers of all tables added by this edit.
    pub fn added_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.added.iter().map(|(_, table)| table.id())
    }
}
