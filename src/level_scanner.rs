// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::buffer_pool::BufferPool;
use crate::table::{Table, TableScanner};
use crate::InternalValue;
use std::collections::VecDeque;

/// Scans the point items of a run of key-disjoint tables in order
///
/// Table files are opened on demand, so a compaction over a large level
/// holds at most one point-reader open per input level.
pub struct LevelScanner {
    tables: VecDeque<Table>,
    current: Option<TableScanner>,
    pool: BufferPool,
}

impl LevelScanner {
    #[must_use]
    pub fn new(tables: Vec<Table>, pool: BufferPool) -> Self {
        Self {
            tables: tables.into(),
            current: None,
            pool,
        }
    }
}

impl Iterator for LevelScanner {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(scanner) = &mut self.current {
                if let Some(item) = scanner.next() {
                    return Some(item);
                }
                self.current = None;
            }

            let table = self.tables.pop_front()?;

            log::trace!("level scanner: opening table {} on demand", table.id());
            self.current = Some(fail_iter!(table.scan(&self.pool)));
        }
    }
}
