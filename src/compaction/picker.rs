// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    CompactionKind, CompactionPicker, LevelInput, ManualCompaction, PickedCompaction, PickerEnv,
};
use crate::table::Table;
use crate::{KeyRange, Version};

const LEVEL_SIZE_RATIO: u64 = 10;
const L0_TABLE_THRESHOLD: usize = 4;

/// A basic size-ratio leveled picker
///
/// Serves as the default scoring policy; richer heuristics can be plugged
/// in through [`CompactionPicker`].
pub struct LeveledPicker {
    target_file_size: u64,
}

impl LeveledPicker {
    #[must_use]
    pub fn new(target_file_size: u64) -> Self {
        Self { target_file_size }
    }

    fn level_size_target(&self, level: usize) -> u64 {
        let mut target = self.target_file_size;
        for _ in 0..level {
            target = target.saturating_mul(LEVEL_SIZE_RATIO);
        }
        target
    }

    fn build(
        &self,
        version: &Version,
        start_level: usize,
        tables: Vec<Table>,
        output_level: usize,
    ) -> Option<PickedCompaction> {
        let bounds = KeyRange::aggregate(
            tables
                .iter()
                .map(Table::key_range)
                .collect::<Vec<_>>()
                .iter(),
        );

        let mut inputs = vec![LevelInput {
            level: start_level,
            tables,
        }];

        if output_level != start_level {
            let overlapping = version
                .level(output_level)?
                .overlapping(&bounds)
                .cloned()
                .collect::<Vec<_>>();

            // Another compaction already owns part of the target range
            if overlapping.iter().any(Table::is_compacting) {
                return None;
            }

            if !overlapping.is_empty() {
                inputs.push(LevelInput {
                    level: output_level,
                    tables: overlapping,
                });
            }
        }

        let bounds = KeyRange::aggregate(
            inputs
                .iter()
                .flat_map(|input| input.tables.iter())
                .map(Table::key_range)
                .collect::<Vec<_>>()
                .iter(),
        );

        Some(PickedCompaction {
            kind: CompactionKind::Default,
            inputs,
            output_level,
            bounds,
            max_output_file_size: self.target_file_size,
            max_overlap_bytes: self.target_file_size * LEVEL_SIZE_RATIO,
        })
    }
}

impl CompactionPicker for LeveledPicker {
    fn pick_auto(&self, version: &Version, _env: &PickerEnv) -> Option<PickedCompaction> {
        // L0 -> Lbase once enough tables have stacked up
        if let Some(l0) = version.level(0) {
            let busy = l0
                .iter()
                .any(|t| t.is_compacting() || t.is_intra_l0_compacting());

            if l0.len() >= L0_TABLE_THRESHOLD && !busy {
                let tables = l0.iter().cloned().collect::<Vec<_>>();
                let base = version.base_level();

                if let Some(picked) = self.build(version, 0, tables, base) {
                    return Some(picked);
                }
            }
        }

        // Deeper levels by size ratio
        for (level_idx, level) in version.iter_levels().enumerate().skip(1) {
            if level_idx == version.last_level_index() {
                break;
            }

            if level.size() <= self.level_size_target(level_idx) {
                continue;
            }

            let Some(table) = level.iter().find(|t| !t.is_compacting()) else {
                continue;
            };

            if let Some(picked) =
                self.build(version, level_idx, vec![table.clone()], level_idx + 1)
            {
                return Some(picked);
            }
        }

        None
    }

    fn pick_manual(
        &self,
        version: &Version,
        _env: &PickerEnv,
        manual: &ManualCompaction,
    ) -> (Option<PickedCompaction>, bool) {
        let levels: Vec<usize> = match manual.level {
            Some(level) => vec![level],
            None => (0..version.level_count()).collect(),
        };

        for level_idx in levels {
            let Some(level) = version.level(level_idx) else {
                continue;
            };

            let tables = level
                .overlapping(&manual.bounds)
                .cloned()
                .collect::<Vec<_>>();

            if tables.is_empty() {
                continue;
            }

            // Busy inputs: retry later, leaving the request at the head
            if tables.iter().any(Table::is_compacting) {
                return (None, true);
            }

            let output_level = if level_idx == version.last_level_index() {
                level_idx
            } else {
                level_idx + 1
            };

            match self.build(version, level_idx, tables, output_level) {
                Some(picked) => return (Some(picked), false),
                None => return (None, true),
            }
        }

        (None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableMetadata;
    use crate::version::VersionEdit;
    use test_log::test;

    fn fake_table(id: u64, min: &str, max: &str, size: u64) -> Table {
        Table::from_metadata(
            TableMetadata {
                id,
                file_size: size,
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

    fn env() -> PickerEnv {
        PickerEnv {
            disk_available: u64::MAX,
            earliest_snapshot_seqno: u64::MAX,
            earliest_unflushed_seqno: u64::MAX,
            in_progress: 0,
            read_compactions: 0,
        }
    }

    #[test]
    fn picker_l0_threshold() -> crate::Result<()> {
        let picker = LeveledPicker::new(1_000);

        let mut edit = VersionEdit::new();
        for id in 0..4 {
            edit = edit.add_table(0, fake_table(id, "a", "z", 100));
        }
        let version = Version::new(0).apply(&edit)?;

        let picked = picker.pick_auto(&version, &env()).expect("should pick L0");
        assert_eq!(0, picked.start_level());
        assert_eq!(4, picked.input_table_count());

        Ok(())
    }

    #[test]
    fn picker_skips_compacting_inputs() -> crate::Result<()> {
        let picker = LeveledPicker::new(1_000);

        let mut edit = VersionEdit::new();
        for id in 0..4 {
            edit = edit.add_table(0, fake_table(id, "a", "z", 100));
        }
        let version = Version::new(0).apply(&edit)?;

        let busy = version
            .level(0)
            .and_then(|l| l.tables.first())
            .expect("should exist");
        busy.set_compaction_state(crate::table::CompactionState::Compacting);

        assert!(picker.pick_auto(&version, &env()).is_none());

        Ok(())
    }

    #[test]
    fn picker_skips_intra_l0_compacting_inputs() -> crate::Result<()> {
        let picker = LeveledPicker::new(1_000);

        let mut edit = VersionEdit::new();
        for id in 0..4 {
            edit = edit.add_table(0, fake_table(id, "a", "z", 100));
        }
        let version = Version::new(0).apply(&edit)?;

        let busy = version
            .level(0)
            .and_then(|l| l.tables.first())
            .expect("should exist");
        busy.set_intra_l0_compacting(true);

        assert!(picker.pick_auto(&version, &env()).is_none());

        Ok(())
    }

    #[test]
    fn picker_manual_retry_on_busy() -> crate::Result<()> {
        let picker = LeveledPicker::new(1_000);

        let table = fake_table(1, "a", "m", 100);
        table.set_compaction_state(crate::table::CompactionState::Compacting);

        let version = Version::new(0).apply(&VersionEdit::new().add_table(1, table))?;

        let manual = ManualCompaction {
            bounds: KeyRange::new(("a".into(), "z".into())),
            level: None,
            retries: 0,
        };

        let (picked, retry) = picker.pick_manual(&version, &env(), &manual);
        assert!(picked.is_none());
        assert!(retry);

        Ok(())
    }
}
