// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::table::Table;
use crate::UserKey;

/// Decision of an output splitter for a single key
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitDecision {
    NoSplit,
    SplitNow,
}

/// Decides where to cut compaction output files
///
/// Splitters are consulted once per point key, before the key is written.
/// `SplitNow` means the current output is finished and the key goes into
/// the next one.
pub trait OutputSplitter {
    fn should_split_before(&mut self, key: &[u8], writer_size: u64) -> SplitDecision;

    /// Signals that a new output starts at `start_key`.
    fn on_new_output(&mut self, start_key: Option<&[u8]>);

    /// A user key at which the output starting at `start_key` should end
    /// at the latest, if this splitter imposes one.
    fn suggestion(&mut self, start_key: &[u8]) -> Option<UserKey>;
}

/// Splits when the output file reaches its target size
pub struct FileSizeSplitter {
    target_size: u64,
}

impl FileSizeSplitter {
    #[must_use]
    pub fn new(target_size: u64) -> Self {
        Self { target_size }
    }
}

impl OutputSplitter for FileSizeSplitter {
    fn should_split_before(&mut self, _key: &[u8], writer_size: u64) -> SplitDecision {
        if writer_size >= self.target_size {
            SplitDecision::SplitNow
        } else {
            SplitDecision::NoSplit
        }
    }

    fn on_new_output(&mut self, _start_key: Option<&[u8]>) {}

    fn suggestion(&mut self, _start_key: &[u8]) -> Option<UserKey> {
        None
    }
}

/// Bounds an output file's overlap with the grandparent level
///
/// Prevents a table at level N from overlapping too much data at level
/// N+2, because that overlap translates into a huge future compaction.
pub struct GrandparentSplitter {
    /// Grandparent tables, sorted by key
    grandparents: Vec<Table>,

    max_overlap_bytes: u64,

    /// Index of the first grandparent not entirely before the cursor
    idx: usize,

    /// Grandparent bytes overlapped since the current output started
    overlapped_bytes: u64,
}

impl GrandparentSplitter {
    #[must_use]
    pub fn new(mut grandparents: Vec<Table>, max_overlap_bytes: u64) -> Self {
        grandparents.sort_by(|a, b| a.key_range().min().cmp(b.key_range().min()));

        Self {
            grandparents,
            max_overlap_bytes,
            idx: 0,
            overlapped_bytes: 0,
        }
    }
}

impl OutputSplitter for GrandparentSplitter {
    fn should_split_before(&mut self, key: &[u8], _writer_size: u64) -> SplitDecision {
        // Account for grandparents we have moved past since the last key
        while let Some(gp) = self.grandparents.get(self.idx) {
            if gp.key_range().max().as_ref() < key {
                self.overlapped_bytes += gp.size();
                self.idx += 1;
            } else {
                break;
            }
        }

        if self.overlapped_bytes > self.max_overlap_bytes {
            SplitDecision::SplitNow
        } else {
            SplitDecision::NoSplit
        }
    }

    fn on_new_output(&mut self, _start_key: Option<&[u8]>) {
        self.overlapped_bytes = 0;
    }

    fn suggestion(&mut self, start_key: &[u8]) -> Option<UserKey> {
        let mut overlapped: u64 = 0;

        for gp in &self.grandparents {
            let range = gp.key_range();

            if range.max().as_ref() < start_key {
                continue;
            }

            overlapped += gp.size();

            if overlapped > self.max_overlap_bytes {
                return Some(range.max().clone());
            }
        }

        None
    }
}

/// Splits flush outputs at the L0 sublevel split keys
pub struct L0SplitKeySplitter {
    split_keys: Vec<UserKey>,
    idx: usize,
}

impl L0SplitKeySplitter {
    #[must_use]
    pub fn new(split_keys: Vec<UserKey>) -> Self {
        Self {
            split_keys,
            idx: 0,
        }
    }
}

impl OutputSplitter for L0SplitKeySplitter {
    fn should_split_before(&mut self, key: &[u8], _writer_size: u64) -> SplitDecision {
        let mut split = SplitDecision::NoSplit;

        while let Some(split_key) = self.split_keys.get(self.idx) {
            if split_key.as_ref() <= key {
                self.idx += 1;
                split = SplitDecision::SplitNow;
            } else {
                break;
            }
        }

        split
    }

    fn on_new_output(&mut self, _start_key: Option<&[u8]>) {}

    fn suggestion(&mut self, start_key: &[u8]) -> Option<UserKey> {
        self.split_keys
            .iter()
            .find(|split_key| split_key.as_ref() > start_key)
            .cloned()
    }
}

/// Ordered combination of splitters: the first `SplitNow` wins,
/// the smallest suggestion wins
pub struct SplitterStack {
    splitters: Vec<Box<dyn OutputSplitter>>,
}

impl SplitterStack {
    #[must_use]
    pub fn new(splitters: Vec<Box<dyn OutputSplitter>>) -> Self {
        Self { splitters }
    }
}

impl OutputSplitter for SplitterStack {
    fn should_split_before(&mut self, key: &[u8], writer_size: u64) -> SplitDecision {
        let mut decision = SplitDecision::NoSplit;

        // NOTE: All splitters must observe every key to keep their
        // cursors in sync, so no short-circuiting here
        for splitter in &mut self.splitters {
            if splitter.should_split_before(key, writer_size) == SplitDecision::SplitNow {
                decision = SplitDecision::SplitNow;
            }
        }

        decision
    }

    fn on_new_output(&mut self, start_key: Option<&[u8]>) {
        for splitter in &mut self.splitters {
            splitter.on_new_output(start_key);
        }
    }

    fn suggestion(&mut self, start_key: &[u8]) -> Option<UserKey> {
        self.splitters
            .iter_mut()
            .filter_map(|splitter| splitter.suggestion(start_key))
            .min()
    }
}

/// Adapter that delays any split until the user key changes
///
/// No two output files of a compaction may contain the same user key, so
/// a split requested in the middle of a key's versions is deferred to the
/// next user key.
pub struct PreventSplitUserKeys<S: OutputSplitter> {
    inner: S,
    last_key: Option<UserKey>,
    pending: bool,
}

impl<S: OutputSplitter> PreventSplitUserKeys<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last_key: None,
            pending: false,
        }
    }
}

impl<S: OutputSplitter> OutputSplitter for PreventSplitUserKeys<S> {
    fn should_split_before(&mut self, key: &[u8], writer_size: u64) -> SplitDecision {
        let inner_decision = self.inner.should_split_before(key, writer_size);

        let same_key = self
            .last_key
            .as_ref()
            .is_some_and(|last| last.as_ref() == key);

        if same_key {
            if inner_decision == SplitDecision::SplitNow {
                self.pending = true;
            }
            return SplitDecision::NoSplit;
        }

        if self.pending || inner_decision == SplitDecision::SplitNow {
            self.pending = false;
            // The key moves into the next output
            self.last_key = Some(key.into());
            return SplitDecision::SplitNow;
        }

        self.last_key = Some(key.into());
        SplitDecision::NoSplit
    }

    fn on_new_output(&mut self, start_key: Option<&[u8]>) {
        self.inner.on_new_output(start_key);
    }

    fn suggestion(&mut self, start_key: &[u8]) -> Option<UserKey> {
        self.inner.suggestion(start_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableMetadata;
    use crate::KeyRange;
    use test_log::test;

    fn gp_table(id: u64, min: &str, max: &str, size: u64) -> Table {
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

    #[test]
    fn file_size_splitter() {
        let mut splitter = FileSizeSplitter::new(100);

        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"a", 99),
        );
        assert_eq!(
            SplitDecision::SplitNow,
            splitter.should_split_before(b"b", 100),
        );
    }

    #[test]
    fn grandparent_splitter_accumulates() {
        let grandparents = vec![
            gp_table(1, "a", "c", 60),
            gp_table(2, "d", "f", 60),
            gp_table(3, "g", "i", 60),
        ];

        let mut splitter = GrandparentSplitter::new(grandparents, 100);
        splitter.on_new_output(Some(b"a"));

        // nothing passed yet
        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"b", 0),
        );

        // passed [a, c] (60 bytes)
        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"e", 0),
        );

        // passed [d, f] as well -> 120 > 100
        assert_eq!(
            SplitDecision::SplitNow,
            splitter.should_split_before(b"h", 0),
        );

        // new output resets the budget
        splitter.on_new_output(Some(b"h"));
        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"z", 0),
        );
    }

    #[test]
    fn grandparent_splitter_suggestion() {
        let grandparents = vec![
            gp_table(1, "a", "c", 60),
            gp_table(2, "d", "f", 60),
            gp_table(3, "g", "i", 60),
        ];

        let mut splitter = GrandparentSplitter::new(grandparents, 100);

        // from "a": 60 (a-c) + 60 (d-f) > 100 -> limit at "f"
        assert_eq!(Some(UserKey::from("f")), splitter.suggestion(b"a"));

        // from "e": 60 (d-f) + 60 (g-i) > 100 -> limit at "i"
        assert_eq!(Some(UserKey::from("i")), splitter.suggestion(b"e"));

        // from "h": only 60 bytes of grandparents left
        assert_eq!(None, splitter.suggestion(b"h"));
    }

    #[test]
    fn l0_split_key_splitter() {
        let mut splitter =
            L0SplitKeySplitter::new(vec![UserKey::from("d"), UserKey::from("m")]);

        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"a", 0),
        );
        assert_eq!(
            SplitDecision::SplitNow,
            splitter.should_split_before(b"d", 0),
        );
        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"e", 0),
        );
        assert_eq!(
            SplitDecision::SplitNow,
            splitter.should_split_before(b"z", 0),
        );

        assert_eq!(Some(UserKey::from("m")), splitter.suggestion(b"e"));
    }

    #[test]
    fn prevent_split_user_keys_defers() {
        let mut splitter = PreventSplitUserKeys::new(FileSizeSplitter::new(100));

        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"a", 0),
        );

        // size reached, but same user key -> deferred
        assert_eq!(
            SplitDecision::NoSplit,
            splitter.should_split_before(b"a", 150),
        );

        // next user key -> split fires
        assert_eq!(
            SplitDecision::SplitNow,
            splitter.should_split_before(b"b", 0),
        );
    }
}
