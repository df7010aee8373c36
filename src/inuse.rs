// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::KeyRange;

/// Computes the in-use key ranges over the levels `lo..=hi`
///
/// Scans every file bound in those levels that overlaps the query bounds
/// and unions them into a disjoint sorted list. Overlapping or abutting
/// ranges are merged.
#[must_use]
pub fn in_use_key_ranges(
    levels: &[Vec<KeyRange>],
    lo: usize,
    hi: usize,
    bounds: &KeyRange,
) -> Vec<KeyRange> {
    let mut ranges = levels
        .iter()
        .enumerate()
        .filter(|(idx, _)| lo <= *idx && *idx <= hi)
        .flat_map(|(_, level)| level.iter())
        .filter(|range| range.overlaps_with_key_range(bounds))
        .cloned()
        .collect::<Vec<_>>();

    ranges.sort_by(|a, b| a.min().cmp(b.min()));

    let mut merged: Vec<KeyRange> = vec![];

    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.min() <= last.max() => {
                if range.max() > last.max() {
                    *last = KeyRange::new((last.min().clone(), range.max().clone()));
                }
            }
            _ => merged.push(range),
        }
    }

    merged
}

/// A cursor over the sorted in-use range list
///
/// Point queries must be supplied in ascending key order; the cursor only
/// ever moves forward, making `elide_point` amortized O(1) over a
/// compaction.
#[derive(Debug)]
pub struct ElisionCursor {
    ranges: Vec<KeyRange>,
    idx: usize,

    /// Flushes may never elide: in-use ranges are computed from the
    /// current version only and cannot see sibling memtables.
    disabled: bool,
}

impl ElisionCursor {
    #[must_use]
    pub fn new(ranges: Vec<KeyRange>) -> Self {
        Self {
            ranges,
            idx: 0,
            disabled: false,
        }
    }

    /// Creates a cursor that never elides (used by flushes).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            ranges: vec![],
            idx: 0,
            disabled: true,
        }
    }

    /// Returns `true` if `key` lies outside every in-use key range.
    ///
    /// Keys MUST be supplied in ascending order.
    pub fn elide_point(&mut self, key: &[u8]) -> bool {
        if self.disabled {
            return false;
        }

        while let Some(range) = self.ranges.get(self.idx) {
            if range.max().as_ref() < key {
                self.idx += 1;
            } else {
                return !range.contains_key(key);
            }
        }

        true
    }

    /// Returns `true` if no in-use key range intersects `[start, end)`.
    ///
    /// Does not advance the cursor, so it can be interleaved with point
    /// queries at nearby keys.
    pub fn elide_range(&self, start: &[u8], end: &[u8]) -> bool {
        if self.disabled {
            return false;
        }

        !self
            .ranges
            .iter()
            .skip(self.idx)
            .any(|range| range.overlaps_with_span(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn kr(a: &str, b: &str) -> KeyRange {
        KeyRange::new((a.as_bytes().into(), b.as_bytes().into()))
    }

    #[test]
    fn in_use_merges_across_levels() {
        // L1: [b, c], L2: [a, b]
        let levels = vec![vec![], vec![kr("b", "c")], vec![kr("a", "b")]];

        // Query over all levels merges the abutting ranges
        assert_eq!(
            vec![kr("a", "c")],
            in_use_key_ranges(&levels, 0, 2, &kr("a", "c")),
        );
    }

    #[test]
    fn in_use_single_level() {
        let levels = vec![vec![], vec![kr("b", "c")], vec![kr("a", "b")]];

        // Query [a, b] against L1 only: the file [b, c] overlaps at b
        // and contributes its full bounds
        assert_eq!(
            vec![kr("b", "c")],
            in_use_key_ranges(&levels, 1, 1, &kr("a", "b")),
        );

        // Query [a, aa] against L1 only: no overlap
        assert!(in_use_key_ranges(&levels, 1, 1, &kr("a", "aa")).is_empty());
    }

    #[test]
    fn elide_point_cursor() {
        let mut cursor = ElisionCursor::new(vec![kr("c", "e"), kr("m", "p")]);

        assert!(cursor.elide_point(b"a"));
        assert!(!cursor.elide_point(b"c"));
        assert!(!cursor.elide_point(b"d"));
        assert!(cursor.elide_point(b"f"));
        assert!(!cursor.elide_point(b"n"));
        assert!(cursor.elide_point(b"q"));
    }

    #[test]
    fn elide_point_monotone() {
        // Cursor results are a pure function of the key,
        // regardless of which keys were queried before
        let keys: Vec<&[u8]> = vec![b"a", b"c", b"d", b"f", b"n", b"q"];

        let full = {
            let mut cursor = ElisionCursor::new(vec![kr("c", "e"), kr("m", "p")]);
            keys.iter().map(|k| cursor.elide_point(k)).collect::<Vec<_>>()
        };

        for skip in 0..keys.len() {
            let mut cursor = ElisionCursor::new(vec![kr("c", "e"), kr("m", "p")]);

            let partial = keys
                .iter()
                .skip(skip)
                .map(|k| cursor.elide_point(k))
                .collect::<Vec<_>>();

            assert_eq!(full.get(skip..).expect("in range"), &*partial);
        }
    }

    #[test]
    fn elide_range() {
        let cursor = ElisionCursor::new(vec![kr("c", "e")]);

        assert!(cursor.elide_range(b"a", b"b"));

        // [a, c) does not touch the inclusive min c
        assert!(cursor.elide_range(b"a", b"c"));

        assert!(!cursor.elide_range(b"a", b"d"));
        assert!(!cursor.elide_range(b"e", b"z"));
        assert!(cursor.elide_range(b"f", b"z"));
    }

    #[test]
    fn elide_disabled_for_flush() {
        let mut cursor = ElisionCursor::disabled();

        assert!(!cursor.elide_point(b"a"));
        assert!(!cursor.elide_range(b"a", b"z"));
    }
}
