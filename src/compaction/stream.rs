// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::inuse::ElisionCursor;
use crate::key::KeyKind;
use crate::merge_operator::MergeOperator;
use crate::metrics::Metrics;
use crate::rangedel::Fragment;
use crate::value::{InternalValue, UserValue};
use crate::{SnapshotList, UserKey};
use std::iter::Peekable;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Consumes a merged stream of point KVs and emits a new stream according
/// to snapshot-stripe, tombstone-elision and seqno-zeroing rules
///
/// This iterator is used during flushing & compaction. Per user key and
/// snapshot stripe, only the newest version survives; tombstones in the
/// last stripe are dropped when nothing below the output level is in use;
/// sequence numbers of bottom-most values are zeroed when allowed.
#[allow(clippy::module_name_repetitions)]
pub struct CompactionStream<I: Iterator<Item = crate::Result<InternalValue>>> {
    inner: Peekable<I>,

    snapshots: SnapshotList,
    allow_zero_seqno: bool,
    elision: ElisionCursor,

    /// Fragmented range tombstones over the whole compaction, sorted by start
    range_dels: Vec<Fragment>,
    range_del_idx: usize,

    merge_operator: Option<Arc<dyn MergeOperator>>,
    metrics: Option<Arc<Metrics>>,

    /// Already-transformed items of the current user key, newest first
    pending: std::collections::VecDeque<InternalValue>,
}

impl<I: Iterator<Item = crate::Result<InternalValue>>> CompactionStream<I> {
    #[must_use]
    pub fn new(
        iter: I,
        snapshots: SnapshotList,
        allow_zero_seqno: bool,
        elision: ElisionCursor,
    ) -> Self {
        Self {
            inner: iter.peekable(),
            snapshots,
            allow_zero_seqno,
            elision,
            range_dels: vec![],
            range_del_idx: 0,
            merge_operator: None,
            metrics: None,
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Registers the compaction's fragmented range tombstones so covered
    /// point versions can be dropped.
    #[must_use]
    pub fn with_range_dels(mut self, fragments: Vec<Fragment>) -> Self {
        self.range_dels = fragments;
        self
    }

    #[must_use]
    pub fn with_merge_operator(mut self, op: Option<Arc<dyn MergeOperator>>) -> Self {
        self.merge_operator = op;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Advances the fragment cursor to the first fragment not entirely
    /// before `key`. Keys arrive in ascending order, so a forward cursor
    /// suffices.
    fn advance_fragment_cursor(&mut self, key: &[u8]) {
        while let Some(fragment) = self.range_dels.get(self.range_del_idx) {
            if fragment.end.as_ref() <= key {
                self.range_del_idx += 1;
            } else {
                break;
            }
        }
    }

    fn fragment_at(&mut self, key: &[u8]) -> Option<&Fragment> {
        self.advance_fragment_cursor(key);

        self.range_dels
            .get(self.range_del_idx)
            .filter(|fragment| fragment.start.as_ref() <= key)
    }

    /// Returns `true` if a range tombstone in the same snapshot stripe
    /// shadows `(key, seqno)`.
    ///
    /// Tombstones in higher stripes must NOT shadow: a snapshot between
    /// them still needs the version.
    fn covered_by_range_del(&mut self, key: &[u8], seqno: crate::SeqNo) -> bool {
        self.advance_fragment_cursor(key);

        let stripe = self.snapshots.stripe(seqno);

        let Some(fragment) = self.range_dels.get(self.range_del_idx) else {
            return false;
        };

        if fragment.start.as_ref() > key {
            return false;
        }

        fragment
            .seqnos
            .iter()
            .any(|&rs| rs > seqno && self.snapshots.stripe(rs) == stripe)
    }

    fn has_any_range_del(&mut self, key: &[u8]) -> bool {
        self.fragment_at(key).is_some()
    }

    fn collect_key_versions(&mut self) -> crate::Result<Option<Vec<InternalValue>>> {
        let Some(head) = self.inner.next() else {
            return Ok(None);
        };
        let head = head?;

        let user_key = versions_key(&head);
        let mut versions = vec![head];

        loop {
            let Some(peeked) = self.inner.peek() else {
                break;
            };

            let same_key = match peeked {
                Ok(item) => item.key.user_key == user_key,
                Err(_) => true, // pull the error out below
            };

            if !same_key {
                break;
            }

            let item = self.inner.next().expect("was just peeked")?;
            versions.push(item);
        }

        Ok(Some(versions))
    }

    #[allow(clippy::too_many_lines)]
    fn transform_key(&mut self, versions: Vec<InternalValue>) -> Vec<InternalValue> {
        let user_key = &versions_key(versions.first().expect("versions is non-empty"));

        // Versions shadowed by a same-stripe range tombstone never survive
        let versions = versions
            .into_iter()
            .filter(|v| !self.covered_by_range_del(user_key, v.key.seqno))
            .collect::<Vec<_>>();

        let last_stripe = self.snapshots.last_stripe();
        let mut out = vec![];

        let mut idx = 0;
        while let Some(head) = versions.get(idx) {
            let stripe = self.snapshots.stripe(head.key.seqno);

            // Contiguous chunk of versions in the same stripe
            let stripe_end = idx
                + versions
                    .get(idx..)
                    .expect("idx is in bounds")
                    .iter()
                    .take_while(|v| self.snapshots.stripe(v.key.seqno) == stripe)
                    .count();

            // Elision and zeroing require that no snapshot sits below the
            // entry, or a pinned older version could resurrect (or the
            // key's emitted versions would leave internal order)
            let unguarded = stripe == last_stripe && stripe == 0;

            match head.key.kind {
                KeyKind::Delete | KeyKind::DeleteSized => {
                    if unguarded && self.elision.elide_point(user_key) {
                        if let Some(metrics) = &self.metrics {
                            metrics.tombstones_elided.fetch_add(1, Relaxed);
                        }
                    } else {
                        out.push(head.clone());
                    }

                    // shadows the rest of its stripe
                    idx = stripe_end;
                }
                KeyKind::SingleDelete => {
                    let beneath = versions.get(idx + 1).filter(|v| {
                        idx + 1 < stripe_end && v.key.kind == KeyKind::Set
                    });

                    if beneath.is_some() {
                        // Tombstone and the single value beneath annihilate.
                        // Anything older in the stripe becomes visible again,
                        // which is the documented contract of SingleDelete.
                        idx += 2;
                    } else if unguarded && self.elision.elide_point(user_key) {
                        if let Some(metrics) = &self.metrics {
                            metrics.tombstones_elided.fetch_add(1, Relaxed);
                        }
                        idx += 1;
                    } else {
                        out.push(head.clone());
                        idx = stripe_end;
                    }
                }
                KeyKind::Merge => {
                    // Consecutive merge operands within the stripe
                    let chain_end = idx
                        + versions
                            .get(idx..stripe_end)
                            .expect("idx is in bounds")
                            .iter()
                            .take_while(|v| v.key.kind == KeyKind::Merge)
                            .count();

                    let Some(op) = self.merge_operator.clone() else {
                        // Without an operator, operands pass through untouched
                        for v in versions.get(idx..chain_end).expect("in bounds") {
                            out.push(v.clone());
                        }
                        idx = chain_end;
                        continue;
                    };

                    let operands = versions.get(idx..chain_end).expect("in bounds");
                    let terminal = versions.get(chain_end).filter(|_| chain_end < stripe_end);

                    let fold = |existing: Option<UserValue>| {
                        let mut acc = existing;
                        for operand in operands.iter().rev() {
                            acc = Some(op.merge(user_key, acc.as_ref(), &operand.value));
                        }
                        acc.expect("merge chain is non-empty")
                    };

                    match terminal.map(|v| v.key.kind) {
                        Some(KeyKind::Set) => {
                            let set = terminal.expect("checked above");
                            out.push(InternalValue::from_components(
                                user_key.clone(),
                                fold(Some(set.value.clone())),
                                head.key.seqno,
                                KeyKind::Set,
                            ));
                            idx = stripe_end;
                        }
                        Some(_) => {
                            // Chain hits a tombstone in the same stripe:
                            // the result is a full value
                            out.push(InternalValue::from_components(
                                user_key.clone(),
                                fold(None),
                                head.key.seqno,
                                KeyKind::Set,
                            ));
                            idx = stripe_end;
                        }
                        None => {
                            // Chain reaches the stripe end; older stripes or
                            // lower levels may still hold a value, unless
                            // elision proves there is none
                            let kind = if unguarded
                                && stripe_end == versions.len()
                                && self.elision.elide_point(user_key)
                            {
                                KeyKind::Set
                            } else {
                                KeyKind::Merge
                            };

                            out.push(InternalValue::from_components(
                                user_key.clone(),
                                fold(None),
                                head.key.seqno,
                                kind,
                            ));
                            idx = chain_end;
                        }
                    }
                }
                KeyKind::Set => {
                    let mut item = head.clone();

                    if self.allow_zero_seqno
                        && unguarded
                        && item.key.seqno != 0
                        && !self.has_any_range_del(user_key)
                    {
                        item.key.seqno = 0;

                        if let Some(metrics) = &self.metrics {
                            metrics.seqnos_zeroed.fetch_add(1, Relaxed);
                        }
                    }

                    out.push(item);
                    idx = stripe_end;
                }
                _ => unreachable!("range kind in point stream"),
            }
        }

        if out.len() > 1 {
            if let Some(metrics) = &self.metrics {
                metrics
                    .keys_pinned_by_snapshots
                    .fetch_add(out.len() as u64 - 1, Relaxed);
            }
        }

        out
    }
}

fn versions_key(item: &InternalValue) -> UserKey {
    item.key.user_key.clone()
}

impl<I: Iterator<Item = crate::Result<InternalValue>>> Iterator for CompactionStream<I> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }

            let versions = fail_iter!(self.collect_key_versions())?;
            let transformed = self.transform_key(versions);
            self.pending.extend(transformed);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::merge_operator::tests::ConcatMerge;
    use crate::rangedel::Fragmenter;
    use crate::range_tombstone::RangeTombstone;
    use crate::KeyRange;
    use test_log::test;

    fn v(key: &str, value: &str, seqno: u64, kind: KeyKind) -> InternalValue {
        InternalValue::from_components(key, value, seqno, kind)
    }

    fn run(
        input: Vec<InternalValue>,
        snapshots: SnapshotList,
        allow_zero: bool,
        elision: ElisionCursor,
    ) -> Vec<InternalValue> {
        CompactionStream::new(input.into_iter().map(Ok), snapshots, allow_zero, elision)
            .collect::<crate::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn stream_keeps_newest_per_stripe() {
        let input = vec![
            v("a", "v3", 9, KeyKind::Set),
            v("a", "v2", 8, KeyKind::Set),
            v("a", "v1", 4, KeyKind::Set),
            v("a", "v0", 3, KeyKind::Set),
        ];

        // stripes: [0,5], (5,10], (10,inf)
        let out = run(
            input,
            SnapshotList::new(vec![5, 10]),
            false,
            ElisionCursor::new(vec![]),
        );

        assert_eq!(
            vec![v("a", "v3", 9, KeyKind::Set), v("a", "v1", 4, KeyKind::Set)],
            out,
        );
    }

    #[test]
    fn stream_elides_tombstone_in_last_stripe() {
        let input = vec![
            v("a", "", 9, KeyKind::Delete),
            v("a", "v0", 3, KeyKind::Set),
        ];

        // no snapshots: single (last) stripe; nothing below in use
        let out = run(
            input.clone(),
            SnapshotList::default(),
            false,
            ElisionCursor::new(vec![]),
        );
        assert!(out.is_empty());

        // with lower-level data in use, the tombstone survives
        let out = run(
            input,
            SnapshotList::default(),
            false,
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        );
        assert_eq!(vec![v("a", "", 9, KeyKind::Delete)], out);
    }

    #[test]
    fn stream_tombstone_not_elided_in_older_stripe() {
        let input = vec![
            v("a", "", 4, KeyKind::Delete),
            v("a", "v0", 3, KeyKind::Set),
        ];

        // tombstone sits below the snapshot at 5, so a snapshot reader
        // at seqno 5 still needs it
        let out = run(
            input,
            SnapshotList::new(vec![5]),
            false,
            ElisionCursor::new(vec![]),
        );

        assert_eq!(vec![v("a", "", 4, KeyKind::Delete)], out);
    }

    #[test]
    fn stream_single_delete_annihilates() {
        let input = vec![
            v("a", "", 5, KeyKind::SingleDelete),
            v("a", "old", 4, KeyKind::Set),
            v("b", "x", 5, KeyKind::Set),
        ];

        let out = run(
            input,
            SnapshotList::default(),
            false,
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        );

        assert_eq!(vec![v("b", "x", 5, KeyKind::Set)], out);
    }

    #[test]
    fn stream_single_delete_not_paired_across_stripes() {
        let input = vec![
            v("a", "", 8, KeyKind::SingleDelete),
            v("a", "old", 4, KeyKind::Set),
        ];

        // snapshot at 5 separates the two
        let out = run(
            input,
            SnapshotList::new(vec![5]),
            false,
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        );

        assert_eq!(
            vec![
                v("a", "", 8, KeyKind::SingleDelete),
                v("a", "old", 4, KeyKind::Set),
            ],
            out,
        );
    }

    #[test]
    fn stream_zeroes_seqno() {
        let input = vec![v("a", "x", 9, KeyKind::Set), v("b", "y", 8, KeyKind::Set)];

        let out = run(
            input,
            SnapshotList::default(),
            true,
            ElisionCursor::new(vec![]),
        );

        assert_eq!(
            vec![v("a", "x", 0, KeyKind::Set), v("b", "y", 0, KeyKind::Set)],
            out,
        );
    }

    #[test]
    fn stream_no_zeroing_under_range_del() {
        let fragments = {
            let mut f = Fragmenter::new();
            f.add(RangeTombstone::new("a", "b", 2));
            f.fragment()
        };

        let input = vec![v("a", "x", 9, KeyKind::Set)];

        let out = CompactionStream::new(
            input.into_iter().map(Ok),
            SnapshotList::default(),
            true,
            ElisionCursor::new(vec![]),
        )
        .with_range_dels(fragments)
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();

        // seqno 9 > tombstone seqno 2, so the value survives, un-zeroed
        assert_eq!(vec![v("a", "x", 9, KeyKind::Set)], out);
    }

    #[test]
    fn stream_range_del_covers_same_stripe_only() {
        let fragments = {
            let mut f = Fragmenter::new();
            f.add(RangeTombstone::new("a", "c", 9));
            f.fragment()
        };

        let input = vec![
            v("a", "new", 8, KeyKind::Set),
            v("a", "old", 4, KeyKind::Set),
            v("x", "keep", 1, KeyKind::Set),
        ];

        // snapshot at 5: rangedel #9 and value #8 share a stripe,
        // value #4 is protected by the snapshot
        let out = CompactionStream::new(
            input.into_iter().map(Ok),
            SnapshotList::new(vec![5]),
            false,
            ElisionCursor::new(vec![]),
        )
        .with_range_dels(fragments)
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();

        assert_eq!(
            vec![v("a", "old", 4, KeyKind::Set), v("x", "keep", 1, KeyKind::Set)],
            out,
        );
    }

    #[test]
    fn stream_merge_collapses_into_set() {
        let input = vec![
            v("a", "c", 9, KeyKind::Merge),
            v("a", "b", 8, KeyKind::Merge),
            v("a", "a", 7, KeyKind::Set),
        ];

        let out = CompactionStream::new(
            input.into_iter().map(Ok),
            SnapshotList::default(),
            false,
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        )
        .with_merge_operator(Some(Arc::new(ConcatMerge)))
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();

        assert_eq!(vec![v("a", "abc", 9, KeyKind::Set)], out);

        // NOTE: InternalValue equality only looks at the key
        assert_eq!(*b"abc", *out.first().unwrap().value);
    }

    #[test]
    fn stream_merge_stays_merge_when_bottom_unknown() {
        let input = vec![
            v("a", "c", 9, KeyKind::Merge),
            v("a", "b", 8, KeyKind::Merge),
        ];

        let out = CompactionStream::new(
            input.into_iter().map(Ok),
            SnapshotList::default(),
            false,
            // lower levels in use: cannot prove there is no older value
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        )
        .with_merge_operator(Some(Arc::new(ConcatMerge)))
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();

        assert_eq!(vec![v("a", "bc", 9, KeyKind::Merge)], out);

        // NOTE: InternalValue equality only looks at the key
        assert_eq!(*b"bc", *out.first().unwrap().value);
    }

    #[test]
    fn stream_merge_without_operator_passes_through() {
        let input = vec![
            v("a", "c", 9, KeyKind::Merge),
            v("a", "b", 8, KeyKind::Merge),
        ];

        let out = run(
            input.clone(),
            SnapshotList::default(),
            false,
            ElisionCursor::new(vec![KeyRange::new(("a".into(), "z".into()))]),
        );

        assert_eq!(input, out);
    }
}
