// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{range_tombstone::RangeTombstone, SeqNo, SnapshotList, UserKey};

/// A fragment `[start, end)` carrying all tombstone seqnos that cover it
///
/// Seqnos are descending. Fragments produced by [`Fragmenter::fragment`] are
/// pairwise disjoint and sorted by start key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub start: UserKey,
    pub end: UserKey,

    /// Descending seqnos of all tombstones covering this fragment
    pub seqnos: Vec<SeqNo>,
}

impl Fragment {
    /// Highest seqno covering this fragment.
    #[must_use]
    pub fn max_seqno(&self) -> SeqNo {
        self.seqnos.first().copied().unwrap_or(0)
    }

    /// Returns `true` if a point at `(key, seqno)` is deleted by this fragment.
    pub fn covers(&self, key: &[u8], seqno: SeqNo) -> bool {
        self.start.as_ref() <= key && key < self.end.as_ref() && seqno < self.max_seqno()
    }
}

/// Collects raw range tombstones and splits them into disjoint fragments
///
/// Range tombstones from different input files overlap arbitrarily in both
/// key space and seqno space. Fragmentation splits them at every unique
/// bound so that each output fragment has a single well-defined seqno list.
#[derive(Debug, Default)]
pub struct Fragmenter {
    tombstones: Vec<RangeTombstone>,
}

impl Fragmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tombstone: RangeTombstone) {
        self.tombstones.push(tombstone);
    }

    pub fn extend<I: IntoIterator<Item = RangeTombstone>>(&mut self, iter: I) {
        self.tombstones.extend(iter);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    /// Splits all registered tombstones into disjoint fragments.
    #[must_use]
    pub fn fragment(&self) -> Vec<Fragment> {
        if self.tombstones.is_empty() {
            return vec![];
        }

        let mut bounds: Vec<&UserKey> = self
            .tombstones
            .iter()
            .flat_map(|t| [&t.start, &t.end])
            .collect();

        bounds.sort();
        bounds.dedup();

        let mut fragments = vec![];

        for window in bounds.windows(2) {
            // NOTE: windows(2) always yields 2 items
            #[allow(clippy::indexing_slicing)]
            let (start, end) = (window[0], window[1]);

            let mut seqnos = self
                .tombstones
                .iter()
                .filter(|t| t.start <= *start && *end <= t.end)
                .map(|t| t.seqno)
                .collect::<Vec<_>>();

            if seqnos.is_empty() {
                continue;
            }

            seqnos.sort_unstable_by(|a, b| b.cmp(a));
            seqnos.dedup();

            fragments.push(Fragment {
                start: start.clone(),
                end: end.clone(),
                seqnos,
            });
        }

        fragments
    }
}

/// Applies the snapshot-stripe transform to a fragment's seqno list
///
/// Within each stripe only the newest tombstone survives. The tombstone is
/// elided entirely if `elide` returns true for the fragment's span (no
/// lower-level data in use there) — but only when no snapshot sits below
/// it, or a pinned older version could resurrect.
pub fn transform_fragment<E: FnMut(&[u8], &[u8]) -> bool>(
    fragment: &Fragment,
    snapshots: &SnapshotList,
    mut elide: E,
) -> Vec<SeqNo> {
    let mut out = vec![];
    let mut current_stripe = usize::MAX;

    for &seqno in &fragment.seqnos {
        let stripe = snapshots.stripe(seqno);

        if stripe == current_stripe {
            // Shadowed by a newer tombstone in the same stripe
            continue;
        }
        current_stripe = stripe;

        let unguarded = stripe == snapshots.last_stripe() && stripe == 0;

        if unguarded && elide(&fragment.start, &fragment.end) {
            continue;
        }

        out.push(seqno);
    }

    out
}
