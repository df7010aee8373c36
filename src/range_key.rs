// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{KeyKind, SeqNo, SnapshotList, UserKey, UserValue};
use std::cmp::Reverse;

/// A single range-key entry inside a span
///
/// `kind` is one of `RangeKeySet`, `RangeKeyUnset`, `RangeKeyDelete`.
/// `suffix` identifies the logical range key; `value` is only meaningful
/// for `RangeKeySet`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeKeyEntry {
    pub seqno: SeqNo,
    pub kind: KeyKind,
    pub suffix: UserValue,
    pub value: UserValue,
}

impl RangeKeyEntry {
    pub fn set<S: Into<UserValue>, V: Into<UserValue>>(seqno: SeqNo, suffix: S, value: V) -> Self {
        Self {
            seqno,
            kind: KeyKind::RangeKeySet,
            suffix: suffix.into(),
            value: value.into(),
        }
    }

    pub fn unset<S: Into<UserValue>>(seqno: SeqNo, suffix: S) -> Self {
        Self {
            seqno,
            kind: KeyKind::RangeKeyUnset,
            suffix: suffix.into(),
            value: UserValue::empty(),
        }
    }

    pub fn delete(seqno: SeqNo) -> Self {
        Self {
            seqno,
            kind: KeyKind::RangeKeyDelete,
            suffix: UserValue::empty(),
            value: UserValue::empty(),
        }
    }
}

/// A single range key over `[start, end)`, as stored in memtables and tables
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeKeyItem {
    pub start: UserKey,
    pub end: UserKey,
    pub entry: RangeKeyEntry,
}

impl RangeKeyItem {
    /// Returns `true` if this item intersects the half-open span `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.start.as_ref() < end && start < self.end.as_ref()
    }
}

/// Groups raw range-key items into spans, fragmenting at every unique bound
///
/// The output spans are disjoint, sorted by start key, and each carries its
/// covering entries in internal order.
#[must_use]
pub fn fragment_range_keys(items: &[RangeKeyItem]) -> Vec<RangeKeySpan> {
    if items.is_empty() {
        return vec![];
    }

    let mut bounds: Vec<&UserKey> = items.iter().flat_map(|x| [&x.start, &x.end]).collect();
    bounds.sort();
    bounds.dedup();

    let mut spans = vec![];

    for window in bounds.windows(2) {
        // NOTE: windows(2) always yields 2 items
        #[allow(clippy::indexing_slicing)]
        let (start, end) = (window[0], window[1]);

        let keys = items
            .iter()
            .filter(|x| x.start <= *start && *end <= x.end)
            .map(|x| x.entry.clone())
            .collect::<Vec<_>>();

        if keys.is_empty() {
            continue;
        }

        spans.push(RangeKeySpan::new(start.clone(), end.clone(), keys));
    }

    spans
}

/// A span `[start, end)` with its range-key entries in internal order
/// (seqno descending, then kind tag descending)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeKeySpan {
    pub start: UserKey,
    pub end: UserKey,
    pub keys: Vec<RangeKeyEntry>,
}

impl RangeKeySpan {
    pub fn new<K: Into<UserKey>>(start: K, end: K, mut keys: Vec<RangeKeyEntry>) -> Self {
        keys.sort_by(|a, b| {
            (Reverse(a.seqno), Reverse(a.kind as u8)).cmp(&(Reverse(b.seqno), Reverse(b.kind as u8)))
        });

        Self {
            start: start.into(),
            end: end.into(),
            keys,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns `true` if this span intersects the half-open span `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.start.as_ref() < end && start < self.end.as_ref()
    }
}

/// Coalesces a span's range keys per snapshot stripe and elides obsolete
/// `Unset`/`Delete` entries in the last stripe
///
/// Within each stripe:
/// - the highest-seqno `RangeKeySet` at each suffix wins,
/// - a `RangeKeyUnset` shadows lower `RangeKeySet`s at the same suffix,
/// - a `RangeKeyDelete` shadows everything lower in the stripe.
///
/// In the last stripe, `Unset` and `Delete` entries are dropped entirely
/// when `elide` returns true for the span (no lower-level file in use
/// overlaps it). Surviving keys stay in internal order (seqno descending).
pub fn coalesce<E: FnMut(&[u8], &[u8]) -> bool>(
    span: &RangeKeySpan,
    snapshots: &SnapshotList,
    mut elide: E,
) -> RangeKeySpan {
    let mut out = vec![];

    let mut current_stripe = usize::MAX;
    let mut stripe_dead = false;
    let mut shadowed_suffixes: Vec<&UserValue> = vec![];

    // Keys are sorted seqno-descending, so each stripe is a contiguous chunk
    // visited newest-first.
    for entry in &span.keys {
        let stripe = snapshots.stripe(entry.seqno);

        if stripe != current_stripe {
            current_stripe = stripe;
            stripe_dead = false;
            shadowed_suffixes.clear();
        }

        if stripe_dead {
            continue;
        }

        // Elision requires that no snapshot sits below the entry, or a
        // pinned older range key could resurrect
        let unguarded = stripe == snapshots.last_stripe() && stripe == 0;

        match entry.kind {
            KeyKind::RangeKeyDelete => {
                stripe_dead = true;

                if !(unguarded && elide(&span.start, &span.end)) {
                    out.push(entry.clone());
                }
            }
            KeyKind::RangeKeyUnset => {
                if shadowed_suffixes.contains(&&entry.suffix) {
                    continue;
                }
                shadowed_suffixes.push(&entry.suffix);

                if !(unguarded && elide(&span.start, &span.end)) {
                    out.push(entry.clone());
                }
            }
            KeyKind::RangeKeySet => {
                if shadowed_suffixes.contains(&&entry.suffix) {
                    continue;
                }
                shadowed_suffixes.push(&entry.suffix);

                out.push(entry.clone());
            }
            _ => unreachable!("non-range-key kind in range key span"),
        }
    }

    RangeKeySpan {
        start: span.start.clone(),
        end: span.end.clone(),
        keys: out,
    }
}
