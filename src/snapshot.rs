// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::SeqNo;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// An immutable, ascending list of open snapshot sequence numbers
///
/// The list partitions seqno space into *stripes*: `[0, s0]`, `(s0, s1]`, ...,
/// `(s_last, +inf)`. Two keys share a stripe iff no snapshot seqno separates
/// them. Compactions sample the list once and keep it frozen for their
/// lifetime.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotList(Vec<SeqNo>);

impl SnapshotList {
    /// Creates a snapshot list from ascending seqnos.
    ///
    /// # Panics
    ///
    /// Panics if the input is not strictly ascending.
    #[must_use]
    pub fn new(seqnos: Vec<SeqNo>) -> Self {
        assert!(
            seqnos.windows(2).all(|w| w[0] < w[1]),
            "snapshot list must be strictly ascending",
        );
        Self(seqnos)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the earliest open snapshot seqno, if any.
    #[must_use]
    pub fn earliest(&self) -> Option<SeqNo> {
        self.0.first().copied()
    }

    /// Returns the stripe index a seqno belongs to.
    ///
    /// A key with seqno `s` belongs to the lowest stripe whose upper bound
    /// is >= `s`, so the index equals the number of snapshots strictly
    /// below `s`.
    #[must_use]
    pub fn stripe(&self, seqno: SeqNo) -> usize {
        self.0.partition_point(|&s| s < seqno)
    }

    /// Index of the unbounded last stripe (the one including `+inf`).
    #[must_use]
    pub fn last_stripe(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the seqno lands in the last (unbounded) stripe.
    #[must_use]
    pub fn is_in_last_stripe(&self, seqno: SeqNo) -> bool {
        self.stripe(seqno) == self.last_stripe()
    }
}

/// Tracks open snapshots so compactions know which old versions are pinned
///
/// Reference-counted per seqno; the same seqno can be opened multiple times.
#[derive(Clone, Default)]
pub struct SnapshotTracker(Arc<Mutex<BTreeMap<SeqNo, usize>>>);

impl SnapshotTracker {
    /// Registers an open snapshot at the given seqno.
    pub fn open(&self, seqno: SeqNo) {
        let mut map = self.0.lock().expect("lock is poisoned");
        *map.entry(seqno).or_insert(0) += 1;
    }

    /// Unregisters a snapshot.
    pub fn close(&self, seqno: SeqNo) {
        let mut map = self.0.lock().expect("lock is poisoned");

        if let Some(count) = map.get_mut(&seqno) {
            *count -= 1;

            if *count == 0 {
                map.remove(&seqno);
            }
        }
    }

    /// Samples the currently open snapshots into a frozen list.
    #[must_use]
    pub fn sample(&self) -> SnapshotList {
        let map = self.0.lock().expect("lock is poisoned");
        SnapshotList(map.keys().copied().collect())
    }

    #[must_use]
    pub fn has_open_snapshots(&self) -> bool {
        !self.0.lock().expect("lock is poisoned").is_empty()
    }

    /// Returns the earliest open snapshot seqno, or `SeqNo::MAX` if none.
    #[must_use]
    pub fn earliest(&self) -> SeqNo {
        self.0
            .lock()
            .expect("lock is poisoned")
            .keys()
            .next()
            .copied()
            .unwrap_or(SeqNo::MAX)
    }
}
