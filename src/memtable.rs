// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::InternalKey;
use crate::range_key::RangeKeyItem;
use crate::range_tombstone::RangeTombstone;
use crate::value::{InternalValue, SeqNo, UserValue};
use crate::UserKey;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

/// Memtable ID
pub type MemtableId = u64;

/// The memtable serves as an intermediary, ephemeral, sorted storage for new items
///
/// When the memtable exceeds some size, it is sealed and flushed to an L0 table.
pub struct Memtable {
    #[doc(hidden)]
    pub id: MemtableId,

    /// WAL segment number this memtable's writes went to
    pub log_num: u64,

    /// The actual point-key content, stored in a lock-free skiplist.
    #[doc(hidden)]
    pub items: SkipMap<InternalKey, UserValue>,

    /// Range tombstones, in insertion order
    range_tombstones: RwLock<Vec<RangeTombstone>>,

    /// Range keys, in insertion order
    range_keys: RwLock<Vec<RangeKeyItem>>,

    /// Approximate active memtable size.
    ///
    /// If this grows too large, a flush is triggered.
    approximate_size: AtomicU64,

    /// Highest encountered sequence number.
    highest_seqno: AtomicU64,

    /// Lowest encountered sequence number.
    lowest_seqno: AtomicU64,

    /// Set when a flush of this memtable can no longer be delayed
    flush_forced: AtomicBool,

    /// An optional deadline after which the flush becomes forced
    delayed_flush_forced_at: Mutex<Option<Instant>>,
}

impl Memtable {
    #[must_use]
    pub fn new(id: MemtableId, log_num: u64) -> Self {
        Self {
            id,
            log_num,
            items: SkipMap::new(),
            range_tombstones: RwLock::new(vec![]),
            range_keys: RwLock::new(vec![]),
            approximate_size: AtomicU64::default(),
            highest_seqno: AtomicU64::default(),
            lowest_seqno: AtomicU64::new(u64::MAX),
            flush_forced: AtomicBool::default(),
            delayed_flush_forced_at: Mutex::new(None),
        }
    }

    /// Returns the memtable ID.
    #[must_use]
    pub fn id(&self) -> MemtableId {
        self.id
    }

    /// Inserts a point item into the memtable.
    pub fn insert(&self, item: InternalValue) {
        // NOTE: 8 = seqno, 1 = kind tag
        #[allow(clippy::cast_possible_truncation)]
        let item_size = (item.key.user_key.len() + item.value.len() + 9) as u64;

        self.approximate_size
            .fetch_add(item_size, Ordering::AcqRel);

        self.track_seqno(item.key.seqno);
        self.items.insert(item.key, item.value);
    }

    /// Inserts a range tombstone.
    pub fn insert_range_tombstone(&self, tombstone: RangeTombstone) {
        #[allow(clippy::cast_possible_truncation)]
        let item_size = (tombstone.start.len() + tombstone.end.len() + 8) as u64;

        self.approximate_size
            .fetch_add(item_size, Ordering::AcqRel);

        self.track_seqno(tombstone.seqno);

        self.range_tombstones
            .write()
            .expect("lock is poisoned")
            .push(tombstone);
    }

    /// Inserts a range key.
    pub fn insert_range_key(&self, item: RangeKeyItem) {
        #[allow(clippy::cast_possible_truncation)]
        let item_size = (item.start.len()
            + item.end.len()
            + item.entry.suffix.len()
            + item.entry.value.len()
            + 9) as u64;

        self.approximate_size
            .fetch_add(item_size, Ordering::AcqRel);

        self.track_seqno(item.entry.seqno);

        self.range_keys
            .write()
            .expect("lock is poisoned")
            .push(item);
    }

    fn track_seqno(&self, seqno: SeqNo) {
        self.highest_seqno.fetch_max(seqno, Ordering::AcqRel);
        self.lowest_seqno.fetch_min(seqno, Ordering::AcqRel);
    }

    /// Creates an iterator over all point items.
    pub fn iter(&self) -> impl Iterator<Item = InternalValue> + '_ {
        self.items.iter().map(|entry| InternalValue {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Returns a copy of all range tombstones.
    #[must_use]
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_tombstones
            .read()
            .expect("lock is poisoned")
            .clone()
    }

    /// Returns a copy of all range keys.
    #[must_use]
    pub fn range_keys(&self) -> Vec<RangeKeyItem> {
        self.range_keys.read().expect("lock is poisoned").clone()
    }

    /// Returns `true` if the memtable holds no items at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.range_tombstones.read().expect("lock is poisoned").is_empty()
            && self.range_keys.read().expect("lock is poisoned").is_empty()
    }

    /// Approximate byte size of the memtable content.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.approximate_size.load(Ordering::Acquire)
    }

    /// Returns the highest sequence number in the memtable.
    #[must_use]
    pub fn get_highest_seqno(&self) -> Option<SeqNo> {
        if self.is_empty() {
            None
        } else {
            Some(self.highest_seqno.load(Ordering::Acquire))
        }
    }

    /// Returns the lowest sequence number in the memtable.
    #[must_use]
    pub fn get_lowest_seqno(&self) -> Option<SeqNo> {
        if self.is_empty() {
            None
        } else {
            Some(self.lowest_seqno.load(Ordering::Acquire))
        }
    }

    /// Computes the user-key bounds across points, range tombstones and range keys.
    #[must_use]
    pub fn key_bounds(&self) -> Option<(UserKey, UserKey)> {
        let mut min: Option<UserKey> = None;
        let mut max: Option<UserKey> = None;

        let mut update = |lo: &UserKey, hi: &UserKey| {
            if min.as_ref().is_none_or(|m| lo < m) {
                min = Some(lo.clone());
            }
            if max.as_ref().is_none_or(|m| hi > m) {
                max = Some(hi.clone());
            }
        };

        if let Some(first) = self.items.front() {
            let last = self.items.back().expect("non-empty skiplist has a back");
            update(&first.key().user_key, &last.key().user_key);
        }

        for t in self.range_tombstones.read().expect("lock is poisoned").iter() {
            update(&t.start, &t.end);
        }

        for k in self.range_keys.read().expect("lock is poisoned").iter() {
            update(&k.start, &k.end);
        }

        Some((min?, max?))
    }

    /// Returns `true` if the flush of this memtable is forced.
    #[must_use]
    pub fn is_flush_forced(&self) -> bool {
        self.flush_forced.load(Ordering::Acquire)
    }

    /// Forces the flush of this memtable.
    pub fn force_flush(&self) {
        self.flush_forced.store(true, Ordering::Release);
    }

    /// Arms the delayed-flush deadline.
    pub fn set_delayed_flush_deadline(&self, deadline: Instant) {
        *self
            .delayed_flush_forced_at
            .lock()
            .expect("lock is poisoned") = Some(deadline);
    }

    /// Promotes an elapsed deadline into a forced flush.
    ///
    /// Returns `true` if the memtable became force-flush because of this call.
    pub fn check_delayed_flush_deadline(&self, now: Instant) -> bool {
        let mut guard = self
            .delayed_flush_forced_at
            .lock()
            .expect("lock is poisoned");

        if guard.is_some_and(|deadline| deadline <= now) {
            *guard = None;
            self.force_flush();
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyKind;
    use test_log::test;

    #[test]
    fn memtable_bounds() {
        let memtable = Memtable::new(0, 0);
        memtable.insert(InternalValue::from_components("d", "v", 1, KeyKind::Set));
        memtable.insert(InternalValue::from_components("f", "v", 2, KeyKind::Set));
        memtable.insert_range_tombstone(RangeTombstone::new("a", "c", 3));

        let (min, max) = memtable.key_bounds().expect("should have bounds");
        assert_eq!(*b"a", *min);
        assert_eq!(*b"f", *max);

        assert_eq!(Some(1), memtable.get_lowest_seqno());
        assert_eq!(Some(3), memtable.get_highest_seqno());
    }

    #[test]
    fn memtable_empty() {
        let memtable = Memtable::new(0, 0);
        assert!(memtable.is_empty());
        assert!(memtable.key_bounds().is_none());
        assert!(memtable.get_highest_seqno().is_none());
    }

    #[test]
    fn memtable_delayed_flush() {
        let memtable = Memtable::new(0, 0);
        assert!(!memtable.is_flush_forced());

        let now = Instant::now();
        memtable.set_delayed_flush_deadline(now);

        assert!(memtable.check_delayed_flush_deadline(now));
        assert!(memtable.is_flush_forced());

        // the deadline fires only once
        assert!(!memtable.check_delayed_flush_deadline(now));
    }
}
