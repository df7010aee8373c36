// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::InternalValue;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<InternalValue>> + 'a>;

struct HeapItem {
    value: InternalValue,
    iter_idx: usize,
}

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.value.key == other.value.key && self.iter_idx == other.iter_idx
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.value.key, self.iter_idx).cmp(&(&other.value.key, other.iter_idx))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple iterators into a single ordered stream
///
/// This iterator can iterate through N iterators simultaneously in order
/// by advancing the iterator that yields the lowest item, using a min-heap.
///
/// Items with equal internal keys are tie-broken by iterator index, so the
/// stream is deterministic.
#[allow(clippy::module_name_repetitions)]
pub struct MergeIterator<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    initialized: bool,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(iterators.len()),
            iterators,
            initialized: false,
        }
    }

    fn advance(&mut self, iter_idx: usize) -> crate::Result<()> {
        let iter = self
            .iterators
            .get_mut(iter_idx)
            .expect("iterator index out of bounds");

        if let Some(value) = iter.next() {
            self.heap.push(Reverse(HeapItem {
                value: value?,
                iter_idx,
            }));
        }

        Ok(())
    }

    fn init(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            self.advance(idx)?;
        }
        Ok(())
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            self.initialized = true;
            fail_iter!(self.init());
        }

        let Reverse(head) = self.heap.pop()?;
        fail_iter!(self.advance(head.iter_idx));

        Some(Ok(head.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyKind, Slice};
    use test_log::test;

    fn v(key: &str, value: &str, seqno: u64) -> InternalValue {
        InternalValue::from_components(key, value, seqno, KeyKind::Set)
    }

    #[test]
    fn merge_interleaved() -> crate::Result<()> {
        let vec0 = [v("a", "old", 0), v("b", "old", 0), v("c", "old", 0)];
        let vec1 = [v("a", "new", 1), v("b", "new", 1), v("c", "new", 1)];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let items = MergeIterator::new(vec![iter0, iter1]).collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            vec![
                v("a", "new", 1),
                v("a", "old", 0),
                v("b", "new", 1),
                v("b", "old", 0),
                v("c", "new", 1),
                v("c", "old", 0),
            ],
            items,
        );

        Ok(())
    }

    #[test]
    fn merge_non_overlapping() -> crate::Result<()> {
        let iter0: BoxedIterator = Box::new((0u64..5).map(|x| Ok(v(&format!("k{x}"), "a", 0))));
        let iter1: BoxedIterator = Box::new((5u64..10).map(|x| Ok(v(&format!("k{x}"), "b", 3))));

        let merged = MergeIterator::new(vec![iter0, iter1]);

        for (idx, item) in merged.enumerate() {
            let item = item?;
            assert_eq!(Slice::from(format!("k{idx}")), item.key.user_key);
        }

        Ok(())
    }

    #[test]
    fn merge_single() -> crate::Result<()> {
        let vec0 = [v("a", "x", 0), v("b", "x", 0)];
        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));

        let items = MergeIterator::new(vec![iter0]).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(vec0.as_slice(), &*items);

        Ok(())
    }

    #[test]
    fn merge_empty() {
        let mut iter = MergeIterator::new(vec![]);
        assert!(iter.next().is_none());
    }
}
