// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod meta;
pub mod scanner;
pub mod writer;

pub use meta::{TableId, TableMetadata};

use crate::buffer_pool::BufferPool;
use crate::range_key::RangeKeyItem;
use crate::range_tombstone::RangeTombstone;
use crate::{InternalValue, KeyRange, SeqNo, UserKey};
use scanner::Scanner;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Compaction state of a table
///
/// A table in `Compacting` state cannot be selected by another compaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CompactionState {
    NotCompacting = 0,
    Compacting = 1,
    Compacted = 2,
}

#[doc(hidden)]
pub struct TableInner {
    pub metadata: TableMetadata,

    /// Path of the physical file (the backing's file for virtual tables)
    pub path: PathBuf,

    /// Physical table this virtual table aliases
    backing: Option<Table>,

    /// Half-open user-key clip span `[start, end)` of a virtual table
    clip: Option<(UserKey, UserKey)>,

    compaction_state: AtomicU8,

    intra_l0_compacting: AtomicBool,
}

/// A handle to an immutable table file
///
/// Cheap to clone; the handle is shared between versions. A *virtual* table
/// aliases a clipped view of a physical backing table, which is used for
/// ingest-time splits and excises.
#[derive(Clone)]
pub struct Table(Arc<TableInner>);

impl std::ops::Deref for Table {
    type Target = TableInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Table:{}({})", self.id(), self.key_range())
    }
}

/// Returns the smallest user key strictly greater than the given one.
#[must_use]
pub fn key_successor(key: &[u8]) -> UserKey {
    let mut v = Vec::with_capacity(key.len() + 1);
    v.extend_from_slice(key);
    v.push(0);
    v.into()
}

impl Table {
    /// Creates a table handle from writer output.
    #[must_use]
    pub fn from_metadata(metadata: TableMetadata, path: PathBuf) -> Self {
        Self(Arc::new(TableInner {
            metadata,
            path,
            backing: None,
            clip: None,
            compaction_state: AtomicU8::new(CompactionState::NotCompacting as u8),
            intra_l0_compacting: AtomicBool::new(false),
        }))
    }

    /// Recovers a table handle by reading the file's metadata trailer.
    pub fn recover(path: &Path) -> crate::Result<Self> {
        let metadata = scanner::read_metadata(path)?;
        Ok(Self::from_metadata(metadata, path.into()))
    }

    /// Creates a virtual table that aliases the view `[start, end)` of
    /// `backing`.
    ///
    /// # Panics
    ///
    /// Panics if `backing` is itself virtual, or if the span is empty.
    #[must_use]
    pub fn new_virtual<K: Into<UserKey>>(id: TableId, backing: &Self, start: K, end: K) -> Self {
        let start = start.into();
        let end = end.into();

        let mut metadata = backing.metadata.clone();

        // Conservative: the clip's exclusive end stands in for the
        // inclusive point maximum
        metadata.point_key_range = metadata
            .point_key_range
            .as_ref()
            .and_then(|range| clip_range(range, &start, &end));

        Self::new_virtual_inner(id, backing, start, end, metadata)
    }

    /// Like [`Table::new_virtual`], but with exact point-key bounds that
    /// the caller determined by scanning the backing.
    #[must_use]
    pub(crate) fn new_virtual_with_point_bounds(
        id: TableId,
        backing: &Self,
        start: UserKey,
        end: UserKey,
        point_key_range: Option<KeyRange>,
    ) -> Self {
        let mut metadata = backing.metadata.clone();
        metadata.point_key_range = point_key_range;

        Self::new_virtual_inner(id, backing, start, end, metadata)
    }

    fn new_virtual_inner(
        id: TableId,
        backing: &Self,
        start: UserKey,
        end: UserKey,
        mut metadata: TableMetadata,
    ) -> Self {
        assert!(
            !backing.is_virtual(),
            "virtual tables must alias a physical backing",
        );
        assert!(start < end, "virtual clip span must not be empty");

        metadata.id = id;

        metadata.range_key_range = metadata
            .range_key_range
            .as_ref()
            .and_then(|range| clip_range(range, &start, &end));

        Self(Arc::new(TableInner {
            metadata,
            path: backing.path.clone(),
            backing: Some(backing.clone()),
            clip: Some((start, end)),
            compaction_state: AtomicU8::new(CompactionState::NotCompacting as u8),
            intra_l0_compacting: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn id(&self) -> TableId {
        self.metadata.id
    }

    /// On-disk size this table accounts for.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.metadata.file_size
    }

    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.backing.is_some()
    }

    /// The physical table backing this virtual table.
    #[must_use]
    pub fn backing(&self) -> Option<&Self> {
        self.backing.as_ref()
    }

    /// File number of the physical backing (own ID for physical tables).
    #[must_use]
    pub fn backing_id(&self) -> TableId {
        self.backing.as_ref().map_or_else(|| self.id(), Self::id)
    }

    /// Half-open user-key clip span of a virtual table.
    #[must_use]
    pub fn clip_bounds(&self) -> Option<(&UserKey, &UserKey)> {
        self.clip.as_ref().map(|(start, end)| (start, end))
    }

    /// Combined user-key bounds over all key classes.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        self.metadata.key_range()
    }

    #[must_use]
    pub fn seqnos(&self) -> (SeqNo, SeqNo) {
        self.metadata.seqnos
    }

    #[must_use]
    pub fn compaction_state(&self) -> CompactionState {
        match self.compaction_state.load(Ordering::Acquire) {
            0 => CompactionState::NotCompacting,
            1 => CompactionState::Compacting,
            _ => CompactionState::Compacted,
        }
    }

    pub fn set_compaction_state(&self, state: CompactionState) {
        self.compaction_state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compaction_state() != CompactionState::NotCompacting
    }

    #[must_use]
    pub fn is_intra_l0_compacting(&self) -> bool {
        self.intra_l0_compacting.load(Ordering::Acquire)
    }

    pub fn set_intra_l0_compacting(&self, v: bool) {
        self.intra_l0_compacting.store(v, Ordering::Release);
    }

    /// Opens a streaming scanner over the table's point items.
    ///
    /// For virtual tables, the stream is clipped to the table's bounds.
    pub fn scan(&self, pool: &BufferPool) -> crate::Result<TableScanner> {
        let inner = Scanner::open(&self.path, pool)?;

        Ok(TableScanner {
            inner,
            clip: self.clip.clone(),
        })
    }

    /// Reads the table's range tombstones and range keys, clipped to the
    /// virtual bounds if any.
    pub fn range_blocks(
        &self,
        pool: &BufferPool,
    ) -> crate::Result<(Vec<RangeTombstone>, Vec<RangeKeyItem>)> {
        let (mut range_dels, mut range_keys) = scanner::read_range_blocks(&self.path, pool)?;

        if let Some((clip_start, clip_end)) = &self.clip {
            range_dels.retain_mut(|t| clip_span(&mut t.start, &mut t.end, clip_start, clip_end));
            range_keys.retain_mut(|k| clip_span(&mut k.start, &mut k.end, clip_start, clip_end));
        }

        Ok((range_dels, range_keys))
    }

    /// Verifies the whole-file checksum.
    pub fn verify(&self) -> crate::Result<()> {
        scanner::verify_checksum(&self.path)
    }
}

/// Intersects inclusive bounds with the half-open clip span.
///
/// The clip's exclusive end doubles as a (conservative) inclusive maximum,
/// matching the bound convention of range entries.
fn clip_range(range: &KeyRange, clip_start: &UserKey, clip_end: &UserKey) -> Option<KeyRange> {
    if range.max() < clip_start || range.min() >= clip_end {
        return None;
    }

    let min = range.min().max(clip_start).clone();
    let max = range.max().min(clip_end).clone();

    Some(KeyRange::new((min, max)))
}

/// Truncates a half-open span to the half-open clip span, returning `false`
/// if the span falls entirely outside.
fn clip_span(
    start: &mut UserKey,
    end: &mut UserKey,
    clip_start: &UserKey,
    clip_end: &UserKey,
) -> bool {
    if *end <= *clip_start || *start >= *clip_end {
        return false;
    }

    if *start < *clip_start {
        *start = clip_start.clone();
    }

    if *end > *clip_end {
        *end = clip_end.clone();
    }

    true
}

/// Scanner over a table's point items, clipped for virtual tables
pub struct TableScanner {
    inner: Scanner,
    clip: Option<(UserKey, UserKey)>,
}

impl Iterator for TableScanner {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = fail_iter!(self.inner.next()?);

            if let Some((start, end)) = &self.clip {
                let key = &item.key.user_key;
                if key < start || key >= end {
                    continue;
                }
            }

            return Some(Ok(item));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyKind;
    use test_log::test;

    fn write_table(dir: &Path, id: TableId) -> crate::Result<Table> {
        let path = dir.join(id.to_string());
        let mut writer = writer::Writer::new(path.clone(), id)?;

        for key in ["a", "c", "e", "g"] {
            writer.write(&InternalValue::from_components(key, "v", 1, KeyKind::Set))?;
        }
        writer.write_range_tombstone(RangeTombstone::new("a", "h", 2));

        let metadata = writer.finish()?.expect("table should not be empty");
        Ok(Table::from_metadata(metadata, path))
    }

    #[test]
    fn table_compaction_state() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = write_table(dir.path(), 0)?;

        assert!(!table.is_compacting());

        table.set_compaction_state(CompactionState::Compacting);
        assert!(table.is_compacting());
        assert_eq!(CompactionState::Compacting, table.compaction_state());

        table.set_compaction_state(CompactionState::NotCompacting);
        assert!(!table.is_compacting());

        Ok(())
    }

    #[test]
    fn table_virtual_clip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = write_table(dir.path(), 0)?;

        // half-open: "f" itself is excluded
        let virt = Table::new_virtual(1, &table, "c", "f");

        assert!(virt.is_virtual());
        assert_eq!(0, virt.backing_id());
        assert_eq!(
            Some(KeyRange::new(("c".into(), "f".into()))),
            virt.metadata.point_key_range,
        );

        let pool = BufferPool::default();

        let keys = virt
            .scan(&pool)?
            .map(|item| Ok(item?.key.user_key))
            .collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(vec![UserKey::from("c"), UserKey::from("e")], keys);

        let (range_dels, _) = virt.range_blocks(&pool)?;
        let rd = range_dels.first().expect("should exist");
        assert_eq!(*b"c", *rd.start);
        assert_eq!(*b"f", *rd.end);

        Ok(())
    }
}
