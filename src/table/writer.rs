// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::meta::{TableId, TableMetadata};
use crate::checksum::ChecksummedWriter;
use crate::coding::Encode;
use crate::file::MAGIC_BYTES;
use crate::key::InternalKey;
use crate::range_key::RangeKeyItem;
use crate::range_tombstone::RangeTombstone;
use crate::{InternalValue, KeyRange, SeqNo, UserKey};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use varint_rs::VarintWriter;

pub const FORMAT_VERSION: u8 = 1;

/// Streaming writer for a single table file
///
/// Point items must be appended in ascending internal-key order. Range
/// tombstones and range keys may be registered at any time; they are
/// buffered and serialized on [`Writer::finish`].
pub struct Writer {
    path: PathBuf,
    id: TableId,

    inner: ChecksummedWriter<BufWriter<File>>,

    item_count: u64,
    tombstone_count: u64,

    first_key: Option<UserKey>,
    last_key: Option<InternalKey>,

    seqno_min: SeqNo,
    seqno_max: SeqNo,

    range_dels: Vec<RangeTombstone>,
    range_keys: Vec<RangeKeyItem>,
}

fn write_slice<W: Write>(writer: &mut W, bytes: &[u8]) -> crate::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

impl Writer {
    pub fn new(path: PathBuf, id: TableId) -> crate::Result<Self> {
        let file = File::create(&path)?;
        let mut inner = ChecksummedWriter::new(BufWriter::new(file));

        inner.write_all(&MAGIC_BYTES)?;
        inner.write_u8(FORMAT_VERSION)?;

        Ok(Self {
            path,
            id,
            inner,
            item_count: 0,
            tombstone_count: 0,
            first_key: None,
            last_key: None,
            seqno_min: SeqNo::MAX,
            seqno_max: 0,
            range_dels: vec![],
            range_keys: vec![],
        })
    }

    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Bytes written so far (points only, range entries are buffered).
    #[must_use]
    pub fn written_size(&self) -> u64 {
        self.inner.bytes_written()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count == 0 && self.range_dels.is_empty() && self.range_keys.is_empty()
    }

    /// Returns `true` if the writer only has pending range entries.
    #[must_use]
    pub fn has_pending_ranges_only(&self) -> bool {
        self.item_count == 0 && !self.is_empty()
    }

    /// Returns the user key of the last written point item.
    #[must_use]
    pub fn last_user_key(&self) -> Option<&UserKey> {
        self.last_key.as_ref().map(|k| &k.user_key)
    }

    fn track_seqno(&mut self, seqno: SeqNo) {
        self.seqno_min = self.seqno_min.min(seqno);
        self.seqno_max = self.seqno_max.max(seqno);
    }

    /// Appends a point item.
    ///
    /// # Panics
    ///
    /// Panics if the item is not in ascending internal-key order.
    pub fn write(&mut self, item: &InternalValue) -> crate::Result<()> {
        if let Some(last) = &self.last_key {
            assert!(
                *last < item.key,
                "point items must arrive in ascending internal-key order",
            );
        }

        write_slice(&mut self.inner, &item.key.user_key)?;
        self.inner.write_u64_varint(item.key.seqno)?;
        self.inner.write_u8(item.key.kind as u8)?;
        write_slice(&mut self.inner, &item.value)?;

        if self.first_key.is_none() {
            self.first_key = Some(item.key.user_key.clone());
        }
        self.last_key = Some(item.key.clone());

        self.track_seqno(item.key.seqno);
        self.item_count += 1;

        if item.is_tombstone() {
            self.tombstone_count += 1;
        }

        Ok(())
    }

    /// Registers a range tombstone for this table.
    pub fn write_range_tombstone(&mut self, tombstone: RangeTombstone) {
        self.track_seqno(tombstone.seqno);
        self.range_dels.push(tombstone);
    }

    /// Registers a range key for this table.
    pub fn write_range_key(&mut self, item: RangeKeyItem) {
        self.track_seqno(item.entry.seqno);
        self.range_keys.push(item);
    }

    fn range_bounds(&self) -> Option<KeyRange> {
        let spans = self
            .range_dels
            .iter()
            .map(|t| (&t.start, &t.end))
            .chain(self.range_keys.iter().map(|k| (&k.start, &k.end)));

        let mut min: Option<&UserKey> = None;
        let mut max: Option<&UserKey> = None;

        for (start, end) in spans {
            if min.is_none_or(|m| start < m) {
                min = Some(start);
            }
            if max.is_none_or(|m| end > m) {
                max = Some(end);
            }
        }

        Some(KeyRange::new((min?.clone(), max?.clone())))
    }

    /// Finalizes the table file.
    ///
    /// Returns `None` (and removes the file) if nothing was written.
    pub fn finish(mut self) -> crate::Result<Option<TableMetadata>> {
        if self.is_empty() {
            drop(self.inner);
            std::fs::remove_file(&self.path)?;
            return Ok(None);
        }

        let range_del_offset = self.inner.bytes_written();

        for tombstone in &self.range_dels {
            write_slice(&mut self.inner, &tombstone.start)?;
            write_slice(&mut self.inner, &tombstone.end)?;
            self.inner.write_u64_varint(tombstone.seqno)?;
        }

        let range_key_offset = self.inner.bytes_written();

        for item in &self.range_keys {
            write_slice(&mut self.inner, &item.start)?;
            write_slice(&mut self.inner, &item.end)?;
            self.inner.write_u64_varint(item.entry.seqno)?;
            self.inner.write_u8(item.entry.kind as u8)?;
            write_slice(&mut self.inner, &item.entry.suffix)?;
            write_slice(&mut self.inner, &item.entry.value)?;
        }

        let meta_offset = self.inner.bytes_written();

        let point_key_range = match (self.first_key.take(), self.last_key.take()) {
            (Some(first), Some(last)) => Some(KeyRange::new((first, last.user_key))),
            _ => None,
        };

        let mut metadata = TableMetadata {
            id: self.id,
            file_size: 0,
            item_count: self.item_count,
            tombstone_count: self.tombstone_count,
            range_del_count: self.range_dels.len() as u64,
            range_key_count: self.range_keys.len() as u64,
            seqnos: (self.seqno_min, self.seqno_max),
            point_key_range,
            range_key_range: self.range_bounds(),
        };

        metadata.encode_into(&mut self.inner)?;

        self.inner.write_u64::<LittleEndian>(range_del_offset)?;
        self.inner.write_u64::<LittleEndian>(range_key_offset)?;
        self.inner.write_u64::<LittleEndian>(meta_offset)?;

        let checksum = self.inner.checksum();

        let mut file = self
            .inner
            .into_inner()
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;

        file.write_u128::<LittleEndian>(checksum.into_u128())?;
        file.write_all(&MAGIC_BYTES)?;
        file.sync_all()?;

        metadata.file_size = file.metadata()?.len();

        log::trace!(
            "Finished table {} at {:?}, {} items, {} range dels, {} range keys",
            self.id,
            self.path,
            metadata.item_count,
            metadata.range_del_count,
            metadata.range_key_count,
        );

        Ok(Some(metadata))
    }
}
