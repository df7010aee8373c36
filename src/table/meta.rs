// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::{KeyRange, SeqNo};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Table ID (file number)
pub type TableId = u64;

/// Metadata of a table file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableMetadata {
    /// Unique file number
    pub id: TableId,

    /// On-disk size in bytes
    pub file_size: u64,

    /// Number of point items
    pub item_count: u64,

    /// Number of point tombstones
    pub tombstone_count: u64,

    /// Number of range tombstones
    pub range_del_count: u64,

    /// Number of range keys
    pub range_key_count: u64,

    /// (Lowest, highest) sequence number
    pub seqnos: (SeqNo, SeqNo),

    /// User-key bounds of point keys
    pub point_key_range: Option<KeyRange>,

    /// User-key bounds of range tombstones and range keys
    ///
    /// The exclusive span ends are stored as inclusive maxima, which is
    /// slightly conservative but keeps a single bound representation.
    pub range_key_range: Option<KeyRange>,
}

impl TableMetadata {
    #[must_use]
    pub fn has_point_keys(&self) -> bool {
        self.point_key_range.is_some()
    }

    #[must_use]
    pub fn has_range_keys(&self) -> bool {
        self.range_key_range.is_some()
    }

    /// Combined user-key bounds over all key classes.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        match (&self.point_key_range, &self.range_key_range) {
            (Some(a), Some(b)) => KeyRange::aggregate([a, b].into_iter()),
            (Some(a), None) | (None, Some(a)) => a.clone(),
            (None, None) => KeyRange::empty(),
        }
    }
}

fn encode_opt_range<W: Write>(
    writer: &mut W,
    range: Option<&KeyRange>,
) -> Result<(), EncodeError> {
    match range {
        Some(range) => {
            writer.write_u8(1)?;
            range.encode_into(writer)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn decode_opt_range<R: Read>(reader: &mut R) -> Result<Option<KeyRange>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(KeyRange::decode_from(reader)?)),
        tag => Err(DecodeError::InvalidTag(("OptionalKeyRange", tag))),
    }
}

impl Encode for TableMetadata {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.id)?;
        writer.write_u64_varint(self.file_size)?;
        writer.write_u64_varint(self.item_count)?;
        writer.write_u64_varint(self.tombstone_count)?;
        writer.write_u64_varint(self.range_del_count)?;
        writer.write_u64_varint(self.range_key_count)?;
        writer.write_u64::<LittleEndian>(self.seqnos.0)?;
        writer.write_u64::<LittleEndian>(self.seqnos.1)?;
        encode_opt_range(writer, self.point_key_range.as_ref())?;
        encode_opt_range(writer, self.range_key_range.as_ref())?;
        Ok(())
    }
}

impl Decode for TableMetadata {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let id = reader.read_u64_varint()?;
        let file_size = reader.read_u64_varint()?;
        let item_count = reader.read_u64_varint()?;
        let tombstone_count = reader.read_u64_varint()?;
        let range_del_count = reader.read_u64_varint()?;
        let range_key_count = reader.read_u64_varint()?;
        let seqno_min = reader.read_u64::<LittleEndian>()?;
        let seqno_max = reader.read_u64::<LittleEndian>()?;
        let point_key_range = decode_opt_range(reader)?;
        let range_key_range = decode_opt_range(reader)?;

        Ok(Self {
            id,
            file_size,
            item_count,
            tombstone_count,
            range_del_count,
            range_key_count,
            seqnos: (seqno_min, seqno_max),
            point_key_range,
            range_key_range,
        })
    }
}
