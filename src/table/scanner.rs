// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::meta::TableMetadata;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::checksum::Checksum;
use crate::coding::{Decode, DecodeError};
use crate::file::MAGIC_BYTES;
use crate::key::{InternalKey, KeyKind};
use crate::range_key::{RangeKeyEntry, RangeKeyItem};
use crate::range_tombstone::RangeTombstone;
use crate::{InternalValue, Slice};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use varint_rs::VarintReader;

const HEADER_SIZE: u64 = 5;

/// rangedel offset + rangekey offset + meta offset + checksum + magic
const FOOTER_SIZE: u64 = 8 + 8 + 8 + 16 + 4;

struct Footer {
    range_del_offset: u64,
    range_key_offset: u64,
    meta_offset: u64,
    checksum: Checksum,
}

fn read_footer(file: &mut File) -> crate::Result<Footer> {
    let len = file.metadata()?.len();

    if len < HEADER_SIZE + FOOTER_SIZE {
        return Err(DecodeError::InvalidHeader("table file truncated").into());
    }

    file.seek(SeekFrom::Start(len - FOOTER_SIZE))?;

    let range_del_offset = file.read_u64::<LittleEndian>()?;
    let range_key_offset = file.read_u64::<LittleEndian>()?;
    let meta_offset = file.read_u64::<LittleEndian>()?;
    let checksum = Checksum::from_raw(file.read_u128::<LittleEndian>()?);

    let mut magic = [0; 4];
    file.read_exact(&mut magic)?;

    if magic != MAGIC_BYTES {
        return Err(DecodeError::InvalidHeader("table magic mismatch").into());
    }

    Ok(Footer {
        range_del_offset,
        range_key_offset,
        meta_offset,
        checksum,
    })
}

fn read_slice<R: Read>(reader: &mut R, buf: &mut PooledBuffer) -> crate::Result<Slice> {
    let len = reader.read_u32_varint()? as usize;
    buf.resize(len, 0);
    reader.read_exact(buf)?;
    Ok(Slice::from(&buf[..]))
}

/// Reads the metadata trailer of a table file.
pub fn read_metadata(path: &Path) -> crate::Result<TableMetadata> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let footer = read_footer(&mut file)?;

    file.seek(SeekFrom::Start(footer.meta_offset))?;
    let mut reader = BufReader::new(file);
    let mut metadata = TableMetadata::decode_from(&mut reader)?;

    // The trailer is written before the final size is known
    metadata.file_size = len;

    Ok(metadata)
}

/// Verifies the whole-file checksum of a table.
pub fn verify_checksum(path: &Path) -> crate::Result<()> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let footer = read_footer(&mut file)?;

    file.seek(SeekFrom::Start(0))?;

    // Checksummed region: everything before the checksum itself
    let mut covered = vec![0; (len - 20) as usize];
    file.read_exact(&mut covered)?;

    Checksum::from_bytes(&covered).check(footer.checksum)?;

    Ok(())
}

/// Reads the range tombstone and range key blocks of a table file.
pub fn read_range_blocks(
    path: &Path,
    pool: &BufferPool,
) -> crate::Result<(Vec<RangeTombstone>, Vec<RangeKeyItem>)> {
    let mut file = File::open(path)?;
    let footer = read_footer(&mut file)?;
    let metadata = read_metadata(path)?;

    file.seek(SeekFrom::Start(footer.range_del_offset))?;
    let mut reader = BufReader::new(file);
    let mut buf = pool.checkout();

    let mut range_dels = Vec::with_capacity(metadata.range_del_count as usize);

    for _ in 0..metadata.range_del_count {
        let start = read_slice(&mut reader, &mut buf)?;
        let end = read_slice(&mut reader, &mut buf)?;
        let seqno = reader.read_u64_varint()?;
        range_dels.push(RangeTombstone { start, end, seqno });
    }

    let mut range_keys = Vec::with_capacity(metadata.range_key_count as usize);

    for _ in 0..metadata.range_key_count {
        let start = read_slice(&mut reader, &mut buf)?;
        let end = read_slice(&mut reader, &mut buf)?;
        let seqno = reader.read_u64_varint()?;

        let tag = reader.read_u8()?;
        let kind =
            KeyKind::try_from(tag).map_err(|()| DecodeError::InvalidTag(("KeyKind", tag)))?;

        let suffix = read_slice(&mut reader, &mut buf)?;
        let value = read_slice(&mut reader, &mut buf)?;

        range_keys.push(RangeKeyItem {
            start,
            end,
            entry: RangeKeyEntry {
                seqno,
                kind,
                suffix,
                value,
            },
        });
    }

    Ok((range_dels, range_keys))
}

/// Streaming reader over a table's point items, in internal-key order
pub struct Scanner {
    reader: BufReader<File>,
    remaining: u64,
    buf: PooledBuffer,
}

impl Scanner {
    pub fn open(path: &Path, pool: &BufferPool) -> crate::Result<Self> {
        let metadata = read_metadata(path)?;

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;

        Ok(Self {
            reader: BufReader::new(file),
            remaining: metadata.item_count,
            buf: pool.checkout(),
        })
    }

    fn read_item(&mut self) -> crate::Result<InternalValue> {
        let user_key = read_slice(&mut self.reader, &mut self.buf)?;
        let seqno = self.reader.read_u64_varint()?;

        let tag = self.reader.read_u8()?;
        let kind =
            KeyKind::try_from(tag).map_err(|()| DecodeError::InvalidTag(("KeyKind", tag)))?;

        let value = read_slice(&mut self.reader, &mut self.buf)?;

        Ok(InternalValue {
            key: InternalKey {
                user_key,
                seqno,
                kind,
            },
            value,
        })
    }
}

impl Iterator for Scanner {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        Some(self.read_item())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::writer::Writer;
    use test_log::test;

    #[test]
    fn table_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0");

        let items = [
            InternalValue::from_components("a", "v1", 3, KeyKind::Set),
            InternalValue::from_components("a", "v0", 1, KeyKind::Set),
            InternalValue::from_components("b", "", 2, KeyKind::Delete),
        ];

        let mut writer = Writer::new(path.clone(), 0)?;
        for item in &items {
            writer.write(item)?;
        }
        writer.write_range_tombstone(RangeTombstone::new("c", "e", 4));

        let metadata = writer.finish()?.expect("table should not be empty");
        assert_eq!(3, metadata.item_count);
        assert_eq!(1, metadata.tombstone_count);
        assert_eq!(1, metadata.range_del_count);
        assert_eq!((1, 4), metadata.seqnos);

        verify_checksum(&path)?;

        let pool = BufferPool::default();
        let read = Scanner::open(&path, &pool)?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(items.as_slice(), &*read);

        let (range_dels, range_keys) = read_range_blocks(&path, &pool)?;
        assert_eq!(vec![RangeTombstone::new("c", "e", 4)], range_dels);
        assert!(range_keys.is_empty());

        Ok(())
    }

    #[test]
    fn table_empty_write_is_removed() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0");

        let writer = Writer::new(path.clone(), 0)?;
        assert!(writer.finish()?.is_none());
        assert!(!path.try_exists()?);

        Ok(())
    }

    #[test]
    fn table_metadata_bounds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0");

        let mut writer = Writer::new(path.clone(), 7)?;
        writer.write(&InternalValue::from_components("d", "v", 1, KeyKind::Set))?;
        writer.write_range_tombstone(RangeTombstone::new("a", "c", 2));

        let metadata = writer.finish()?.expect("table should not be empty");

        assert_eq!(
            Some(crate::KeyRange::new(("d".into(), "d".into()))),
            metadata.point_key_range,
        );
        assert_eq!(
            Some(crate::KeyRange::new(("a".into(), "c".into()))),
            metadata.range_key_range,
        );

        let recovered = read_metadata(&path)?;
        assert_eq!(metadata, recovered);

        Ok(())
    }
}
