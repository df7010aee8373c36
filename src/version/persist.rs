// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Level, Version, VersionId};
use crate::checksum::{Checksum, ChecksummedWriter};
use crate::coding::{Decode, DecodeError, Encode};
use crate::file::{fsync_directory, rewrite_atomic, CURRENT_VERSION_FILE, MAGIC_BYTES};
use crate::table::{Table, TableId, TableMetadata};
use crate::{HashMap, KeyRange};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use varint_rs::{VarintReader, VarintWriter};

/// Writes a version file (`v{id}`) into the folder and returns its checksum.
///
/// Does NOT update the `current` pointer; see [`write_current`].
pub fn persist_version(folder: &Path, version: &Version) -> crate::Result<Checksum> {
    log::trace!(
        "Persisting version {} in {}",
        version.id(),
        folder.display(),
    );

    let path = folder.join(format!("v{}", version.id()));
    let file = std::fs::File::create_new(path)?;
    let mut writer = ChecksummedWriter::new(BufWriter::new(file));

    writer.write_all(&MAGIC_BYTES)?;
    writer.write_u64::<LittleEndian>(version.id())?;

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u8(version.level_count() as u8)?;

    writer.write_u64_varint(version.virtual_backings.len() as u64)?;
    for backing in version.virtual_backings.values() {
        backing.metadata.encode_into(&mut writer)?;
    }

    for level in version.iter_levels() {
        writer.write_u64_varint(level.len() as u64)?;

        for table in level.iter() {
            if let Some((clip_start, clip_end)) = table.clip_bounds() {
                writer.write_u8(1)?;
                writer.write_u64_varint(table.id())?;
                writer.write_u64_varint(table.backing_id())?;
                KeyRange::new((clip_start.clone(), clip_end.clone())).encode_into(&mut writer)?;
            } else {
                writer.write_u8(0)?;
                table.metadata.encode_into(&mut writer)?;
            }
        }
    }

    let checksum = writer.checksum();

    let file = writer
        .into_inner()
        .into_inner()
        .map_err(std::io::IntoInnerError::into_error)?;
    file.sync_all()?;

    // IMPORTANT: fsync folder on Unix
    fsync_directory(folder)?;

    Ok(checksum)
}

/// Atomically points `current` at a persisted version.
pub fn write_current(folder: &Path, id: VersionId, checksum: Checksum) -> crate::Result<()> {
    let mut content = vec![];
    content.write_u64::<LittleEndian>(id)?;
    content.write_u128::<LittleEndian>(checksum.into_u128())?;
    content.write_u8(0)?; // 0 = xxh3

    rewrite_atomic(&folder.join(CURRENT_VERSION_FILE), &content)?;

    Ok(())
}

/// Reads the `current` pointer.
pub fn read_current(folder: &Path) -> crate::Result<(VersionId, Checksum)> {
    let bytes = std::fs::read(folder.join(CURRENT_VERSION_FILE))?;
    let mut reader = &bytes[..];

    let id = reader.read_u64::<LittleEndian>()?;
    let checksum = Checksum::from_raw(reader.read_u128::<LittleEndian>()?);

    Ok((id, checksum))
}

/// Recovers the version pointed at by `current`.
///
/// Table paths are resolved against `tables_folder`.
pub fn recover_current(folder: &Path, tables_folder: &Path) -> crate::Result<Version> {
    let (id, checksum) = read_current(folder)?;

    let bytes = std::fs::read(folder.join(format!("v{id}")))?;
    Checksum::from_bytes(&bytes).check(checksum)?;

    let mut reader = &bytes[..];
    decode_version(&mut reader, tables_folder)
}

fn decode_version<R: Read>(reader: &mut R, tables_folder: &Path) -> crate::Result<Version> {
    let mut magic = [0; 4];
    reader.read_exact(&mut magic)?;

    if magic != MAGIC_BYTES {
        return Err(DecodeError::InvalidHeader("version magic mismatch").into());
    }

    let id = reader.read_u64::<LittleEndian>()?;
    let level_count = reader.read_u8()?;

    let backing_count = reader.read_u64_varint()?;
    let mut virtual_backings: HashMap<TableId, Table> = HashMap::default();

    for _ in 0..backing_count {
        let metadata = TableMetadata::decode_from(reader)?;
        let path = tables_folder.join(metadata.id.to_string());
        let table = Table::from_metadata(metadata, path);
        virtual_backings.insert(table.id(), table);
    }

    let mut levels = vec![];

    for _ in 0..level_count {
        let table_count = reader.read_u64_varint()?;
        let mut tables = vec![];

        for _ in 0..table_count {
            match reader.read_u8()? {
                0 => {
                    let metadata = TableMetadata::decode_from(reader)?;
                    let path = tables_folder.join(metadata.id.to_string());
                    tables.push(Table::from_metadata(metadata, path));
                }
                1 => {
                    let id = reader.read_u64_varint()?;
                    let backing_id = reader.read_u64_varint()?;
                    let clip = KeyRange::decode_from(reader)?;

                    let backing = virtual_backings
                        .get(&backing_id)
                        .ok_or(crate::Error::Unrecoverable)?;

                    tables.push(Table::new_virtual(
                        id,
                        backing,
                        clip.min().clone(),
                        clip.max().clone(),
                    ));
                }
                tag => {
                    return Err(DecodeError::InvalidTag(("TableFlag", tag)).into());
                }
            }
        }

        levels.push(Level { tables });
    }

    Ok(Version::from_levels(id, levels, virtual_backings))
}
