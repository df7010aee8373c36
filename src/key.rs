// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{SeqNo, UserKey};
use std::cmp::Reverse;

/// Kind of an internal key
///
/// The numeric tag doubles as a tie breaker: at equal seqno,
/// a higher tag shadows a lower one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Deleted value
    Delete = 0,

    /// "Weak" deletion that only erases the single value directly beneath it
    SingleDelete = 1,

    /// Deletion carrying the expected size of the deleted value
    DeleteSized = 2,

    /// Partial value, combined through the merge operator
    Merge = 3,

    /// Existing value
    Set = 4,

    /// Deletes all point keys in a span
    RangeDelete = 5,

    /// Removes a range key at a specific suffix
    RangeKeyUnset = 6,

    /// Removes all range keys in a span
    RangeKeyDelete = 7,

    /// Sets a range key over a span
    RangeKeySet = 8,
}

impl KeyKind {
    /// Returns `true` for the point-deletion kinds.
    #[must_use]
    pub fn is_point_tombstone(self) -> bool {
        matches!(self, Self::Delete | Self::SingleDelete | Self::DeleteSized)
    }

    /// Returns `true` for `RangeKeySet`, `RangeKeyUnset` and `RangeKeyDelete`.
    #[must_use]
    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            Self::RangeKeySet | Self::RangeKeyUnset | Self::RangeKeyDelete
        )
    }

    /// Returns `true` for any kind that spans a key range.
    #[must_use]
    pub fn is_range_kind(self) -> bool {
        self == Self::RangeDelete || self.is_range_key()
    }
}

impl TryFrom<u8> for KeyKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Delete),
            1 => Ok(Self::SingleDelete),
            2 => Ok(Self::DeleteSized),
            3 => Ok(Self::Merge),
            4 => Ok(Self::Set),
            5 => Ok(Self::RangeDelete),
            6 => Ok(Self::RangeKeyUnset),
            7 => Ok(Self::RangeKeyDelete),
            8 => Ok(Self::RangeKeySet),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct InternalKey {
    pub user_key: UserKey,
    pub seqno: SeqNo,
    pub kind: KeyKind,
}

impl AsRef<[u8]> for InternalKey {
    fn as_ref(&self) -> &[u8] {
        &self.user_key
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.user_key == other.user_key && self.seqno == other.seqno && self.kind == other.kind
    }
}

impl std::hash::Hash for InternalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.user_key);
        state.write_u64(self.seqno);
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key,
            self.seqno,
            match self.kind {
                KeyKind::Set => "SET",
                KeyKind::Merge => "MERGE",
                KeyKind::Delete => "DEL",
                KeyKind::SingleDelete => "SINGLEDEL",
                KeyKind::DeleteSized => "DELSIZED",
                KeyKind::RangeDelete => "RANGEDEL",
                KeyKind::RangeKeySet => "RANGEKEYSET",
                KeyKind::RangeKeyUnset => "RANGEKEYUNSET",
                KeyKind::RangeKeyDelete => "RANGEKEYDEL",
            },
        )
    }
}

impl InternalKey {
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, kind: KeyKind) -> Self {
        let user_key = user_key.into();

        assert!(
            u16::try_from(user_key.len()).is_ok(),
            "keys can be 65535 bytes in length",
        );

        Self {
            user_key,
            seqno,
            kind,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind.is_point_tombstone()
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by (seqno, kind) descending
// This is one of the most important functions
// Otherwise merges will not match expected behaviour
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno), Reverse(self.kind as u8)).cmp(&(
            &other.user_key,
            Reverse(other.seqno),
            Reverse(other.kind as u8),
        ))
    }
}
