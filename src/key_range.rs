// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    Slice, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    ops::Deref,
};

/// A key range in the format of [min, max] (inclusive on both sides)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange((UserKey, UserKey));

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}<=>{}]",
            String::from_utf8_lossy(&self.0 .0),
            String::from_utf8_lossy(&self.0 .1)
        )
    }
}

impl std::ops::Deref for KeyRange {
    type Target = (UserKey, UserKey);

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl KeyRange {
    pub fn new(range: (UserKey, UserKey)) -> Self {
        Self(range)
    }

    pub fn empty() -> Self {
        Self((Slice::empty(), Slice::empty()))
    }

    pub fn min(&self) -> &UserKey {
        &self.0 .0
    }

    pub fn max(&self) -> &UserKey {
        &self.0 .1
    }

    /// Returns `true` if the key falls within this key range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        let (start, end) = &self.0;
        key >= start.as_ref() && key <= end.as_ref()
    }

    /// Returns `true` if the `other` is fully contained in this range.
    pub fn contains_range(&self, other: &Self) -> bool {
        let (start1, end1) = &self.0;
        let (start2, end2) = &other.0;
        start1 <= start2 && end1 >= end2
    }

    /// Returns `true` if the `other` overlaps at least partially with this range.
    pub fn overlaps_with_key_range(&self, other: &Self) -> bool {
        let (start1, end1) = &self.0;
        let (start2, end2) = &other.0;
        end1 >= start2 && start1 <= end2
    }

    /// Returns `true` if the half-open span `[start, end)` intersects this range.
    pub fn overlaps_with_span(&self, start: &[u8], end: &[u8]) -> bool {
        let (my_lo, my_hi) = &self.0;
        start <= my_hi.as_ref() && my_lo.as_ref() < end
    }

    /// Returns `true` if the list of key ranges is disjoint
    pub fn is_disjoint(ranges: &[&Self]) -> bool {
        for (idx, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(idx + 1) {
                if a.overlaps_with_key_range(b) {
                    return false;
                }
            }
        }

        true
    }

    /// Aggregates a key range.
    pub fn aggregate<'a>(mut iter: impl Iterator<Item = &'a Self>) -> Self {
        let Some(first) = iter.next() else {
            return Self::empty();
        };

        let mut min = first.min();
        let mut max = first.max();

        for other in iter {
            let x = other.min();
            if x < min {
                min = x;
            }

            let x = other.max();
            if x > max {
                max = x;
            }
        }

        Self((min.clone(), max.clone()))
    }
}

impl Encode for KeyRange {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Max key size = u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.deref().0.len() as u16)?;
        writer.write_all(&self.deref().0)?;

        // NOTE: Max key size = u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.deref().1.len() as u16)?;
        writer.write_all(&self.deref().1)?;

        Ok(())
    }
}

impl Decode for KeyRange {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_min_len = reader.read_u16::<BigEndian>()?;
        let key_min: UserKey = Slice::from_reader(reader, key_min_len.into())?;

        let key_max_len = reader.read_u16::<BigEndian>()?;
        let key_max: UserKey = Slice::from_reader(reader, key_max_len.into())?;

        Ok(Self::new((key_min, key_max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn string_key_range(a: &str, b: &str) -> KeyRange {
        KeyRange::new((a.as_bytes().into(), b.as_bytes().into()))
    }

    #[test]
    fn key_range_overlap() {
        let a = string_key_range("a", "f");
        let b = string_key_range("b", "h");
        assert!(a.overlaps_with_key_range(&b));
        assert!(b.overlaps_with_key_range(&a));
    }

    #[test]
    fn key_range_no_overlap() {
        let a = string_key_range("a", "f");
        let b = string_key_range("g", "h");
        assert!(!a.overlaps_with_key_range(&b));
        assert!(KeyRange::is_disjoint(&[&a, &b]));
    }

    #[test]
    fn key_range_span_overlap() {
        let a = string_key_range("b", "d");

        // [a, b) does not touch [b, d]
        assert!(!a.overlaps_with_span(b"a", b"b"));

        // [a, c) does
        assert!(a.overlaps_with_span(b"a", b"c"));

        // [d, z) touches the inclusive max
        assert!(a.overlaps_with_span(b"d", b"z"));
    }

    #[test]
    fn key_range_contains() {
        let a = string_key_range("a", "f");
        assert!(a.contains_key(b"a"));
        assert!(a.contains_key(b"f"));
        assert!(!a.contains_key(b"g"));
        assert!(a.contains_range(&string_key_range("b", "c")));
        assert!(!a.contains_range(&string_key_range("b", "g")));
    }

    #[test]
    fn key_range_aggregate() {
        let ranges = [
            string_key_range("c", "d"),
            string_key_range("a", "b"),
            string_key_range("f", "h"),
        ];
        let aggregated = KeyRange::aggregate(ranges.iter());
        assert_eq!(string_key_range("a", "h"), aggregated);
    }

    #[test]
    fn key_range_roundtrip() -> crate::Result<()> {
        let before = string_key_range("abc", "def");

        let buf = before.encode_into_vec();
        let mut cursor = std::io::Cursor::new(buf);
        let after = KeyRange::decode_from(&mut cursor)?;

        assert_eq!(before, after);

        Ok(())
    }
}
