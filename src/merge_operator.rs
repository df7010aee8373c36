// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::UserValue;

/// User-supplied operator that combines `Merge` operands
///
/// The operation MUST be associative: for any values a, b and c,
/// `merge(merge(a, b), c) == merge(a, merge(b, c))`.
///
/// Compactions use this to collapse merge chains within a snapshot stripe;
/// without a configured operator, merge operands are carried through
/// compactions untouched.
pub trait MergeOperator: Send + Sync {
    /// Merges the existing (older) value with a merge operand.
    ///
    /// `existing` is `None` when the operand is the oldest visible entry
    /// for the key.
    fn merge(&self, key: &[u8], existing: Option<&UserValue>, operand: &UserValue) -> UserValue;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Concatenates operands, oldest first (test helper)
    pub struct ConcatMerge;

    impl MergeOperator for ConcatMerge {
        fn merge(&self, _key: &[u8], existing: Option<&UserValue>, operand: &UserValue) -> UserValue {
            let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
            out.extend_from_slice(operand);
            out.into()
        }
    }
}
