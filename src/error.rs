// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Checksum, DecodeError, EncodeError};

/// Represents errors that can occur in the compaction engine
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Invalid checksum value (got, expected)
    InvalidChecksum((Checksum, Checksum)),

    /// A compaction observed its cancel flag and aborted cooperatively
    ///
    /// This error is retryable: the inputs revert to a non-compacting
    /// state and the scheduler is free to pick them again.
    CompactionCancelled,

    /// A runner-level invariant check failed
    ///
    /// This is fatal to the engine.
    InvariantViolation(&'static str),

    /// Some required table files could not be recovered from disk
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactionEngineError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::InvalidChecksum(_)
            | Self::CompactionCancelled
            | Self::InvariantViolation(_)
            | Self::Unrecoverable => None,
        }
    }
}

impl Error {
    /// Returns `true` if the error is a cooperative compaction abort.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::CompactionCancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Compaction engine result
pub type Result<T> = std::result::Result<T, Error>;
