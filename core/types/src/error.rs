use std::path::PathBuf;

use thiserror::Error;

use crate::HashCode;

/// Malformed binary or textual input. Always a local parse failure, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input at offset {offset}, {needed} more bytes needed.")]
    Truncated { offset: usize, needed: usize },
    #[error("Encoded integer at offset {offset} does not fit in 64 bits.")]
    VarintOverflow { offset: usize },
    #[error("Unsupported hash algorithm tag {0}.")]
    UnsupportedAlgorithm(u64),
    #[error("Expected a digest of {expected} bytes, got {got}.")]
    InvalidDigestLength { expected: usize, got: usize },
    #[error("Unrecognized flag bits 0x{0:02x}.")]
    UnknownFlags(u64),
    #[error("{extra} bytes of unparsed data after offset {offset}.")]
    TrailingData { offset: usize, extra: usize },
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),
    #[error("Malformed input: {0}")]
    Malformed(String),
}

/// The failure modes shared by every store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to decode stored data. {0}")]
    Decode(#[from] DecodeError),
    #[error("Hash {0:?} is not present in the store.")]
    MissingHash(HashCode),
    #[error("Corrupt record in {file} at offset {offset}: {reason}")]
    CorruptRecord {
        file: String,
        offset: u64,
        reason: String,
    },
    #[error("Error while accessing the disk. {0}")]
    Io(#[from] std::io::Error),
    #[error("Appending to {path:?} failed. {source}")]
    Rollover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("The store failed a write and must be reopened before further use.")]
    Unusable,
    #[error("The store has been closed.")]
    Closed,
    #[error("The state directory {0:?} is locked by another store instance.")]
    Locked(PathBuf),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("The operation is not supported by {0}.")]
    Unsupported(&'static str),
    #[error("The remote store reported an error: {0}")]
    Remote(String),
    #[error("A background task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Returns true if the error only affects the operation that raised it, and the store can
    /// keep serving requests.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            StoreError::Decode(_)
                | StoreError::MissingHash(_)
                | StoreError::CorruptRecord { .. }
                | StoreError::Remote(_)
        )
    }
}
