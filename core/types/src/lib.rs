//! Shared value types of the block store: content hashes, the BS integer encoding and the
//! error taxonomy used by every store implementation.

mod error;
mod hash;
pub mod varint;

pub use error::*;
pub use hash::*;

/// Size at which a data file is rolled over to a fresh one. 1GiB.
pub const DEFAULT_ROLLOVER: u64 = 1024 * 1024 * 1024;
