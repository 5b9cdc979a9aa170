//! Content addressed block storage.
//!
//! Data is cut into chunks by a [`Chunker`], each chunk is stored under its hash and the chunk
//! hashes are gathered into a tree of [`Block`]s by a [`BlockSink`]. The top block of a tree is
//! enough to read the data back from any [`Store`](vt_interfaces::Store) holding its chunks.

mod archive;
mod block;
mod cache;
mod chunker;
mod config;
mod datadir;
mod datafile;
mod index;
mod memory;
mod sink;
#[cfg(test)]
mod tests;

pub use archive::{Archive, ArchiveEntry};
pub use block::{decode_blocks, Block, LeafWalker, MAX_SUBBLOCKS};
pub use cache::{CacheStore, MemoryCache};
pub use chunker::{
    chunks_of,
    scanner_for_path,
    ChunkError,
    Chunker,
    RollingHashScanner,
    Scanner,
    TextScanner,
    MAX_BLOCKSIZE,
    MIN_AUTOBLOCK,
    MIN_BLOCKSIZE,
};
pub use config::{CacheConfig, Config, DATA_DIR, MIN_ROLLOVER};
pub use datadir::{DataDir, HashcodesFrom, DATA_SUFFIX, INDEX_FILE, STATE_FILE};
pub use datafile::{decode_record, encode_record, DataFile, RecordScanner, ScannedRecord};
pub use index::{IndexEntry, IndexKind};
pub use memory::MemoryStore;
pub use sink::{blockify, blockify_bytes, BlockSink, BlockifyError};
