use bytes::Bytes;
use thiserror::Error;
use vt_interfaces::types::{HashCode, StoreError};
use vt_interfaces::Store;

use crate::block::{Block, MAX_SUBBLOCKS};
use crate::chunker::{chunks_of, ChunkError};

/// Builds a block tree from a sequence of chunks.
///
/// Level 0 collects the leaves. When the list of a level is full it is stored as an indirect
/// block which is appended to the level above, and the list starts over, so the tree grows a
/// level whenever the top list fills up.
pub struct BlockSink<S> {
    store: S,
    levels: Vec<Vec<Block>>,
}

impl<S: Store> BlockSink<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            levels: Vec::new(),
        }
    }

    /// Store `chunk` and append it to the tree.
    pub async fn append(&mut self, chunk: Bytes) -> Result<HashCode, StoreError> {
        let span = chunk.len() as u64;
        let hash = self.store.add(chunk).await?;
        self.append_block(Block::leaf(hash, span)).await?;
        Ok(hash)
    }

    /// Append an existing block, for example the tree of an already stored stream.
    pub async fn append_block(&mut self, block: Block) -> Result<(), StoreError> {
        self.push(0, block).await
    }

    async fn push(&mut self, mut level: usize, mut block: Block) -> Result<(), StoreError> {
        loop {
            if level == self.levels.len() {
                self.levels.push(Vec::with_capacity(MAX_SUBBLOCKS));
            }
            let list = &mut self.levels[level];
            if list.len() < MAX_SUBBLOCKS {
                list.push(block);
                return Ok(());
            }
            let full = std::mem::replace(list, Vec::with_capacity(MAX_SUBBLOCKS));
            list.push(block);
            block = Block::indirect_from_children(&self.store, &full).await?;
            level += 1;
        }
    }

    /// Pack every pending level into its parent and return the top block.
    ///
    /// The top is always an indirect block, even for a single chunk. With no chunks at all it
    /// has no children and a span of 0.
    pub async fn close(mut self) -> Result<Block, StoreError> {
        let mut level = 0;
        while level + 1 < self.levels.len() {
            let mut list = std::mem::take(&mut self.levels[level]);
            let packed = match list.len() {
                0 => None,
                1 => list.pop(),
                _ => Some(Block::indirect_from_children(&self.store, &list).await?),
            };
            if let Some(block) = packed {
                self.push(level + 1, block).await?;
            }
            level += 1;
        }
        let top = self.levels.pop().unwrap_or_default();
        Block::indirect_from_children(&self.store, &top).await
    }
}

#[derive(Error, Debug)]
pub enum BlockifyError {
    #[error("Failed to chunk the input. {0}")]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Store a sequence of chunks as a block tree and return its top block.
pub async fn blockify<S, I>(store: S, chunks: I) -> Result<Block, BlockifyError>
where
    S: Store,
    I: IntoIterator<Item = Result<Bytes, ChunkError>>,
{
    let mut sink = BlockSink::new(store);
    for chunk in chunks {
        sink.append(chunk?).await?;
    }
    Ok(sink.close().await?)
}

/// Chunk `data` with the default scanner and store it as a block tree.
pub async fn blockify_bytes<S: Store>(store: S, data: &[u8]) -> Result<Block, BlockifyError> {
    blockify(store, chunks_of(data)).await
}
