//! The block tree.
//!
//! A stream of bytes is stored as a tree of blocks. Leaves are [`Block::Direct`] references to
//! one stored chunk. Inner nodes are [`Block::Indirect`] references to a stored chunk that holds
//! the encoded list of their children. Every block knows its span, the number of bytes of the
//! stream it covers, so ranges can be read without visiting unrelated subtrees.
//!
//! A block is encoded as `BS(flags) + BS(span) + hash.encode()`, with flag `0x01` marking an
//! indirect block. The payload of an indirect block is the concatenation of the encodings of
//! its children.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use vt_interfaces::types::{varint, DecodeError, HashCode, StoreError};
use vt_interfaces::Store;

use crate::chunker::MAX_BLOCKSIZE;

/// The fan out of the block tree.
pub const MAX_SUBBLOCKS: usize = 16;

/// Most `read_range` reserves before any data arrived. Spans are decoded input, the buffer
/// only grows past this with bytes actually read.
const READ_PREALLOC: u64 = (MAX_BLOCKSIZE * MAX_SUBBLOCKS) as u64;

const F_INDIRECT: u64 = 0x01;
const F_KNOWN: u64 = F_INDIRECT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Block {
    /// A single stored chunk.
    Direct { hash: HashCode, span: u64 },
    /// A stored list of child blocks. The span is the sum of the children's spans.
    Indirect { hash: HashCode, span: u64 },
}

impl Block {
    /// Wrap an already stored chunk of `span` bytes.
    pub fn leaf(hash: HashCode, span: u64) -> Self {
        Block::Direct { hash, span }
    }

    /// Store the encoded list of `children` and return the indirect block referring to it.
    pub async fn indirect_from_children<S: Store + ?Sized>(
        store: &S,
        children: &[Block],
    ) -> Result<Self, StoreError> {
        let mut payload = Vec::with_capacity(children.len() * (2 + 2 + 21));
        let mut span = 0u64;
        for child in children {
            child.encode_into(&mut payload);
            span += child.span();
        }
        let hash = store.add(payload.into()).await?;
        Ok(Block::Indirect { hash, span })
    }

    /// Rebuild the indirect block stored under `hash`, for example a top hash returned by
    /// [`crate::BlockSink::close`].
    pub async fn load_indirect<S: Store + ?Sized>(
        store: &S,
        hash: &HashCode,
    ) -> Result<Self, StoreError> {
        let payload = store.get(hash).await?;
        let span = decode_blocks(&payload)?.iter().map(Block::span).sum();
        Ok(Block::Indirect { hash: *hash, span })
    }

    #[inline]
    pub fn hash(&self) -> &HashCode {
        match self {
            Block::Direct { hash, .. } | Block::Indirect { hash, .. } => hash,
        }
    }

    #[inline]
    pub fn span(&self) -> u64 {
        match self {
            Block::Direct { span, .. } | Block::Indirect { span, .. } => *span,
        }
    }

    #[inline]
    pub fn is_indirect(&self) -> bool {
        matches!(self, Block::Indirect { .. })
    }

    fn flags(&self) -> u64 {
        if self.is_indirect() { F_INDIRECT } else { 0 }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        varint::put_uint(buf, self.flags());
        varint::put_uint(buf, self.span());
        self.hash().encode_into(buf);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a block from `bs` at `offset`, returning it and the offset just past it.
    pub fn decode(bs: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let (flags, offset) = varint::get_uint(bs, offset)?;
        if flags & !F_KNOWN != 0 {
            return Err(DecodeError::UnknownFlags(flags & !F_KNOWN));
        }
        let (span, offset) = varint::get_uint(bs, offset)?;
        let (hash, offset) = HashCode::decode(bs, offset)?;
        let block = if flags & F_INDIRECT != 0 {
            Block::Indirect { hash, span }
        } else {
            Block::Direct { hash, span }
        };
        Ok((block, offset))
    }

    /// Decode a buffer holding exactly one encoded block.
    pub fn decode_exact(bs: &[u8]) -> Result<Self, DecodeError> {
        let (block, offset) = Self::decode(bs, 0)?;
        if offset != bs.len() {
            return Err(DecodeError::TrailingData {
                offset,
                extra: bs.len() - offset,
            });
        }
        Ok(block)
    }

    /// The stored chunk this block refers to. For a direct block that is its data, for an
    /// indirect block the encoded child list.
    pub async fn data<S: Store + ?Sized>(&self, store: &S) -> Result<Bytes, StoreError> {
        let data = store.get(self.hash()).await?;
        if let Block::Direct { span, .. } = self {
            if data.len() as u64 != *span {
                return Err(DecodeError::Malformed(format!(
                    "block {} spans {span} bytes but holds {}",
                    self.hash(),
                    data.len()
                ))
                .into());
            }
        }
        Ok(data)
    }

    /// The children of an indirect block, empty for a direct block.
    pub async fn subblocks<S: Store + ?Sized>(&self, store: &S) -> Result<Vec<Block>, StoreError> {
        match self {
            Block::Direct { .. } => Ok(Vec::new()),
            Block::Indirect { hash, .. } => Ok(decode_blocks(&store.get(hash).await?)?),
        }
    }

    /// Walk the leaves of the tree in stream order.
    pub fn leaves<S: Store>(&self, store: S) -> LeafWalker<S> {
        LeafWalker {
            store,
            stack: vec![vec![*self].into_iter()],
        }
    }

    /// The whole stream covered by this block.
    pub async fn all_data<S: Store + ?Sized>(&self, store: &S) -> Result<Bytes, StoreError> {
        self.read_range(store, 0, self.span()).await
    }

    /// Read the bytes `[start, end)` of the stream covered by this block. The range is clipped
    /// to the span, subtrees outside of it are never fetched.
    pub async fn read_range<S: Store + ?Sized>(
        &self,
        store: &S,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError> {
        let end = end.min(self.span());
        if start >= end {
            return Ok(Bytes::new());
        }
        if let Block::Direct { .. } = self {
            return Ok(self.data(store).await?.slice(start as usize..end as usize));
        }

        let mut out = BytesMut::with_capacity((end - start).min(READ_PREALLOC) as usize);
        // (block, offset of its first byte in the stream), last entry is the next to visit.
        let mut stack = vec![(*self, 0u64)];
        while let Some((block, offset)) = stack.pop() {
            let block_end = offset
                .checked_add(block.span())
                .ok_or_else(|| span_overflow(&block))?;
            if block_end <= start || offset >= end {
                continue;
            }
            match block {
                Block::Direct { .. } => {
                    let data = block.data(store).await?;
                    let from = start.saturating_sub(offset) as usize;
                    let to = (end.min(block_end) - offset) as usize;
                    out.extend_from_slice(&data[from..to]);
                },
                Block::Indirect { .. } => {
                    let children = block.subblocks(store).await?;
                    let mut child_offset = offset;
                    let mut placed = Vec::with_capacity(children.len());
                    for child in children {
                        placed.push((child, child_offset));
                        child_offset = child_offset
                            .checked_add(child.span())
                            .ok_or_else(|| span_overflow(&block))?;
                    }
                    if child_offset != block_end {
                        return Err(DecodeError::Malformed(format!(
                            "indirect block {} spans {} bytes but its children span {}",
                            block.hash(),
                            block.span(),
                            child_offset - offset
                        ))
                        .into());
                    }
                    stack.extend(placed.into_iter().rev());
                },
            }
        }
        Ok(out.freeze())
    }
}

fn span_overflow(block: &Block) -> StoreError {
    DecodeError::Malformed(format!("spans below block {} overflow", block.hash())).into()
}

/// Decode a concatenation of encoded blocks, as found in the payload of an indirect block.
pub fn decode_blocks(bs: &[u8]) -> Result<Vec<Block>, DecodeError> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < bs.len() {
        let (block, next) = Block::decode(bs, offset)?;
        blocks.push(block);
        offset = next;
    }
    Ok(blocks)
}

/// Depth first walk over the direct blocks of a tree, see [`Block::leaves`].
pub struct LeafWalker<S> {
    store: S,
    /// Children still to visit, one iterator per level of the tree.
    stack: Vec<std::vec::IntoIter<Block>>,
}

impl<S: Store> LeafWalker<S> {
    /// Returns the next leaf or `None` once the tree is exhausted.
    pub async fn next_leaf(&mut self) -> Result<Option<Block>, StoreError> {
        loop {
            let Some(level) = self.stack.last_mut() else {
                return Ok(None);
            };
            match level.next() {
                None => {
                    self.stack.pop();
                },
                Some(block @ Block::Direct { .. }) => return Ok(Some(block)),
                Some(block) => {
                    let children = block.subblocks(&self.store).await?;
                    self.stack.push(children.into_iter());
                },
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Block, StoreError>> {
        stream::try_unfold(self, |mut walker| async move {
            let leaf = walker.next_leaf().await?;
            Ok::<_, StoreError>(leaf.map(|block| (block, walker)))
        })
    }
}
