//! Content defined chunking.
//!
//! A [`Chunker`] consumes arbitrarily sized input fragments and cuts the concatenated stream
//! into chunks. Where a chunk ends is decided by a [`Scanner`] looking at the pending bytes,
//! so identical content produces identical chunks regardless of how the input was fragmented,
//! which is what makes deduplication work across edits.

use std::path::Path;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// No chunk, except the last one of a stream, is shorter than this.
pub const MIN_BLOCKSIZE: usize = 80;
/// The rolling hash and text scanners do not cut chunks shorter than this.
pub const MIN_AUTOBLOCK: usize = 1024;
/// Chunks are cut at this size if no edge was found before.
pub const MAX_BLOCKSIZE: usize = 16383;

const HASH_MODULUS: u32 = 4093;
const HASH_EDGE: u32 = 4091;
/// The rolling hash covers the last four bytes.
const HASH_WINDOW: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Scanner returned edge {edge} outside of ({from}, {len}].")]
    InvalidEdge { edge: usize, from: usize, len: usize },
}

/// Finds the place to cut a chunk.
pub trait Scanner: Send {
    /// Return the smallest edge `e` with `from < e <= pending.len()` or `None` when the pending
    /// bytes hold no edge. An edge `e` means the chunk is `pending[..e]`.
    ///
    /// Positions up to `from` have been rejected before and are only there as context.
    fn find_edge(&mut self, pending: &[u8], from: usize) -> Option<usize>;
}

impl<S: Scanner + ?Sized> Scanner for Box<S> {
    fn find_edge(&mut self, pending: &[u8], from: usize) -> Option<usize> {
        (**self).find_edge(pending, from)
    }
}

#[inline]
fn roll(h: u32, b: u8) -> u32 {
    ((h & 0x1fffff) << 7) | ((b & 0x7f) ^ ((b & 0x80) >> 7)) as u32
}

/// The default scanner: cuts where a rolling hash over the last four bytes hits a magic value.
#[derive(Clone, Copy, Debug, Default)]
pub struct RollingHashScanner;

impl Scanner for RollingHashScanner {
    fn find_edge(&mut self, pending: &[u8], from: usize) -> Option<usize> {
        let mut h = 0;
        for (i, &b) in pending
            .iter()
            .enumerate()
            .skip(from.saturating_sub(HASH_WINDOW - 1))
        {
            h = roll(h, b);
            let edge = i + 1;
            if edge > from && edge >= MIN_AUTOBLOCK && h % HASH_MODULUS == HASH_EDGE {
                return Some(edge);
            }
        }
        None
    }
}

/// Cuts source code and prose at line boundaries.
///
/// Once a chunk has reached [`MIN_AUTOBLOCK`] bytes it is cut after a blank line or after a
/// line consisting of a closing brace. Past four times that size any line end will do.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextScanner;

impl TextScanner {
    fn is_break_line(line: &[u8]) -> bool {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line.iter().all(|b| b.is_ascii_whitespace()) || line == b"}" || line == b"};"
    }
}

impl Scanner for TextScanner {
    fn find_edge(&mut self, pending: &[u8], from: usize) -> Option<usize> {
        let start = from.max(MIN_AUTOBLOCK - 1);
        let mut i = start;
        while i < pending.len() {
            let nl = i + pending[i..].iter().position(|&b| b == b'\n')?;
            let edge = nl + 1;
            let line_start = pending[..nl]
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |p| p + 1);
            if edge >= 4 * MIN_AUTOBLOCK || Self::is_break_line(&pending[line_start..nl]) {
                return Some(edge);
            }
            i = edge;
        }
        None
    }
}

/// Choose a scanner from a file name: text like files are cut at line boundaries, everything
/// else with the rolling hash.
pub fn scanner_for_path(path: &Path) -> Box<dyn Scanner> {
    const TEXT_EXTENSIONS: &[&str] = &[
        "c", "cc", "cpp", "css", "csv", "go", "h", "html", "java", "js", "json", "md", "py",
        "rs", "sh", "toml", "ts", "txt", "xml", "yaml", "yml",
    ];
    let is_text = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if is_text {
        Box::new(TextScanner)
    } else {
        Box::new(RollingHashScanner)
    }
}

/// Splits a stream of fragments into chunks. See the module documentation.
///
/// The iterator is single pass. Its chunks concatenate to exactly the input, every chunk but
/// the last is between [`MIN_BLOCKSIZE`] and [`MAX_BLOCKSIZE`] bytes long and an empty input
/// yields no chunk at all. After an error the iterator is exhausted.
pub struct Chunker<I, S = RollingHashScanner> {
    input: Option<I>,
    scanner: S,
    pending: BytesMut,
    /// Number of pending bytes the scanner has already rejected.
    scanned: usize,
}

impl<I, B> Chunker<I, RollingHashScanner>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
{
    pub fn new<T: IntoIterator<IntoIter = I>>(input: T) -> Self {
        Self::with_scanner(input, RollingHashScanner)
    }
}

impl<I, B, S> Chunker<I, S>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
    S: Scanner,
{
    pub fn with_scanner<T: IntoIterator<IntoIter = I>>(input: T, scanner: S) -> Self {
        Self {
            input: Some(input.into_iter()),
            scanner,
            pending: BytesMut::new(),
            scanned: 0,
        }
    }

    /// Try to cut a chunk from the pending bytes.
    fn cut(&mut self) -> Result<Option<Bytes>, ChunkError> {
        if self.pending.len() < MIN_BLOCKSIZE {
            return Ok(None);
        }
        let len = self.pending.len().min(MAX_BLOCKSIZE);
        let from = self.scanned.max(MIN_BLOCKSIZE - 1);
        if from < len {
            if let Some(edge) = self.scanner.find_edge(&self.pending[..len], from) {
                if edge <= from || edge > len {
                    return Err(ChunkError::InvalidEdge { edge, from, len });
                }
                return Ok(Some(self.take(edge)));
            }
        }
        if len == MAX_BLOCKSIZE {
            return Ok(Some(self.take(MAX_BLOCKSIZE)));
        }
        self.scanned = len;
        Ok(None)
    }

    fn take(&mut self, n: usize) -> Bytes {
        self.scanned = 0;
        self.pending.split_to(n).freeze()
    }
}

impl<I, B, S> Iterator for Chunker<I, S>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
    S: Scanner,
{
    type Item = Result<Bytes, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.cut() {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => {},
                Err(e) => {
                    self.input = None;
                    self.pending.clear();
                    return Some(Err(e));
                },
            }

            let Some(input) = self.input.as_mut() else {
                // Input is exhausted, whatever is left is the last chunk.
                if self.pending.is_empty() {
                    return None;
                }
                let n = self.pending.len();
                return Some(Ok(self.take(n)));
            };

            match input.next() {
                Some(fragment) => self.pending.extend_from_slice(fragment.as_ref()),
                None => self.input = None,
            }
        }
    }
}

/// Chunk a single buffer with the default scanner.
pub fn chunks_of(data: &[u8]) -> Chunker<std::iter::Once<&[u8]>> {
    Chunker::new(std::iter::once(data))
}
