//! Mapping from hash to the location of the record holding its data.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vt_interfaces::types::{varint, DecodeError, HashCode, StoreError};

/// Number of keys fetched per lock acquisition by [`keys_from`].
const KEYS_PAGE: usize = 1024;

/// Where the record of a stored chunk lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub file_id: u64,
    pub offset: u64,
    /// Length of the whole record, header included.
    pub length: u64,
}

impl IndexEntry {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        varint::put_uint(buf, self.file_id);
        varint::put_uint(buf, self.offset);
        varint::put_uint(buf, self.length);
    }

    pub fn decode(bs: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let (file_id, offset) = varint::get_uint(bs, offset)?;
        let (entry_offset, offset) = varint::get_uint(bs, offset)?;
        let (length, offset) = varint::get_uint(bs, offset)?;
        Ok((
            Self {
                file_id,
                offset: entry_offset,
                length,
            },
            offset,
        ))
    }
}

/// The available index backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Kept in memory and persisted to an append only journal.
    #[default]
    Journal,
    /// Kept in memory only, rebuilt from the data files on every open.
    Memory,
}

/// A persistent, ordered hash to [`IndexEntry`] map.
pub trait Index: Send + Sync {
    fn get(&self, hash: &HashCode) -> Result<Option<IndexEntry>, StoreError>;

    /// Record the location of `hash`. Returns false and changes nothing if the hash is already
    /// indexed.
    fn put(&self, hash: HashCode, entry: IndexEntry) -> Result<bool, StoreError>;

    fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        Ok(self.get(hash)?.is_some())
    }

    /// Make every `put` so far durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn len(&self) -> usize;

    /// Return at most `limit` keys starting from `from`, ascending or, with `reverse`,
    /// descending. For a descending page `from` is the upper bound.
    fn page(&self, from: Bound<HashCode>, reverse: bool, limit: usize) -> Vec<HashCode>;
}

/// Open the index of the given kind. `path` is only used by persistent backends.
pub fn open_index(kind: IndexKind, path: &Path) -> Result<Arc<dyn Index>, StoreError> {
    Ok(match kind {
        IndexKind::Journal => Arc::new(JournalIndex::open(path)?),
        IndexKind::Memory => Arc::new(MemoryIndex::default()),
    })
}

/// Iterate over the keys of `index` in order, starting at `start` (inclusive) or at the first
/// (last with `reverse`) key. The index is only locked while a page is fetched, so keys added
/// during the iteration may or may not be seen.
pub fn keys_from(index: Arc<dyn Index>, start: Option<HashCode>, reverse: bool) -> KeysFrom {
    KeysFrom {
        index,
        next: start.map_or(Bound::Unbounded, Bound::Included),
        reverse,
        buffer: VecDeque::new(),
        done: false,
    }
}

/// See [`keys_from`].
pub struct KeysFrom {
    index: Arc<dyn Index>,
    next: Bound<HashCode>,
    reverse: bool,
    buffer: VecDeque<HashCode>,
    done: bool,
}

impl Iterator for KeysFrom {
    type Item = HashCode;

    fn next(&mut self) -> Option<HashCode> {
        if self.buffer.is_empty() && !self.done {
            let page = self.index.page(self.next, self.reverse, KEYS_PAGE);
            self.done = page.len() < KEYS_PAGE;
            if let Some(last) = page.last() {
                self.next = Bound::Excluded(*last);
            }
            self.buffer.extend(page);
        }
        self.buffer.pop_front()
    }
}

fn page_of<V>(
    map: &BTreeMap<HashCode, V>,
    from: Bound<HashCode>,
    reverse: bool,
    limit: usize,
) -> Vec<HashCode> {
    if reverse {
        map.range((Bound::Unbounded, from))
            .rev()
            .take(limit)
            .map(|(k, _)| *k)
            .collect()
    } else {
        map.range((from, Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| *k)
            .collect()
    }
}

/// An index that lives in memory only.
#[derive(Default)]
pub struct MemoryIndex {
    map: RwLock<BTreeMap<HashCode, IndexEntry>>,
}

impl Index for MemoryIndex {
    fn get(&self, hash: &HashCode) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self.map.read().get(hash).copied())
    }

    fn put(&self, hash: HashCode, entry: IndexEntry) -> Result<bool, StoreError> {
        let mut map = self.map.write();
        if map.contains_key(&hash) {
            return Ok(false);
        }
        map.insert(hash, entry);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn page(&self, from: Bound<HashCode>, reverse: bool, limit: usize) -> Vec<HashCode> {
        page_of(&self.map.read(), from, reverse, limit)
    }
}

/// An in memory index backed by an append only journal of `BSData(hash + entry)` records.
///
/// The journal is replayed on open. A torn record at its end, left by a crash in the middle
/// of a write, is cut off.
pub struct JournalIndex {
    map: RwLock<BTreeMap<HashCode, IndexEntry>>,
    journal: Mutex<BufWriter<File>>,
}

impl JournalIndex {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let mut map = BTreeMap::new();
        let mut offset = 0;
        while offset < content.len() {
            let (record, next) = match varint::get_data(&content, offset) {
                Ok(r) => r,
                Err(DecodeError::Truncated { .. }) => break,
                Err(e) => return Err(corrupt(path, offset, e)),
            };
            let (hash, at) = HashCode::decode(record, 0).map_err(|e| corrupt(path, offset, e))?;
            let (entry, at) = IndexEntry::decode(record, at).map_err(|e| corrupt(path, offset, e))?;
            if at != record.len() {
                return Err(corrupt(
                    path,
                    offset,
                    DecodeError::TrailingData {
                        offset: at,
                        extra: record.len() - at,
                    },
                ));
            }
            map.entry(hash).or_insert(entry);
            offset = next;
        }

        if offset < content.len() {
            warn!(
                "Discarding {} bytes of a torn record at the end of the index journal {:?}.",
                content.len() - offset,
                path
            );
            file.set_len(offset as u64)?;
        }
        debug!("Loaded {} index entries from {:?}.", map.len(), path);

        Ok(Self {
            map: RwLock::new(map),
            journal: Mutex::new(BufWriter::new(file)),
        })
    }
}

fn corrupt(path: &Path, offset: usize, e: DecodeError) -> StoreError {
    StoreError::CorruptRecord {
        file: path.display().to_string(),
        offset: offset as u64,
        reason: e.to_string(),
    }
}

impl Index for JournalIndex {
    fn get(&self, hash: &HashCode) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self.map.read().get(hash).copied())
    }

    fn put(&self, hash: HashCode, entry: IndexEntry) -> Result<bool, StoreError> {
        let mut map = self.map.write();
        if map.contains_key(&hash) {
            return Ok(false);
        }
        let mut record = hash.encode();
        entry.encode_into(&mut record);
        let mut framed = Vec::with_capacity(record.len() + 2);
        varint::put_data(&mut framed, &record);
        self.journal.lock().write_all(&framed)?;
        map.insert(hash, entry);
        Ok(true)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut journal = self.journal.lock();
        journal.flush()?;
        Ok(journal.get_ref().sync_data()?)
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn page(&self, from: Bound<HashCode>, reverse: bool, limit: usize) -> Vec<HashCode> {
        page_of(&self.map.read(), from, reverse, limit)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(n: u64) -> IndexEntry {
        IndexEntry {
            file_id: n % 3,
            offset: n * 100,
            length: 50 + n,
        }
    }

    fn hashes(n: usize) -> Vec<HashCode> {
        let mut hashes: Vec<_> = (0..n).map(|i| HashCode::of(&i.to_le_bytes())).collect();
        hashes.sort();
        hashes
    }

    #[test]
    fn entry_encoding() {
        let entry = IndexEntry {
            file_id: 2,
            offset: 300,
            length: 5,
        };
        let mut buf = Vec::new();
        entry.encode_into(&mut buf);
        assert_eq!(buf, vec![0x02, 0x82, 0x2c, 0x05]);
        assert_eq!(IndexEntry::decode(&buf, 0).unwrap(), (entry, 4));
    }

    fn check_put_is_idempotent(index: &dyn Index) {
        let hash = HashCode::of(b"a");
        assert!(index.put(hash, entry(1)).unwrap());
        assert!(!index.put(hash, entry(2)).unwrap());
        assert_eq!(index.get(&hash).unwrap(), Some(entry(1)));
        assert!(index.contains(&hash).unwrap());
        assert!(!index.contains(&HashCode::of(b"b")).unwrap());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn put_is_idempotent() {
        check_put_is_idempotent(&MemoryIndex::default());
        let dir = tempfile::tempdir().unwrap();
        check_put_is_idempotent(&JournalIndex::open(&dir.path().join("journal")).unwrap());
    }

    #[test]
    fn ordered_iteration_crosses_pages() {
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::default());
        let all = hashes(3 * KEYS_PAGE + 7);
        for (i, hash) in all.iter().enumerate() {
            index.put(*hash, entry(i as u64)).unwrap();
        }

        assert_eq!(keys_from(index.clone(), None, false).collect::<Vec<_>>(), all);

        let start = all[KEYS_PAGE + 3];
        let tail: Vec<_> = keys_from(index.clone(), Some(start), false).collect();
        assert_eq!(tail, all[KEYS_PAGE + 3..].to_vec());

        let head: Vec<_> = keys_from(index.clone(), Some(start), true).collect();
        let mut expected = all[..=KEYS_PAGE + 3].to_vec();
        expected.reverse();
        assert_eq!(head, expected);

        assert!(keys_from(Arc::new(MemoryIndex::default()), None, true)
            .next()
            .is_none());
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let all = hashes(100);
        {
            let index = JournalIndex::open(&path).unwrap();
            for (i, hash) in all.iter().enumerate() {
                index.put(*hash, entry(i as u64)).unwrap();
            }
            index.flush().unwrap();
        }

        let index = JournalIndex::open(&path).unwrap();
        assert_eq!(index.len(), 100);
        for (i, hash) in all.iter().enumerate() {
            assert_eq!(index.get(hash).unwrap(), Some(entry(i as u64)));
        }
    }

    #[test]
    fn journal_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let index = JournalIndex::open(&path).unwrap();
            index.put(HashCode::of(b"kept"), entry(1)).unwrap();
            index.flush().unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            // A record header announcing more bytes than follow.
            file.write_all(&[40, 0, 1, 2]).unwrap();
        }

        let index = JournalIndex::open(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // Later writes land after the last good record.
        index.put(HashCode::of(b"new"), entry(2)).unwrap();
        index.flush().unwrap();
        drop(index);
        assert_eq!(JournalIndex::open(&path).unwrap().len(), 2);
    }
}
