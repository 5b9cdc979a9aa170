//! Append only data files.
//!
//! A data file is a plain sequence of records, each `BS(flags) + BS(len) + payload`. Flag
//! `0x01` marks a zlib compressed payload, so compressed and raw records can sit side by side
//! in one file. Records are never rewritten, a file only ever grows at its end.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::warn;
use vt_interfaces::types::{varint, DecodeError, StoreError};

pub const F_COMPRESSED: u64 = 0x01;
const F_KNOWN: u64 = F_COMPRESSED;

/// Payloads shorter than this are never compressed.
const COMPRESS_MIN_LEN: usize = 16;

/// Most a scan reserves up front for one payload, the rest grows with what is actually read.
const SCAN_PREALLOC: u64 = 64 * 1024;

/// Encode `data` as a record, compressed if that saves at least a tenth of its size.
pub fn encode_record(data: &[u8], compress: bool) -> Vec<u8> {
    let mut flags = 0;
    let mut compressed = None;
    if compress && data.len() >= COMPRESS_MIN_LEN {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        // Writes into a Vec do not fail.
        if encoder.write_all(data).is_ok() {
            if let Ok(z) = encoder.finish() {
                if z.len() * 10 < data.len() * 9 {
                    flags |= F_COMPRESSED;
                    compressed = Some(z);
                }
            }
        }
    }
    let payload = compressed.as_deref().unwrap_or(data);
    let mut record = Vec::with_capacity(payload.len() + 2 * varint::MAX_ENCODED_LEN);
    varint::put_uint(&mut record, flags);
    varint::put_data(&mut record, payload);
    record
}

/// Decode the record at the start of `bs`. Returns the uncompressed payload and the length of
/// the record.
pub fn decode_record(bs: &[u8]) -> Result<(Bytes, usize), DecodeError> {
    let (flags, offset) = varint::get_uint(bs, 0)?;
    if flags & !F_KNOWN != 0 {
        return Err(DecodeError::UnknownFlags(flags & !F_KNOWN));
    }
    let (payload, end) = varint::get_data(bs, offset)?;
    let data = if flags & F_COMPRESSED != 0 {
        inflate(payload)?
    } else {
        Bytes::copy_from_slice(payload)
    };
    Ok((data, end))
}

fn inflate(payload: &[u8]) -> Result<Bytes, DecodeError> {
    let mut data = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut data)
        .map_err(|e| DecodeError::Malformed(format!("bad zlib payload: {e}")))?;
    Ok(data.into())
}

/// An open data file.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
}

impl DataFile {
    /// Open the file at `path` for reading and appending, creating it when missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Open an existing file for reading only.
    pub fn open_readonly(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current size of the file, including bytes appended by other processes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Append an encoded record and return the offset it was written at. Callers must
    /// serialize appends to the same file.
    ///
    /// A failed append is cut off again so the file still ends on a record boundary.
    pub fn append(&self, record: &[u8]) -> io::Result<u64> {
        let offset = self.len()?;
        if let Err(e) = (&self.file).write_all(record) {
            if let Err(trunc) = self.file.set_len(offset) {
                warn!("Could not cut a failed append off {:?}: {trunc}", self.path);
            }
            return Err(e);
        }
        Ok(offset)
    }

    /// Read the record of `length` bytes at `offset` and return its payload.
    pub fn fetch(&self, offset: u64, length: u64) -> Result<Bytes, StoreError> {
        let size = self.len()?;
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(self.corrupt(
                offset,
                format!("record of {length} bytes runs past the end of the file ({size} bytes)"),
            ));
        }
        let mut buf = vec![0u8; length as usize];
        self.file.read_exact_at(&mut buf, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                self.corrupt(offset, format!("short read, expected {length} bytes"))
            } else {
                StoreError::Io(e)
            }
        })?;
        let (data, consumed) =
            decode_record(&buf).map_err(|e| self.corrupt(offset, e.to_string()))?;
        if consumed as u64 != length {
            return Err(self.corrupt(
                offset,
                format!("record is {consumed} bytes, the index says {length}"),
            ));
        }
        Ok(data)
    }

    /// Iterate over the records starting at `offset`, which must be a record boundary.
    ///
    /// The scanner reads through its own handle, so several scans of one file do not disturb
    /// each other.
    pub fn scan_from(&self, offset: u64) -> io::Result<RecordScanner> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(RecordScanner {
            path: self.path.clone(),
            reader: BufReader::new(file),
            offset,
            done: false,
        })
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn corrupt(&self, offset: u64, reason: String) -> StoreError {
        StoreError::CorruptRecord {
            file: self.path.display().to_string(),
            offset,
            reason,
        }
    }
}

/// A record read back by [`DataFile::scan_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    pub offset: u64,
    pub length: u64,
    pub data: Bytes,
}

/// Sequential reader over the records of a data file.
///
/// An incomplete record at the end of the file, left behind by an interrupted append or still
/// being written by another process, ends the scan. [`RecordScanner::offset`] then points at
/// its start.
pub struct RecordScanner {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    done: bool,
}

impl RecordScanner {
    /// Offset just past the last complete record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_record(&mut self) -> Result<Option<ScannedRecord>, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            file: self.path.display().to_string(),
            offset: self.offset,
            reason,
        };
        let Some((flags, flags_len)) = varint::read_uint(&mut self.reader)? else {
            return Ok(None);
        };
        if flags & !F_KNOWN != 0 {
            return Err(corrupt(DecodeError::UnknownFlags(flags & !F_KNOWN).to_string()));
        }
        let Some((len, len_len)) = varint::read_uint(&mut self.reader)? else {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        };
        // The length comes from the file, only trust it as far as there are bytes to back it.
        let mut payload = Vec::with_capacity(len.min(SCAN_PREALLOC) as usize);
        (&mut self.reader).take(len).read_to_end(&mut payload)?;
        if (payload.len() as u64) < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let data = if flags & F_COMPRESSED != 0 {
            inflate(&payload).map_err(|e| corrupt(e.to_string()))?
        } else {
            payload.into()
        };
        let record = ScannedRecord {
            offset: self.offset,
            length: (flags_len + len_len) as u64 + len,
            data,
        };
        self.offset += record.length;
        Ok(Some(record))
    }
}

impl Iterator for RecordScanner {
    type Item = Result<ScannedRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    "Incomplete record at offset {} of {:?}, stopping the scan there.",
                    self.offset, self.path
                );
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
