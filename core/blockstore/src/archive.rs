//! Archive files: an append only text log of the top blocks of saved trees.
//!
//! Each line reads `isodatetime unixtime block_hex [name]` where `block_hex` is the hex form
//! of the encoded block. Blank lines and lines starting with `#` are ignored.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use vt_interfaces::types::{DecodeError, StoreError};

use crate::block::Block;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub when: DateTime<Utc>,
    pub block: Block,
    pub name: Option<String>,
}

impl ArchiveEntry {
    pub fn new(block: Block, name: Option<&str>) -> Self {
        Self {
            when: Utc::now(),
            block,
            name: name.map(str::to_owned),
        }
    }

    /// The line for this entry, without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {}.{:06} {}",
            self.when.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.when.timestamp(),
            self.when.timestamp_subsec_micros(),
            hex::encode(self.block.encode()),
        );
        if let Some(name) = &self.name {
            line.push(' ');
            line.push_str(&unctrl(name));
        }
        line
    }

    /// Parse one line. Returns `None` for blank and comment lines.
    pub fn parse(line: &str) -> Result<Option<Self>, DecodeError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let mut fields = line.splitn(4, char::is_whitespace);
        let (Some(isodate), Some(unixtime), Some(encoded)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(DecodeError::Malformed(format!(
                "expected at least 3 fields in {line:?}"
            )));
        };
        DateTime::parse_from_rfc3339(isodate)
            .map_err(|e| DecodeError::Malformed(format!("bad date {isodate:?}: {e}")))?;
        let when = parse_unixtime(unixtime)?;
        let encoded = hex::decode(encoded).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        let block = Block::decode_exact(&encoded)?;
        let name = fields
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);
        Ok(Some(Self { when, block, name }))
    }
}

fn parse_unixtime(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    let bad = || DecodeError::Malformed(format!("bad unix time {s:?}"));
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().map_err(|_| bad())?;
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let nanos = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse::<u32>().map_err(|_| bad())?
    };
    Utc.timestamp_opt(secs, nanos).single().ok_or_else(bad)
}

/// Escape control characters so a name always stays on its line.
fn unctrl(s: &str) -> String {
    s.chars()
        .flat_map(|c| {
            if c.is_control() {
                c.escape_default().collect::<Vec<_>>()
            } else {
                vec![c]
            }
        })
        .collect()
}

/// An archive file.
#[derive(Clone, Debug)]
pub struct Archive {
    path: PathBuf,
}

impl Archive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry for `block` saved now.
    pub fn save(&self, block: &Block, name: Option<&str>) -> Result<ArchiveEntry, StoreError> {
        let entry = ArchiveEntry::new(*block, name);
        self.append(&entry)?;
        Ok(entry)
    }

    pub fn append(&self, entry: &ArchiveEntry) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_line())?;
        Ok(())
    }

    /// Every entry in file order. A missing archive has no entries.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            return Err(DecodeError::Malformed(format!(
                "{:?}: incomplete last line",
                self.path
            ))
            .into());
        }
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let entry = ArchiveEntry::parse(line).map_err(|e| {
                DecodeError::Malformed(format!("{:?}:{}: {e}", self.path, lineno + 1))
            })?;
            entries.extend(entry);
        }
        Ok(entries)
    }

    /// The most recent entry.
    pub fn last(&self) -> Result<Option<ArchiveEntry>, StoreError> {
        Ok(self.entries()?.pop())
    }
}
