use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vt_interfaces::types::{StoreError, DEFAULT_ROLLOVER};
use vt_utils::config::VT_HOME_DIR;

use crate::index::IndexKind;

/// Name of the directory, below the root, holding the data files unless configured otherwise.
pub const DATA_DIR: &str = "data";
/// Smallest accepted rollover size.
pub const MIN_ROLLOVER: u64 = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the index and the state file.
    pub root: PathBuf,
    /// Directory holding the data files, `<root>/data` when unset. Several stores may share
    /// one data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// A data file stops receiving records once it has reached this size.
    pub rollover: u64,
    pub index: IndexKind,
    /// Compress records when that saves space.
    pub compression: bool,
    /// The index is made durable every this many new entries.
    pub index_flush_rate: usize,
    /// How many data files are kept open for reading.
    pub open_files: usize,
    /// When set, the data directory is polled for data files written by other stores.
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub monitor_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: VT_HOME_DIR.join("store"),
            data_dir: None,
            rollover: DEFAULT_ROLLOVER,
            index: IndexKind::default(),
            compression: true,
            index_flush_rate: 16384,
            open_files: 4,
            monitor_interval: None,
        }
    }
}

impl Config {
    /// A configuration rooted at `root` with every other value at its default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.root.join(DATA_DIR))
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.rollover < MIN_ROLLOVER {
            return Err(StoreError::InvalidConfig(format!(
                "rollover must be at least {MIN_ROLLOVER}, got {}",
                self.rollover
            )));
        }
        if self.open_files == 0 {
            return Err(StoreError::InvalidConfig(
                "open_files must be at least 1".into(),
            ));
        }
        if self.index_flush_rate == 0 {
            return Err(StoreError::InvalidConfig(
                "index_flush_rate must be at least 1".into(),
            ));
        }
        if matches!(self.monitor_interval, Some(d) if d.is_zero()) {
            return Err(StoreError::InvalidConfig(
                "monitor_interval must not be zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of chunks kept by the memory cache.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1024 }
    }
}
