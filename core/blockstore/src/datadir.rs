//! A store persisted as a directory of append only data files plus an index.
//!
//! Layout of the state directory (`root`):
//!
//! ```text
//! root/
//!   index-sha1-state.toml        data file table and indexing progress
//!   index-sha1-state.toml.lock   held while a store has the directory open
//!   index-sha1.journal           the hash index (journal backend)
//!   data/<uuid>.vtd              data files, unless `data_dir` points elsewhere
//! ```
//!
//! New records are appended to the current data file under the store lock and parked in an
//! in memory table of unindexed entries. A background worker moves them into the index and
//! periodically makes the index and the state file durable. Every data file records how far
//! it has been indexed, so whatever was appended but not indexed before a crash is picked up
//! again by scanning the tail of the file on the next open.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use vt_interfaces::types::{HashAlgorithm, HashCode, StoreError};
use vt_interfaces::{ConfigConsumer, ConfigProviderInterface, Store};

use crate::config::Config;
use crate::datafile::{encode_record, DataFile};
use crate::index::{keys_from, open_index, Index, IndexEntry, IndexKind, KeysFrom};

pub const STATE_FILE: &str = "index-sha1-state.toml";
pub const INDEX_FILE: &str = "index-sha1.journal";
pub const DATA_SUFFIX: &str = ".vtd";

/// How often a transient append failure is retried before the store gives up.
pub const APPEND_RETRIES: u32 = 3;

/// One data file as recorded in the state file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct FileState {
    filenum: u64,
    filename: String,
    /// Offset up to which the records of the file are in the durable index.
    indexed_to: u64,
}

/// The on disk form of the state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<u64>,
    #[serde(default)]
    files: Vec<FileState>,
}

/// Everything guarded by the store lock.
#[derive(Default)]
struct State {
    files: BTreeMap<u64, FileState>,
    /// The data file receiving new records.
    current: Option<u64>,
    writer: Option<Arc<DataFile>>,
    /// Records appended but not yet handed to the index.
    unindexed: HashMap<HashCode, IndexEntry>,
    /// How far the index worker got in each file. Only becomes `indexed_to` once the index
    /// has been flushed.
    reached: HashMap<u64, u64>,
}

impl State {
    fn next_filenum(&self) -> u64 {
        self.files.keys().next_back().map_or(0, |n| n + 1)
    }
}

enum IndexMsg {
    Entry(HashCode, IndexEntry),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// Removes the lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked(path));
            },
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove the lock file {:?}: {e}", self.path);
        }
    }
}

/// The part of the store shared with the background tasks.
struct Shared {
    config: Config,
    algorithm: HashAlgorithm,
    data_dir: PathBuf,
    state_path: PathBuf,
    index: Arc<dyn Index>,
    state: Mutex<State>,
    open_files: Mutex<LruCache<u64, Arc<DataFile>>>,
    unusable: AtomicBool,
    lock: Mutex<Option<LockFile>>,
}

impl Shared {
    fn open(config: Config) -> Result<Self, StoreError> {
        config.validate()?;
        let root = config.root.clone();
        let data_dir = config.data_dir();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&data_dir)?;

        let state_path = root.join(STATE_FILE);
        let lock = LockFile::acquire(root.join(format!("{STATE_FILE}.lock")))?;

        let mut state = State::default();
        match fs::read_to_string(&state_path) {
            Ok(content) => {
                let saved: StateFile = toml::from_str(&content).map_err(|e| {
                    StoreError::CorruptRecord {
                        file: state_path.display().to_string(),
                        offset: 0,
                        reason: e.to_string(),
                    }
                })?;
                if saved.data_dir != data_dir {
                    warn!(
                        "The state file {:?} describes data dir {:?}, using {:?}.",
                        state_path, saved.data_dir, data_dir
                    );
                }
                state.current = saved.current;
                state.files = saved.files.into_iter().map(|f| (f.filenum, f)).collect();
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        if config.index == IndexKind::Memory {
            // Nothing survives in a memory index, start over.
            for file in state.files.values_mut() {
                file.indexed_to = 0;
            }
        }

        let index = open_index(config.index, &root.join(INDEX_FILE))?;
        let open_files = NonZeroUsize::new(config.open_files)
            .ok_or_else(|| StoreError::InvalidConfig("open_files must be at least 1".into()))?;

        let shared = Self {
            algorithm: HashAlgorithm::default(),
            data_dir,
            state_path,
            index,
            state: Mutex::new(state),
            open_files: Mutex::new(LruCache::new(open_files)),
            unusable: AtomicBool::new(false),
            lock: Mutex::new(Some(lock)),
            config,
        };

        let caught_up = shared.rescan_files(true, false)?;
        if caught_up > 0 {
            info!(
                "Indexed {caught_up} blocks which were stored but not indexed in {:?}.",
                shared.data_dir
            );
        }
        debug!(
            "The index of {:?} holds {} entries.",
            shared.config.root,
            shared.index.len()
        );
        {
            let state = shared.state.lock();
            shared.save_state(&state)?;
        }
        Ok(shared)
    }

    fn save_state(&self, state: &State) -> Result<(), StoreError> {
        let saved = StateFile {
            data_dir: self.data_dir.clone(),
            current: state.current,
            files: state.files.values().cloned().collect(),
        };
        let content = toml::to_string(&saved)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.state_path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Make the current data file, the index and the state file durable.
    ///
    /// Progress is taken before the index flush, so the saved `indexed_to` offsets only
    /// cover entries that flush made durable.
    fn checkpoint(&self) -> Result<(), StoreError> {
        let (writer, reached) = {
            let state = self.state.lock();
            (state.writer.clone(), state.reached.clone())
        };
        if let Some(writer) = writer {
            writer.sync()?;
        }
        self.index.flush()?;
        let mut state = self.state.lock();
        for (filenum, offset) in reached {
            if let Some(file) = state.files.get_mut(&filenum) {
                file.indexed_to = file.indexed_to.max(offset);
            }
        }
        self.save_state(&state)
    }

    /// An open handle on data file `filenum`.
    fn datafile(&self, filenum: u64) -> Result<Arc<DataFile>, StoreError> {
        let filename = {
            let state = self.state.lock();
            if state.current == Some(filenum) {
                if let Some(writer) = &state.writer {
                    return Ok(writer.clone());
                }
            }
            match state.files.get(&filenum) {
                Some(file) => file.filename.clone(),
                None => {
                    return Err(StoreError::CorruptRecord {
                        file: format!("#{filenum}"),
                        offset: 0,
                        reason: "unknown data file number".into(),
                    });
                },
            }
        };

        let mut open_files = self.open_files.lock();
        if let Some(file) = open_files.get(&filenum) {
            return Ok(file.clone());
        }
        let file = Arc::new(DataFile::open_readonly(self.data_dir.join(&filename))?);
        trace!("Opened data file {filename}");
        open_files.put(filenum, file.clone());
        Ok(file)
    }

    /// The writer for new records, switching to a fresh data file when there is none yet or
    /// the current one has reached the rollover size.
    fn writer(&self, state: &mut State) -> Result<Arc<DataFile>, StoreError> {
        if state.writer.is_none() {
            if let Some(current) = state.current {
                if let Some(file) = state.files.get(&current) {
                    state.writer = Some(Arc::new(DataFile::open(
                        self.data_dir.join(&file.filename),
                    )?));
                }
            }
        }
        if let Some(writer) = &state.writer {
            if writer.len()? < self.config.rollover {
                return Ok(writer.clone());
            }
            info!(
                "Data file {:?} reached the rollover size of {} bytes.",
                writer.path(),
                self.config.rollover
            );
        }

        let filenum = state.next_filenum();
        let filename = format!("{}{DATA_SUFFIX}", Uuid::new_v4());
        let writer = Arc::new(DataFile::open(self.data_dir.join(&filename))?);
        info!("Switching to new data file {filename} (#{filenum}).");
        state.files.insert(
            filenum,
            FileState {
                filenum,
                filename,
                indexed_to: 0,
            },
        );
        state.current = Some(filenum);
        state.writer = Some(writer.clone());
        self.save_state(state)?;
        Ok(writer)
    }

    /// Append `record`, retrying transient failures. Any other failure makes the store
    /// unusable.
    fn append(&self, state: &mut State, record: &[u8]) -> Result<(u64, u64), StoreError> {
        let result = with_retries(|| {
            let writer = self.writer(state)?;
            Ok(writer.append(record)?)
        });
        match result {
            Ok(offset) => Ok((state.current.unwrap_or_default(), offset)),
            Err(StoreError::Io(err)) => {
                let path = state
                    .writer
                    .as_ref()
                    .map(|w| w.path().to_path_buf())
                    .unwrap_or_else(|| self.data_dir.clone());
                error!("Append to {path:?} failed, the store is unusable until reopened: {err}");
                self.unusable.store(true, Ordering::SeqCst);
                Err(StoreError::Rollover { path, source: err })
            },
            Err(e) => {
                self.unusable.store(true, Ordering::SeqCst);
                Err(e)
            },
        }
    }

    fn add(
        &self,
        data: &[u8],
        index_tx: &mpsc::UnboundedSender<IndexMsg>,
    ) -> Result<HashCode, StoreError> {
        let hash = self.algorithm.digest(data);
        if self.index.contains(&hash)? {
            return Ok(hash);
        }
        let record = encode_record(data, self.config.compression);

        let mut state = self.state.lock();
        // Somebody may have stored the same data while we were hashing.
        if state.unindexed.contains_key(&hash) || self.index.contains(&hash)? {
            return Ok(hash);
        }
        if self.unusable.load(Ordering::SeqCst) {
            return Err(StoreError::Unusable);
        }
        let (file_id, offset) = self.append(&mut state, &record)?;
        let entry = IndexEntry {
            file_id,
            offset,
            length: record.len() as u64,
        };
        state.unindexed.insert(hash, entry);
        if index_tx.send(IndexMsg::Entry(hash, entry)).is_err() {
            warn!("The index worker is gone, {hash:?} stays unindexed.");
        }
        Ok(hash)
    }

    fn lookup(&self, hash: &HashCode) -> Result<Option<IndexEntry>, StoreError> {
        // Entries are put into the index before they leave the unindexed table, so checking in
        // this order never misses one that is moving.
        if let Some(entry) = self.state.lock().unindexed.get(hash) {
            return Ok(Some(*entry));
        }
        self.index.get(hash)
    }

    fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        let entry = self
            .lookup(hash)?
            .ok_or(StoreError::MissingHash(*hash))?;
        self.datafile(entry.file_id)?
            .fetch(entry.offset, entry.length)
    }

    /// Add data files found in the data directory which are not in the state yet.
    fn discover_files(&self) -> Result<(), StoreError> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.data_dir)? {
            let name = dirent?.file_name();
            if let Some(name) = name.to_str() {
                if name.ends_with(DATA_SUFFIX) {
                    found.push(name.to_owned());
                }
            }
        }
        found.sort();

        let mut state = self.state.lock();
        let mut changed = false;
        for filename in found {
            if state.files.values().any(|f| f.filename == filename) {
                continue;
            }
            let filenum = state.next_filenum();
            info!("Found new data file {filename} (#{filenum}).");
            state.files.insert(
                filenum,
                FileState {
                    filenum,
                    filename,
                    indexed_to: 0,
                },
            );
            changed = true;
        }
        if changed {
            self.save_state(&state)?;
        }
        Ok(())
    }

    /// Index the records of data files past their `indexed_to` offset, or from their start
    /// with `from_start`. The file currently written by this store is skipped unless
    /// `include_current` is set. Returns the number of new index entries.
    fn rescan_files(&self, include_current: bool, from_start: bool) -> Result<usize, StoreError> {
        self.discover_files()?;
        let targets: Vec<FileState> = {
            let state = self.state.lock();
            state
                .files
                .values()
                .filter(|f| include_current || Some(f.filenum) != state.current)
                .cloned()
                .collect()
        };

        let mut added = 0;
        for target in targets {
            let from = if from_start { 0 } else { target.indexed_to };
            let size = match fs::metadata(self.data_dir.join(&target.filename)) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Data file {} is missing.", target.filename);
                    continue;
                },
                Err(e) => return Err(e.into()),
            };
            if size <= from {
                continue;
            }

            let file = self.datafile(target.filenum)?;
            let mut scanner = file.scan_from(from)?;
            let mut new_entries = 0;
            for record in &mut scanner {
                let record = record?;
                let hash = self.algorithm.digest(&record.data);
                let entry = IndexEntry {
                    file_id: target.filenum,
                    offset: record.offset,
                    length: record.length,
                };
                if self.index.put(hash, entry)? {
                    new_entries += 1;
                }
            }
            // The state must never claim more than the durable index holds.
            self.index.flush()?;
            debug!(
                "Scanned {} from {from} to {}, {new_entries} new entries.",
                target.filename,
                scanner.offset()
            );
            added += new_entries;

            let mut state = self.state.lock();
            if let Some(file) = state.files.get_mut(&target.filenum) {
                file.indexed_to = file.indexed_to.max(scanner.offset());
            }
            if scanner.offset() < size && state.current == Some(target.filenum) {
                warn!(
                    "Data file {} ends in an incomplete record, new records go to a fresh file.",
                    target.filename
                );
                state.current = None;
                state.writer = None;
            }
        }

        let state = self.state.lock();
        self.save_state(&state)?;
        Ok(added)
    }

    /// Merged, ordered view of the unindexed entries and the index.
    fn hashcodes_from(&self, start: Option<HashCode>, reverse: bool) -> HashcodesFrom {
        let mut pending: Vec<HashCode> = {
            let state = self.state.lock();
            state
                .unindexed
                .keys()
                .filter(|h| match &start {
                    None => true,
                    Some(s) if reverse => *h <= s,
                    Some(s) => *h >= s,
                })
                .copied()
                .collect()
        };
        pending.sort();
        if reverse {
            pending.reverse();
        }
        HashcodesFrom {
            pending: pending.into_iter().peekable(),
            indexed: keys_from(self.index.clone(), start, reverse).peekable(),
            reverse,
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run `op` again after a transient I/O failure, at most [`APPEND_RETRIES`] times, with a
/// growing pause in between.
fn with_retries<T>(mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(StoreError::Io(e)) if is_transient(&e) && attempt < APPEND_RETRIES => {
                attempt += 1;
                warn!("Append failed ({e}), retrying ({attempt}/{APPEND_RETRIES}).");
                std::thread::sleep(Duration::from_millis(10 << attempt));
            },
            result => return result,
        }
    }
}

fn run_index_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<IndexMsg>) {
    let mut pending = 0;
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            IndexMsg::Entry(hash, entry) => {
                match shared.index.put(hash, entry) {
                    Ok(_) => {
                        let mut state = shared.state.lock();
                        state.unindexed.remove(&hash);
                        let reached = state.reached.entry(entry.file_id).or_default();
                        *reached = (*reached).max(entry.offset + entry.length);
                    },
                    Err(e) => {
                        error!("Failed to index {hash:?}, the store is unusable: {e}");
                        shared.unusable.store(true, Ordering::SeqCst);
                    },
                }
                pending += 1;
                if pending >= shared.config.index_flush_rate {
                    pending = 0;
                    if let Err(e) = shared.checkpoint() {
                        error!("Index checkpoint failed: {e}");
                    }
                }
            },
            IndexMsg::Flush(ack) => {
                pending = 0;
                let _ = ack.send(shared.checkpoint());
            },
        }
    }
    if pending > 0 {
        if let Err(e) = shared.checkpoint() {
            error!("Final index checkpoint failed: {e}");
        }
    }
    debug!("Index worker for {:?} stopped.", shared.data_dir);
}

fn spawn_monitor(shared: Arc<Shared>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately, the open already scanned everything.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let shared = shared.clone();
            match tokio::task::spawn_blocking(move || shared.rescan_files(false, false)).await {
                Ok(Ok(0)) => {},
                Ok(Ok(n)) => info!("Monitor indexed {n} blocks added by other writers."),
                Ok(Err(e)) => warn!("Data directory rescan failed: {e}"),
                Err(e) => warn!("Data directory rescan task failed: {e}"),
            }
        }
    })
}

fn task_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Task(e.to_string())
}

/// A deduplicating store over a directory of data files. See the module documentation.
pub struct DataDir {
    name: String,
    shared: Arc<Shared>,
    index_tx: Mutex<Option<mpsc::UnboundedSender<IndexMsg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConfigConsumer for DataDir {
    const KEY: &'static str = "datadir";
    type Config = Config;
}

impl DataDir {
    /// Open the store described by `config`, creating its directories when needed.
    ///
    /// Fails with [`StoreError::Locked`] if another store has the same state directory open.
    pub async fn open(config: Config) -> Result<Self, StoreError> {
        let name = format!("DataDir({})", config.root.display());
        let shared = tokio::task::spawn_blocking(move || Shared::open(config))
            .await
            .map_err(task_error)??;
        let shared = Arc::new(shared);

        let (index_tx, rx) = mpsc::unbounded_channel();
        let worker = {
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || run_index_worker(shared, rx))
        };
        let monitor = shared
            .config
            .monitor_interval
            .map(|interval| spawn_monitor(shared.clone(), interval));

        info!("Opened {name}.");
        Ok(Self {
            name,
            shared,
            index_tx: Mutex::new(Some(index_tx)),
            worker: Mutex::new(Some(worker)),
            monitor: Mutex::new(monitor),
            closed: AtomicBool::new(false),
        })
    }

    /// Open the store with the `datadir` section of the configuration.
    pub async fn init<P: ConfigProviderInterface>(provider: &P) -> Result<Self, StoreError> {
        Self::open(provider.get::<Self>()).await
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Directory holding the data files.
    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Index data files written by other stores sharing the data directory. Returns the number
    /// of new index entries.
    pub async fn rescan(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.rescan_files(false, false))
            .await
            .map_err(task_error)?
    }

    /// Scan every data file from its start and index whatever the index is missing.
    pub async fn rebuild_index(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        let added = tokio::task::spawn_blocking(move || shared.rescan_files(true, true))
            .await
            .map_err(task_error)??;
        info!("Rebuilt the index of {}, {added} entries were missing.", self.name);
        Ok(added)
    }

    /// Iterate over the stored hashes in order, starting at `start` (inclusive), including the
    /// ones still waiting for the index.
    pub fn hashcodes_from(&self, start: Option<HashCode>, reverse: bool) -> HashcodesFrom {
        self.shared.hashcodes_from(start, reverse)
    }
}

#[async_trait]
impl Store for DataDir {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.shared.algorithm
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        self.ensure_open()?;
        let index_tx = self.index_tx.lock().clone().ok_or(StoreError::Closed)?;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.add(&data, &index_tx))
            .await
            .map_err(task_error)?
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        let hash = *hash;
        tokio::task::spawn_blocking(move || shared.get(&hash))
            .await
            .map_err(task_error)?
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.shared.lookup(hash)?.is_some())
    }

    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        self.ensure_open()?;
        Ok(stream::iter(self.hashcodes_from(None, false)).boxed())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let index_tx = self.index_tx.lock().clone().ok_or(StoreError::Closed)?;
        let (ack, done) = oneshot::channel();
        index_tx
            .send(IndexMsg::Flush(ack))
            .map_err(|_| StoreError::Task("the index worker is gone".into()))?;
        done.await
            .map_err(|_| StoreError::Task("the index worker is gone".into()))?
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        // Closing the queue lets the worker drain it and stop.
        drop(self.index_tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("The index worker of {} failed: {e}", self.name);
            }
        }

        let shared = self.shared.clone();
        let result = tokio::task::spawn_blocking(move || {
            let unindexed = shared.state.lock().unindexed.len();
            if unindexed > 0 {
                error!(
                    "{unindexed} stored blocks were not indexed, the next open will scan for them."
                );
            }
            let result = shared.checkpoint();
            {
                let mut state = shared.state.lock();
                state.writer = None;
            }
            shared.open_files.lock().clear();
            shared.lock.lock().take();
            result
        })
        .await
        .map_err(task_error)?;

        info!("Closed {}.", self.name);
        result
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
        if !self.closed.load(Ordering::SeqCst) {
            warn!("{} dropped without being closed.", self.name);
        }
    }
}

/// Ordered merge of the unindexed hashes and the index, see [`DataDir::hashcodes_from`].
pub struct HashcodesFrom {
    pending: std::iter::Peekable<std::vec::IntoIter<HashCode>>,
    indexed: std::iter::Peekable<KeysFrom>,
    reverse: bool,
}

impl Iterator for HashcodesFrom {
    type Item = HashCode;

    fn next(&mut self) -> Option<HashCode> {
        let order = match (self.pending.peek(), self.indexed.peek()) {
            (None, None) => return None,
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (Some(p), Some(i)) if self.reverse => i.cmp(p),
            (Some(p), Some(i)) => p.cmp(i),
        };
        match order {
            CmpOrdering::Less => self.pending.next(),
            CmpOrdering::Greater => self.indexed.next(),
            CmpOrdering::Equal => {
                // Indexed while we were iterating.
                self.indexed.next();
                self.pending.next()
            },
        }
    }
}
