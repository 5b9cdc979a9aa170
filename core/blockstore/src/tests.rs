use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;
use vt_interfaces::types::{varint, HashCode, StoreError};
use vt_interfaces::Store;
use vt_utils::config::TomlConfigProvider;

use crate::{
    blockify_bytes,
    encode_record,
    CacheStore,
    Config,
    DataDir,
    DataFile,
    IndexKind,
    MemoryCache,
    DATA_SUFFIX,
    INDEX_FILE,
    MAX_SUBBLOCKS,
};

fn chunk(i: usize) -> Bytes {
    Bytes::from(format!("block {i} {}", "x".repeat(i % 50)))
}

fn random_chunk(rng: &mut SmallRng, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data.into()
}

fn data_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(DATA_SUFFIX))
        .collect();
    files.sort();
    files
}

fn data_size(dir: &Path) -> u64 {
    data_files(dir)
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum()
}

async fn collect_keys(store: &DataDir) -> Vec<HashCode> {
    store.keys().await.unwrap().collect().await
}

/// Copy a store's files the way a crash would leave them, without the lock file.
fn copy_store(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for dirent in fs::read_dir(from).unwrap() {
        let path = dirent.unwrap().path();
        let target = to.join(path.file_name().unwrap());
        if path.is_dir() {
            copy_store(&path, &target);
        } else if !path.to_string_lossy().ends_with(".lock") {
            fs::copy(&path, &target).unwrap();
        }
    }
}

async fn open(root: &Path) -> DataDir {
    DataDir::open(Config::with_root(root)).await.unwrap()
}

#[tokio::test]
async fn add_and_get() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;

    let hash = store.add(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(hash, HashCode::of(b"hello"));
    assert!(store.contains(&hash).await.unwrap());
    assert_eq!(store.get(&hash).await.unwrap(), Bytes::from_static(b"hello"));

    // The empty chunk is a chunk like any other.
    let empty = store.add(Bytes::new()).await.unwrap();
    assert_eq!(empty, HashCode::of(b""));
    assert!(store.get(&empty).await.unwrap().is_empty());

    let missing = HashCode::of(b"never stored");
    assert!(!store.contains(&missing).await.unwrap());
    assert!(matches!(
        store.get(&missing).await,
        Err(StoreError::MissingHash(h)) if h == missing
    ));
    assert_eq!(store.try_get(&missing).await.unwrap(), None);

    store.close().await.unwrap();
    // Closing twice is harmless, using a closed store is not.
    store.close().await.unwrap();
    assert!(matches!(store.get(&hash).await, Err(StoreError::Closed)));
    assert!(matches!(
        store.add(Bytes::from_static(b"late")).await,
        Err(StoreError::Closed)
    ));
}

#[tokio::test]
async fn compressible_data_is_stored_compressed() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;

    let zeros = Bytes::from(vec![0u8; 1_000_000]);
    let hash = store.add(zeros.clone()).await.unwrap();
    store.flush().await.unwrap();

    assert!(data_size(store.data_dir()) < 10_000);
    assert_eq!(store.get(&hash).await.unwrap(), zeros);
    store.close().await.unwrap();
}

#[tokio::test]
async fn duplicates_are_stored_once() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.compression = false;
    let store = DataDir::open(config).await.unwrap();

    let data = Bytes::from_static(b"the same bytes every time");
    let first = store.add(data.clone()).await.unwrap();
    let size = data_size(store.data_dir());
    assert_eq!(size, encode_record(&data, false).len() as u64);

    // Still unindexed or already indexed, a duplicate never grows the data file.
    let second = store.add(data.clone()).await.unwrap();
    store.flush().await.unwrap();
    let third = store.add(data.clone()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(data_size(store.data_dir()), size);
    store.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_adds_of_the_same_data() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(dir.path()).await);
    let data = Bytes::from(vec![42u8; 3000]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let data = data.clone();
            tokio::spawn(async move { store.add(data).await.unwrap() })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), HashCode::of(&data));
    }

    store.flush().await.unwrap();
    assert_eq!(
        data_size(store.data_dir()),
        encode_record(&data, true).len() as u64
    );
    assert_eq!(collect_keys(&store).await, vec![HashCode::of(&data)]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn contents_survive_a_reopen() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    let mut hashes = BTreeSet::new();
    for i in 0..100 {
        hashes.insert(store.add(chunk(i)).await.unwrap());
    }
    store.close().await.unwrap();

    let store = open(dir.path()).await;
    for i in 0..100 {
        assert_eq!(store.get(&HashCode::of(&chunk(i))).await.unwrap(), chunk(i));
    }
    assert_eq!(
        collect_keys(&store).await,
        hashes.into_iter().collect::<Vec<_>>()
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn a_root_can_only_be_opened_once() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;

    assert!(matches!(
        DataDir::open(Config::with_root(dir.path())).await,
        Err(StoreError::Locked(_))
    ));

    // Closing releases the lock.
    store.close().await.unwrap();
    let store = open(dir.path()).await;
    store.close().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_refused() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.rollover = 1;
    assert!(matches!(
        DataDir::open(config).await,
        Err(StoreError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn full_data_files_roll_over() {
    // Given: a store with a small rollover size.
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.rollover = 1024;
    config.compression = false;
    let store = DataDir::open(config.clone()).await.unwrap();

    // When: adding far more than a single file may hold.
    let mut rng = SmallRng::seed_from_u64(1);
    let chunks: Vec<Bytes> = (0..20).map(|_| random_chunk(&mut rng, 500)).collect();
    for c in &chunks {
        store.add(c.clone()).await.unwrap();
    }

    // Then: the records are spread over several files, none much past the rollover size.
    let files = data_files(store.data_dir());
    assert!(files.len() >= 5, "{} data files", files.len());
    for file in &files {
        assert!(fs::metadata(file).unwrap().len() < 1024 + 510);
    }
    store.close().await.unwrap();

    let store = DataDir::open(config).await.unwrap();
    for c in &chunks {
        assert_eq!(store.get(&HashCode::of(c)).await.unwrap(), *c);
    }
    store.close().await.unwrap();
}

#[tokio::test]
async fn records_missing_from_the_index_are_found_on_open() {
    let _ = tracing_subscriber::fmt::try_init();
    // Given: a data file with records the store never indexed.
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    store.add(chunk(0)).await.unwrap();
    let data_dir = store.data_dir().to_path_buf();
    store.close().await.unwrap();

    let files = data_files(&data_dir);
    assert_eq!(files.len(), 1);
    let file = DataFile::open(&files[0]).unwrap();
    for i in 1..10 {
        file.append(&encode_record(&chunk(i), true)).unwrap();
    }
    // Plus half a record, as left behind by a crash.
    let torn = encode_record(&chunk(10), false);
    file.append(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    // When: the store is opened again.
    let store = open(dir.path()).await;

    // Then: every complete record can be read.
    for i in 0..10 {
        assert_eq!(store.get(&HashCode::of(&chunk(i))).await.unwrap(), chunk(i));
    }
    assert!(!store.contains(&HashCode::of(&chunk(10))).await.unwrap());

    // New records do not land behind the torn one.
    let hash = store.add(chunk(11)).await.unwrap();
    assert_eq!(data_files(&data_dir).len(), 2);
    store.close().await.unwrap();
    let store = open(dir.path()).await;
    assert_eq!(store.get(&hash).await.unwrap(), chunk(11));
    store.close().await.unwrap();
}

#[tokio::test]
async fn a_crash_right_after_a_rollover_loses_nothing() {
    let _ = tracing_subscriber::fmt::try_init();
    // Given: a store with small data files which never checkpoints on its own.
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.rollover = 1024;
    config.compression = false;
    config.index_flush_rate = 1_000_000;
    let store = DataDir::open(config).await.unwrap();

    let mut rng = SmallRng::seed_from_u64(11);
    let chunks: Vec<Bytes> = [500, 600, 100]
        .into_iter()
        .map(|len| random_chunk(&mut rng, len))
        .collect();
    store.add(chunks[0].clone()).await.unwrap();
    store.add(chunks[1].clone()).await.unwrap();
    // Give the index worker time to take both in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The first file is full, this one starts the second and rewrites the state file.
    store.add(chunks[2].clone()).await.unwrap();
    assert_eq!(data_files(store.data_dir()).len(), 2);

    // When: the machine goes down now and the files are opened as they are.
    let crashed = TempDir::new().unwrap();
    copy_store(dir.path(), crashed.path());
    let recovered = open(crashed.path()).await;

    // Then: every chunk is still there.
    for data in &chunks {
        assert_eq!(recovered.get(&HashCode::of(data)).await.unwrap(), *data);
    }
    recovered.close().await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn absurd_record_length_does_not_take_the_store_down() {
    // Given: a data file ending in a record header that claims 2^62 bytes.
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    store.add(chunk(0)).await.unwrap();
    let data_dir = store.data_dir().to_path_buf();
    store.close().await.unwrap();

    let mut bogus = Vec::new();
    varint::put_uint(&mut bogus, 0);
    varint::put_uint(&mut bogus, 1 << 62);
    bogus.extend_from_slice(b"junk");
    DataFile::open(&data_files(&data_dir)[0])
        .unwrap()
        .append(&bogus)
        .unwrap();

    // When: the store is opened and used.
    let store = open(dir.path()).await;
    let hash = store.add(chunk(1)).await.unwrap();
    store.flush().await.unwrap();

    // Then: the good records are readable, new ones go elsewhere and a rebuild copes too.
    assert_eq!(store.get(&HashCode::of(&chunk(0))).await.unwrap(), chunk(0));
    assert_eq!(store.get(&hash).await.unwrap(), chunk(1));
    assert_eq!(data_files(&data_dir).len(), 2);
    assert_eq!(store.rebuild_index().await.unwrap(), 0);
    store.close().await.unwrap();
}

#[tokio::test]
async fn memory_index_is_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.index = IndexKind::Memory;

    let store = DataDir::open(config.clone()).await.unwrap();
    for i in 0..20 {
        store.add(chunk(i)).await.unwrap();
    }
    store.close().await.unwrap();
    assert!(!dir.path().join(INDEX_FILE).exists());

    let store = DataDir::open(config).await.unwrap();
    for i in 0..20 {
        assert_eq!(store.get(&HashCode::of(&chunk(i))).await.unwrap(), chunk(i));
    }
    assert_eq!(collect_keys(&store).await.len(), 20);
    store.close().await.unwrap();
}

#[tokio::test]
async fn rebuild_index_recovers_a_lost_index() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    for i in 0..10 {
        store.add(chunk(i)).await.unwrap();
    }
    store.close().await.unwrap();
    fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

    // The state still claims everything is indexed.
    let store = open(dir.path()).await;
    let hash = HashCode::of(&chunk(3));
    assert!(!store.contains(&hash).await.unwrap());

    assert_eq!(store.rebuild_index().await.unwrap(), 10);
    assert_eq!(store.get(&hash).await.unwrap(), chunk(3));
    // Nothing is missing any more.
    assert_eq!(store.rebuild_index().await.unwrap(), 0);
    store.close().await.unwrap();
}

#[tokio::test]
async fn stores_sharing_a_data_dir_see_each_other_after_a_rescan() {
    let dir = TempDir::new().unwrap();
    let shared = dir.path().join("shared-data");
    let config = |name: &str| Config {
        data_dir: Some(shared.clone()),
        ..Config::with_root(dir.path().join(name))
    };
    let a = DataDir::open(config("a")).await.unwrap();
    let b = DataDir::open(config("b")).await.unwrap();

    let from_a = a.add(chunk(1)).await.unwrap();
    let from_b = b.add(chunk(2)).await.unwrap();
    assert!(!b.contains(&from_a).await.unwrap());

    assert_eq!(b.rescan().await.unwrap(), 1);
    assert_eq!(b.get(&from_a).await.unwrap(), chunk(1));
    assert_eq!(a.rescan().await.unwrap(), 1);
    assert_eq!(a.get(&from_b).await.unwrap(), chunk(2));

    // Records already seen are not counted again.
    assert_eq!(b.rescan().await.unwrap(), 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(data_files(&shared).len(), 2);
}

#[tokio::test]
async fn monitor_picks_up_other_writers() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let shared = dir.path().join("shared-data");
    let writer = DataDir::open(Config {
        data_dir: Some(shared.clone()),
        ..Config::with_root(dir.path().join("writer"))
    })
    .await
    .unwrap();
    let reader = DataDir::open(Config {
        data_dir: Some(shared.clone()),
        monitor_interval: Some(Duration::from_millis(20)),
        ..Config::with_root(dir.path().join("reader"))
    })
    .await
    .unwrap();

    let hash = writer.add(chunk(7)).await.unwrap();
    let mut found = false;
    for _ in 0..200 {
        if reader.contains(&hash).await.unwrap() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(found, "the monitor never indexed the new block");
    assert_eq!(reader.get(&hash).await.unwrap(), chunk(7));

    writer.close().await.unwrap();
    reader.close().await.unwrap();
}

#[tokio::test]
async fn keys_yield_every_hash_once() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    let mut expected = BTreeSet::new();
    for i in 0..50 {
        expected.insert(store.add(chunk(i)).await.unwrap());
        if i == 25 {
            store.flush().await.unwrap();
        }
    }

    // Some of the hashes may still wait for the index here.
    let keys = collect_keys(&store).await;
    assert_eq!(keys.len(), 50);
    assert_eq!(keys.into_iter().collect::<BTreeSet<_>>(), expected);

    store.flush().await.unwrap();
    let keys = collect_keys(&store).await;
    assert_eq!(keys, expected.into_iter().collect::<Vec<_>>());
    store.close().await.unwrap();
}

#[tokio::test]
async fn hashcodes_from_walks_in_order() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path()).await;
    for i in 0..30 {
        store.add(chunk(i)).await.unwrap();
    }
    store.flush().await.unwrap();
    let all: Vec<HashCode> = store.hashcodes_from(None, false).collect();
    assert_eq!(all.len(), 30);
    assert!(all.windows(2).all(|w| w[0] < w[1]));

    let from: Vec<HashCode> = store.hashcodes_from(Some(all[10]), false).collect();
    assert_eq!(from, all[10..]);

    let backwards: Vec<HashCode> = store.hashcodes_from(Some(all[10]), true).collect();
    let mut expected = all[..=10].to_vec();
    expected.reverse();
    assert_eq!(backwards, expected);
    store.close().await.unwrap();
}

#[tokio::test]
async fn block_trees_over_a_data_dir() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(dir.path()).await);

    // Enough random data for more than MAX_SUBBLOCKS^2 chunks.
    let mut data = vec![0u8; 3_000_000];
    SmallRng::seed_from_u64(11).fill_bytes(&mut data);
    let top = blockify_bytes(store.clone(), &data).await.unwrap();
    assert_eq!(top.span(), data.len() as u64);
    assert!(store.hashcodes_from(None, false).count() > MAX_SUBBLOCKS * MAX_SUBBLOCKS);
    store.close().await.unwrap();

    let store = open(dir.path()).await;
    assert_eq!(top.all_data(&store).await.unwrap(), data);
    assert_eq!(
        top.read_range(&store, 1_000_000, 1_000_100).await.unwrap(),
        data[1_000_000..1_000_100]
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn cache_in_front_of_a_data_dir() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(open(dir.path()).await);
    let cache = Arc::new(MemoryCache::new(4).unwrap());
    let store = CacheStore::new(backend.clone(), cache.clone());

    let hashes: Vec<HashCode> = {
        let mut hashes = Vec::new();
        for i in 0..10 {
            hashes.push(store.add(chunk(i)).await.unwrap());
        }
        hashes
    };
    assert_eq!(cache.len(), 4);

    // Once flushed, chunks evicted from the cache come from the data dir.
    store.flush().await.unwrap();
    for (i, hash) in hashes.iter().enumerate() {
        assert!(backend.contains(hash).await.unwrap());
        assert_eq!(store.get(hash).await.unwrap(), chunk(i));
    }
    store.close().await.unwrap();
    assert!(matches!(backend.get(&hashes[0]).await, Err(StoreError::Closed)));
}

#[tokio::test]
async fn init_reads_the_datadir_section() {
    let dir = TempDir::new().unwrap();
    let provider = TomlConfigProvider::new();
    let mut config = Config::with_root(dir.path());
    config.rollover = 4096;
    provider.inject::<DataDir>(config).unwrap();

    let store = DataDir::init(&provider).await.unwrap();
    assert_eq!(store.config().rollover, 4096);
    assert_eq!(store.data_dir(), dir.path().join("data"));
    store.add(chunk(0)).await.unwrap();
    store.close().await.unwrap();
}
