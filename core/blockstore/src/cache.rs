use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use vt_interfaces::types::{HashAlgorithm, HashCode, StoreError};
use vt_interfaces::{ConfigConsumer, Store};

use crate::config::CacheConfig;

/// A lossy in memory store holding the most recently added chunks.
///
/// The cache is a ring of the last `max_entries` additions. Adding the same chunk twice takes
/// two slots and the chunk stays until both have been overwritten. Reads do not affect what
/// gets evicted.
pub struct MemoryCache {
    name: String,
    max_entries: usize,
    inner: Mutex<Ring>,
}

#[derive(Default)]
struct Ring {
    slots: VecDeque<HashCode>,
    /// Chunk and the number of slots referring to it.
    entries: HashMap<HashCode, (usize, Bytes)>,
}

impl ConfigConsumer for MemoryCache {
    const KEY: &'static str = "cache";
    type Config = CacheConfig;
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Result<Self, StoreError> {
        if max_entries == 0 {
            return Err(StoreError::InvalidConfig(
                "the cache needs room for at least one entry".into(),
            ));
        }
        Ok(Self {
            name: format!("MemoryCache({max_entries})"),
            max_entries,
            inner: Mutex::new(Ring {
                slots: VecDeque::with_capacity(max_entries),
                entries: HashMap::new(),
            }),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, StoreError> {
        Self::new(config.max_entries)
    }

    /// Number of distinct chunks held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        let hash = self.hash_algorithm().digest(&data);
        let mut guard = self.inner.lock();
        let ring = &mut *guard;
        if ring.slots.len() >= self.max_entries {
            if let Some(oldest) = ring.slots.pop_front() {
                let evict = match ring.entries.get_mut(&oldest) {
                    Some((count, _)) => {
                        *count -= 1;
                        *count == 0
                    },
                    None => false,
                };
                if evict {
                    ring.entries.remove(&oldest);
                }
            }
        }
        ring.entries.entry(hash).or_insert((0, data)).0 += 1;
        ring.slots.push_back(hash);
        Ok(hash)
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        self.inner
            .lock()
            .entries
            .get(hash)
            .map(|(_, data)| data.clone())
            .ok_or(StoreError::MissingHash(*hash))
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        Ok(self.inner.lock().entries.contains_key(hash))
    }

    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        let keys: Vec<HashCode> = self.inner.lock().entries.keys().copied().collect();
        Ok(stream::iter(keys).boxed())
    }
}

enum BackendOp {
    Add(Bytes),
    Flush(oneshot::Sender<()>),
}

/// A store in front of a slow backend.
///
/// Reads are served from the cache when possible. Writes go to the cache right away and are
/// queued for the backend, which receives them in order from a background task. The cache is
/// expected to be lossy, until a [`Store::flush`] returns a chunk may exist in the cache only.
pub struct CacheStore {
    name: String,
    backend: Arc<dyn Store>,
    cache: Arc<dyn Store>,
    queue: Mutex<Option<mpsc::UnboundedSender<BackendOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicU64>,
}

impl CacheStore {
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn Store>, cache: Arc<dyn Store>) -> Self {
        let name = format!("CacheStore(backend={},cache={})", backend.name(), cache.name());
        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_backend_writer(backend.clone(), rx, failures.clone()));
        Self {
            name,
            backend,
            cache,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            failures,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Store> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<dyn Store> {
        &self.cache
    }

    /// Number of queued backend writes which failed. Failed chunks only live in the cache.
    pub fn backend_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn queue(&self) -> Result<mpsc::UnboundedSender<BackendOp>, StoreError> {
        self.queue.lock().clone().ok_or(StoreError::Closed)
    }
}

async fn run_backend_writer(
    backend: Arc<dyn Store>,
    mut rx: mpsc::UnboundedReceiver<BackendOp>,
    failures: Arc<AtomicU64>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            BackendOp::Add(data) => {
                if let Err(e) = backend.add(data).await {
                    error!("Background add to {} failed: {e}", backend.name());
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            },
            BackendOp::Flush(ack) => {
                let _ = ack.send(());
            },
        }
    }
    debug!("Backend writer for {} stopped.", backend.name());
}

#[async_trait]
impl Store for CacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.backend.hash_algorithm()
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        let queue = self.queue()?;
        let hash = self.cache.add(data.clone()).await?;
        queue
            .send(BackendOp::Add(data))
            .map_err(|_| StoreError::Closed)?;
        Ok(hash)
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        match self.cache.try_get(hash).await? {
            Some(data) => Ok(data),
            None => self.backend.get(hash).await,
        }
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        if self.cache.contains(hash).await? {
            return Ok(true);
        }
        self.backend.contains(hash).await
    }

    /// The cached hashes, then the backend hashes which were not in the cache.
    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        let cached: Vec<HashCode> = self.cache.keys().await?.collect().await;
        let seen: HashSet<HashCode> = cached.iter().copied().collect();
        let backend = self
            .backend
            .keys()
            .await?
            .filter(move |h| future::ready(!seen.contains(h)));
        Ok(stream::iter(cached).chain(backend).boxed())
    }

    /// Wait for every queued backend write, then flush both stores.
    async fn flush(&self) -> Result<(), StoreError> {
        let (ack, done) = oneshot::channel();
        self.queue()?
            .send(BackendOp::Flush(ack))
            .map_err(|_| StoreError::Closed)?;
        done.await
            .map_err(|_| StoreError::Task("the backend writer is gone".into()))?;
        future::try_join(self.cache.flush(), self.backend.flush()).await?;
        Ok(())
    }

    /// Drain the queue and close both stores. Both are closed even when draining failed, the
    /// first error is returned.
    async fn close(&self) -> Result<(), StoreError> {
        let Some(queue) = self.queue.lock().take() else {
            return Ok(());
        };
        drop(queue);
        let worker = self.worker.lock().take();
        let drained = match worker {
            Some(worker) => worker.await.map_err(|e| {
                error!("Backend writer for {} failed: {e}", self.name);
                StoreError::Task(e.to_string())
            }),
            None => Ok(()),
        };
        let cache = self.cache.close().await;
        let backend = self.backend.close().await;
        drained.and(cache).and(backend)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::MemoryStore;

    fn chunk(i: usize) -> Bytes {
        Bytes::from(format!("chunk {i}"))
    }

    #[tokio::test]
    async fn memory_cache_evicts_oldest_first() {
        let cache = MemoryCache::new(3).unwrap();
        let mut hashes = Vec::new();
        for i in 0..3 {
            hashes.push(cache.add(chunk(i)).await.unwrap());
        }
        // Reading does not save the oldest entry.
        assert_eq!(cache.get(&hashes[0]).await.unwrap(), chunk(0));

        let h3 = cache.add(chunk(3)).await.unwrap();
        assert!(!cache.contains(&hashes[0]).await.unwrap());
        assert!(matches!(
            cache.get(&hashes[0]).await,
            Err(StoreError::MissingHash(_))
        ));
        for h in [&hashes[1], &hashes[2], &h3] {
            assert!(cache.contains(h).await.unwrap());
        }
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn memory_cache_counts_repeated_adds() {
        let cache = MemoryCache::new(2).unwrap();
        let a = cache.add(chunk(0)).await.unwrap();
        cache.add(chunk(0)).await.unwrap();
        assert_eq!(cache.len(), 1);

        // The first slot of `a` goes, the second one keeps it alive.
        let b = cache.add(chunk(1)).await.unwrap();
        assert!(cache.contains(&a).await.unwrap());
        // Now the second one goes as well.
        cache.add(chunk(2)).await.unwrap();
        assert!(!cache.contains(&a).await.unwrap());
        assert!(cache.contains(&b).await.unwrap());
    }

    #[test]
    fn memory_cache_needs_room() {
        assert!(matches!(
            MemoryCache::new(0),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(MemoryCache::from_config(&CacheConfig::default()).is_ok());
    }

    /// A backend which is slow to accept writes.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl Store for SlowStore {
        fn name(&self) -> &str {
            "slow"
        }

        async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.add(data).await
        }

        async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
            self.inner.get(hash).await
        }

        async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
            self.inner.contains(hash).await
        }

        async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn reads_see_writes_before_the_backend_does() {
        // Given: a cache in front of a slow backend.
        let backend = MemoryStore::new();
        let store = CacheStore::new(
            Arc::new(SlowStore {
                inner: backend.clone(),
                delay: Duration::from_millis(50),
            }),
            Arc::new(MemoryCache::new(16).unwrap()),
        );

        // When: a chunk is added.
        let data = Bytes::from_static(b"cached before stored");
        let hash = store.add(data.clone()).await.unwrap();

        // Then: it can be read back right away, and reaches the backend once flushed.
        assert_eq!(store.get(&hash).await.unwrap(), data);
        assert!(store.contains(&hash).await.unwrap());
        assert!(!backend.contains(&hash).await.unwrap());
        store.flush().await.unwrap();
        assert_eq!(backend.get(&hash).await.unwrap(), data);
        assert_eq!(store.backend_failures(), 0);
    }

    #[tokio::test]
    async fn evicted_chunks_come_from_the_backend() {
        let backend = MemoryStore::new();
        let store = CacheStore::new(
            Arc::new(backend.clone()),
            Arc::new(MemoryCache::new(2).unwrap()),
        );
        let mut hashes = Vec::new();
        for i in 0..10 {
            hashes.push(store.add(chunk(i)).await.unwrap());
        }
        store.flush().await.unwrap();

        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(store.get(hash).await.unwrap(), chunk(i));
        }

        let keys: Vec<HashCode> = store.keys().await.unwrap().collect().await;
        assert_eq!(keys.len(), 10);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 10);
        // The cached ones come first.
        assert!(keys[..2].contains(&hashes[9]));
    }

    #[tokio::test]
    async fn close_drains_the_queue() {
        let backend = MemoryStore::new();
        let store = CacheStore::new(
            Arc::new(SlowStore {
                inner: backend.clone(),
                delay: Duration::from_millis(5),
            }),
            Arc::new(MemoryCache::new(4).unwrap()),
        );
        for i in 0..8 {
            store.add(chunk(i)).await.unwrap();
        }
        store.close().await.unwrap();
        assert_eq!(backend.len(), 8);

        store.close().await.unwrap();
        assert!(matches!(
            store.add(chunk(0)).await,
            Err(StoreError::Closed)
        ));
    }

    /// Records whether it was closed, and panics on every add when `broken`.
    #[derive(Default)]
    struct Tracked {
        inner: MemoryStore,
        broken: bool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Store for Tracked {
        fn name(&self) -> &str {
            "tracked"
        }

        async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
            if self.broken {
                panic!("backend blew up");
            }
            self.inner.add(data).await
        }

        async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
            self.inner.get(hash).await
        }

        async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
            self.inner.contains(hash).await
        }

        async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
            self.inner.keys().await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_releases_both_stores_after_a_failed_drain() {
        // Given: a backend whose writer task dies on the first queued add.
        let backend = Arc::new(Tracked {
            broken: true,
            ..Default::default()
        });
        let cache = Arc::new(Tracked::default());
        let store = CacheStore::new(backend.clone(), cache.clone());
        store.add(chunk(0)).await.unwrap();

        // When: the store is closed.
        let result = store.close().await;

        // Then: the failure is reported, and both stores were closed anyway.
        assert!(matches!(result, Err(StoreError::Task(_))));
        assert!(cache.closed.load(Ordering::SeqCst));
        assert!(backend.closed.load(Ordering::SeqCst));
    }
}
