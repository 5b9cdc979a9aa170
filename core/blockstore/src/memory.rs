use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use vt_interfaces::types::{HashCode, StoreError};
use vt_interfaces::Store;

/// A store that keeps every chunk in a hash map. Nothing is ever evicted.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub(crate) inner: Arc<RwLock<HashMap<HashCode, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct chunks held.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        let hash = self.hash_algorithm().digest(&data);
        self.inner.write().entry(hash).or_insert(data);
        Ok(hash)
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        self.inner
            .read()
            .get(hash)
            .cloned()
            .ok_or(StoreError::MissingHash(*hash))
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        Ok(self.inner.read().contains_key(hash))
    }

    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        let keys: Vec<HashCode> = self.inner.read().keys().copied().collect();
        Ok(stream::iter(keys).boxed())
    }
}
