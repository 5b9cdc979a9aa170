use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use vt_types::{HashAlgorithm, HashCode, StoreError};

/// A content addressed chunk store: a mapping from [`HashCode`] to the bytes that hash to it.
///
/// Every write goes through [`Store::add`], which derives the key from the data, so adding the
/// same bytes twice is not an error and yields the same hash both times. Implementations are
/// shared between tasks behind an [`Arc`] and must be safe to call concurrently.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// A short human readable description used in logs.
    fn name(&self) -> &str;

    /// The hash function used to key this store.
    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::default()
    }

    /// Store a chunk and return its hash. Chunks which are already present are not stored
    /// again.
    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError>;

    /// Fetch a chunk. Fails with [`StoreError::MissingHash`] if the hash is unknown.
    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError>;

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError>;

    /// Every hash known to the store, each exactly once, in no particular order.
    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError>;

    /// Wait for pending background work and make the current state durable.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Flush and release every resource held by the store. Calling it more than once is
    /// allowed, later calls do nothing.
    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await
    }

    /// Like [`Store::get`] but maps a missing hash to `None`.
    async fn try_get(&self, hash: &HashCode) -> Result<Option<Bytes>, StoreError> {
        match self.get(hash).await {
            Ok(data) => Ok(Some(data)),
            Err(StoreError::MissingHash(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        (**self).hash_algorithm()
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        (**self).add(data).await
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        (**self).get(hash).await
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        (**self).contains(hash).await
    }

    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        (**self).keys().await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        (**self).flush().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}
