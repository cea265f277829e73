use std::sync::Arc;

use keystash_core::{codec, SharedBackend, StorageError, StorageKey};
use serde::{de::DeserializeOwned, Serialize};
use tracing::instrument;

use crate::{
    cell::{ObservableCell, Storable, ValueStream},
    key_def::KeyDefinition,
    registry::ObservationRegistry,
};

/// Entry point for typed reads, writes and shared observations.
///
/// Each facade owns (or shares) one [`ObservationRegistry`]; clones share it.
#[derive(Debug, Clone, Default)]
pub struct StorageFacade {
    registry: Arc<ObservationRegistry>,
}

impl StorageFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<ObservationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ObservationRegistry {
        &self.registry
    }

    /// One-shot get and decode; no observation is created.
    #[instrument(skip_all, fields(key = %key, backend = backend.name()))]
    pub async fn read<T: DeserializeOwned>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
    ) -> Result<Option<T>, StorageError> {
        backend
            .get(key)
            .await?
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// Like [`read`](Self::read), substituting `default` for a missing key.
    pub async fn read_or<T: DeserializeOwned>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
        default: T,
    ) -> Result<T, StorageError> {
        Ok(self.read(backend, key).await?.unwrap_or(default))
    }

    /// Like [`read`](Self::read), failing with `NotFound` for a missing key.
    pub async fn require<T: DeserializeOwned>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
    ) -> Result<T, StorageError> {
        self.read(backend, key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    /// Encode and persist without requiring an observation. Observers of the
    /// key learn about it through the backend's change channel.
    #[instrument(skip_all, fields(key = %key, backend = backend.name()))]
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = codec::encode(value)?;
        backend.set(key, &bytes).await
    }

    #[instrument(skip_all, fields(key = %key, backend = backend.name()))]
    pub async fn remove(&self, backend: &SharedBackend, key: &StorageKey) -> Result<(), StorageError> {
        backend.delete(key).await
    }

    /// Shared observation of `key`. All handles for the same backend and key
    /// share one cell and one backend subscription. `default` is only used
    /// when this call creates the cell.
    #[instrument(skip_all, fields(key = %key, backend = backend.name()))]
    pub async fn observe<T: Storable>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
        default: T,
    ) -> ObservationHandle<T> {
        let cell = self.registry.get_or_create(backend, key, || default);
        cell.subscribe().await;
        ObservationHandle::new(cell)
    }

    /// Observation whose default is `None`.
    pub async fn observe_optional<T: Storable>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
    ) -> ObservationHandle<Option<T>> {
        self.observe(backend, key, None).await
    }

    /// Observation of a type-level key definition.
    pub async fn observe_key<K: KeyDefinition>(
        &self,
        backend: &SharedBackend,
    ) -> Result<ObservationHandle<K::Value>, StorageError> {
        let key = K::storage_key()?;
        Ok(self.observe(backend, &key, K::default_value()).await)
    }

    /// Read of a type-level key definition, falling back to its default.
    pub async fn read_key<K: KeyDefinition>(
        &self,
        backend: &SharedBackend,
    ) -> Result<K::Value, StorageError> {
        let key = K::storage_key()?;
        self.read_or(backend, &key, K::default_value()).await
    }

    /// Write of a type-level key definition.
    pub async fn write_key<K: KeyDefinition>(
        &self,
        backend: &SharedBackend,
        value: &K::Value,
    ) -> Result<(), StorageError> {
        let key = K::storage_key()?;
        self.write(backend, &key, value).await
    }

    /// Tears down the shared observation of `key`; open handles keep their
    /// last value but receive nothing further.
    pub fn release(&self, backend: &SharedBackend, key: &StorageKey) -> bool {
        self.registry.unregister(backend, key)
    }
}

/// A consumer's view of a shared observation.
///
/// `value()` and `error()` read the cached state without suspending.
/// The handle's stream is attached when the handle is created, so `next()`
/// yields the current value (if one is known) followed by every later value
/// in order, however late it is first polled, until `unsubscribe()`.
pub struct ObservationHandle<T: Storable> {
    cell: Arc<ObservableCell<T>>,
    stream: Option<ValueStream<T>>,
}

impl<T: Storable> ObservationHandle<T> {
    fn new(cell: Arc<ObservableCell<T>>) -> Self {
        let stream = cell.watch();
        Self {
            cell,
            stream: Some(stream),
        }
    }

    pub fn key(&self) -> &StorageKey {
        self.cell.key()
    }

    pub fn value(&self) -> T {
        self.cell.value()
    }

    pub fn error(&self) -> Option<StorageError> {
        self.cell.error()
    }

    /// Optimistic write through the shared cell.
    pub async fn update(&self, value: T) -> Result<(), StorageError> {
        self.cell.update_value(value).await
    }

    /// Next observed value; `None` after `unsubscribe` or teardown.
    pub async fn next(&mut self) -> Option<T> {
        self.stream.as_mut()?.recv().await
    }

    /// Queued value without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.stream.as_mut()?.try_recv()
    }

    /// Independent stream over the same cell.
    pub fn changes(&self) -> ValueStream<T> {
        self.cell.watch()
    }

    /// Stops delivery to this handle. Synchronous: nothing further is
    /// delivered once this returns. Other handles are unaffected.
    pub fn unsubscribe(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.unwatch();
        }
    }

    pub fn cell(&self) -> &Arc<ObservableCell<T>> {
        &self.cell
    }
}
