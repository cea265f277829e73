use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tracing::instrument;

use super::backend::{Backend, Snapshot};
use crate::{channel::ChangeChannel, error::StorageError, key::StorageKey};

/// Process-memory backend. Contents are lost on restart.
///
/// Values are masked so plaintext does not sit in the map verbatim; this is
/// not encryption. Clones share the same map and change channel.
#[derive(Debug, Default, Clone)]
pub struct VolatileBackend {
    inner: Arc<Mutex<HashMap<StorageKey, Vec<u8>>>>,
    changes: ChangeChannel,
}

impl VolatileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<StorageKey, Vec<u8>>>, StorageError> {
        self.inner.lock().map_err(|err| StorageError::Io {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl Backend for VolatileBackend {
    fn name(&self) -> &'static str {
        "volatile"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.lock()?;
        Ok(map.get(key).map(|masked| unmask(masked)))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError> {
        let mut map = self.lock()?;
        map.insert(key.clone(), mask(value));
        self.changes.publish(key, Some(value.to_vec()));
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let mut map = self.lock()?;
        if map.remove(key).is_some() {
            self.changes.publish(key, None);
        }
        Ok(())
    }

    fn changes(&self) -> Option<&ChangeChannel> {
        Some(&self.changes)
    }

    async fn snapshot(&self, key: &StorageKey) -> Result<Snapshot, StorageError> {
        let map = self.lock()?;
        Ok(Snapshot {
            bytes: map.get(key).map(|masked| unmask(masked)),
            sequence: self.changes.sequence(),
        })
    }
}

const MASK_BYTE: u8 = 0xA5;

fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

fn unmask(input: &[u8]) -> Vec<u8> {
    mask(input) // XOR twice restores original.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(name).unwrap()
    }

    #[tokio::test]
    async fn round_trip_masks_and_unmasks() {
        let store = VolatileBackend::new();
        let key = key("agent/session");
        let secret = b"top-secret-payload";

        store.set(&key, secret).await.expect("set should succeed");
        let retrieved = store.get(&key).await.expect("get should succeed");

        assert_eq!(retrieved.as_deref(), Some(&secret[..]));
        // Ensure we are not storing plaintext.
        let inner = store.inner.lock().expect("lock");
        assert_ne!(inner.get(&key).unwrap(), &secret.to_vec());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = VolatileBackend::new();
        assert_eq!(store.get(&key("absent")).await.expect("get"), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_data() {
        let store = VolatileBackend::new();
        store.set(&key("k"), b"v").await.expect("set should succeed");
        store.delete(&key("k")).await.expect("delete should succeed");
        store
            .delete(&key("k"))
            .await
            .expect("delete again should still succeed");

        assert_eq!(store.get(&key("k")).await.expect("get"), None);
        assert!(store.is_empty().expect("lock"));
    }

    #[tokio::test]
    async fn writes_and_deletes_are_published() {
        let store = VolatileBackend::new();
        let mut sub = store.changes().expect("observable").subscribe(&key("k"));

        store.set(&key("k"), b"v1").await.unwrap();
        store.delete(&key("k")).await.unwrap();
        // Deleting an absent key publishes nothing.
        store.delete(&key("k")).await.unwrap();

        let first = sub.try_recv().expect("set event");
        assert_eq!(first.payload.as_deref(), Some(&b"v1"[..]));
        let second = sub.try_recv().expect("delete event");
        assert_eq!(second.payload, None);
        assert!(second.sequence > first.sequence);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn clones_share_storage_and_channel() {
        let store = VolatileBackend::new();
        let clone = store.clone();
        let mut sub = clone.changes().unwrap().subscribe(&key("k"));

        store.set(&key("k"), b"shared").await.unwrap();

        assert_eq!(
            clone.get(&key("k")).await.unwrap().as_deref(),
            Some(&b"shared"[..])
        );
        assert!(sub.try_recv().is_some());
    }

    #[test]
    fn poisoned_lock_is_reported_by_len() {
        let store = VolatileBackend::new();
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().expect("lock");
            panic!("poison the map");
        })
        .join();

        assert!(matches!(store.len(), Err(StorageError::Io { .. })));
        assert!(matches!(store.is_empty(), Err(StorageError::Io { .. })));
    }

    #[tokio::test]
    async fn snapshot_reports_latest_sequence() {
        let store = VolatileBackend::new();
        store.set(&key("k"), b"1").await.unwrap();
        store.set(&key("other"), b"2").await.unwrap();

        let snapshot = store.snapshot(&key("k")).await.unwrap();
        assert_eq!(snapshot.bytes.as_deref(), Some(&b"1"[..]));
        assert_eq!(snapshot.sequence, 2);
    }
}
