use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use keystash_core::{Backend, ChangeChannel, Snapshot, StorageError, StorageKey};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    atomic::{read_optional, remove_optional, write_atomic},
    key_provider::{KeyMaterial, KeyProvider},
};

/// AES-GCM encrypted backend: one file per key under `root`, with the data
/// key held by a `KeyProvider` (OS keyring in production).
pub struct SecureBackend<P: KeyProvider> {
    root: PathBuf,
    key_provider: P,
    write_lock: Mutex<()>,
    changes: ChangeChannel,
}

impl<P: KeyProvider> SecureBackend<P> {
    pub fn new(root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            root: root.into(),
            key_provider,
            write_lock: Mutex::new(()),
            changes: ChangeChannel::new(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock.lock().map_err(|err| StorageError::Io {
            reason: format!("lock poisoned: {err}"),
        })
    }

    async fn cipher(&self) -> Result<Aes256Gcm, StorageError> {
        let material = self.key_provider.get_or_create().await?;
        build_cipher(&material)
    }

    async fn open(&self, raw: Option<Vec<u8>>) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let blob: StoredBlob = serde_json::from_slice(&raw).map_err(|e| StorageError::Io {
            reason: format!("corrupt blob: {e}"),
        })?;
        let cipher = self.cipher().await?;
        decrypt_blob(&cipher, blob).map(Some)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    nonce: String,
    ciphertext: String,
}

#[async_trait]
impl<P: KeyProvider> Backend for SecureBackend<P> {
    fn name(&self) -> &'static str {
        "secure"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let raw = {
            let _guard = self.lock()?;
            read_optional(&self.path_for(key))?
        };
        self.open(raw).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError> {
        let cipher = self.cipher().await?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, value)
            .map_err(|e| StorageError::Io {
                reason: format!("encrypt failed: {e}"),
            })?;

        let blob = StoredBlob {
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        let json = serde_json::to_vec(&blob).map_err(StorageError::io)?;

        let _guard = self.lock()?;
        write_atomic(&self.path_for(key), &json)?;
        self.changes.publish(key, Some(value.to_vec()));
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let _guard = self.lock()?;
        if remove_optional(&self.path_for(key))? {
            self.changes.publish(key, None);
        }
        Ok(())
    }

    fn changes(&self) -> Option<&ChangeChannel> {
        Some(&self.changes)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn snapshot(&self, key: &StorageKey) -> Result<Snapshot, StorageError> {
        let (raw, sequence) = {
            let _guard = self.lock()?;
            (read_optional(&self.path_for(key))?, self.changes.sequence())
        };
        let bytes = self.open(raw).await?;
        Ok(Snapshot { bytes, sequence })
    }
}

fn decrypt_blob(cipher: &Aes256Gcm, blob: StoredBlob) -> Result<Vec<u8>, StorageError> {
    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(blob.nonce)
        .map_err(|e| StorageError::Io {
            reason: format!("nonce decode failed: {e}"),
        })?;
    if nonce_bytes.len() != 12 {
        return Err(StorageError::Io {
            reason: format!("nonce must be 12 bytes, got {}", nonce_bytes.len()),
        });
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = URL_SAFE_NO_PAD
        .decode(blob.ciphertext)
        .map_err(|e| StorageError::Io {
            reason: format!("ciphertext decode failed: {e}"),
        })?;

    cipher.decrypt(nonce, ciphertext.as_ref()).map_err(|e| {
        warn!("decrypt failed; data key does not match stored entry");
        StorageError::AccessDenied {
            reason: format!("decrypt failed: {e}"),
        }
    })
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, StorageError> {
    Aes256Gcm::new_from_slice(&material.bytes).map_err(|e| StorageError::AccessDenied {
        reason: format!("cipher init failed: {e}"),
    })
}

fn sanitize_key(key: &StorageKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(name).unwrap()
    }

    #[tokio::test]
    async fn round_trip_encrypts_and_decrypts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SecureBackend::new(dir.path(), InMemoryKeyProvider::default());

        let key = key("workspace/session");
        let value = b"hello-keystash";

        store.set(&key, value).await.expect("set");
        let decrypted = store.get(&key).await.expect("get");
        assert_eq!(decrypted.as_deref(), Some(&value[..]));

        // ensure plaintext is not present on disk
        let stored = std::fs::read_to_string(store.path_for(&key)).expect("read ciphertext");
        assert!(
            !stored.contains("hello-keystash"),
            "plaintext must not be stored"
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SecureBackend::new(dir.path(), InMemoryKeyProvider::default());
        let key = key("k");
        store.set(&key, b"v").await.expect("set");
        store.delete(&key).await.expect("delete");
        store.delete(&key).await.expect("delete again");

        assert_eq!(store.get(&key).await.expect("get"), None);
    }

    #[tokio::test]
    async fn survives_reopen_with_same_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        SecureBackend::new(dir.path(), provider.clone())
            .set(&key("k"), b"persisted")
            .await
            .expect("set");

        let reopened = SecureBackend::new(dir.path(), provider);
        assert_eq!(
            reopened.get(&key("k")).await.expect("get").as_deref(),
            Some(&b"persisted"[..])
        );
    }

    #[tokio::test]
    async fn wrong_key_is_access_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        SecureBackend::new(dir.path(), InMemoryKeyProvider::with_key([1u8; 32]))
            .set(&key("k"), b"secret")
            .await
            .expect("set");

        let other = SecureBackend::new(dir.path(), InMemoryKeyProvider::with_key([2u8; 32]));
        let err = other.get(&key("k")).await.expect_err("wrong key");
        assert!(matches!(err, StorageError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn corrupt_blob_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SecureBackend::new(dir.path(), InMemoryKeyProvider::default());
        std::fs::write(store.path_for(&key("k")), b"not json").expect("write");

        let err = store.get(&key("k")).await.expect_err("corrupt");
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[tokio::test]
    async fn publishes_writes_with_snapshot_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SecureBackend::new(dir.path(), InMemoryKeyProvider::default());
        let mut sub = store.changes().expect("observable").subscribe(&key("k"));

        store.set(&key("k"), b"v1").await.expect("set");
        let event = sub.try_recv().expect("event");
        assert_eq!(event.payload.as_deref(), Some(&b"v1"[..]));

        let snapshot = store.snapshot(&key("k")).await.expect("snapshot");
        assert_eq!(snapshot.sequence, event.sequence);
        assert_eq!(snapshot.bytes.as_deref(), Some(&b"v1"[..]));
    }
}
