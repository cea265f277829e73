use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keystash_core::{Backend, ChangeChannel, Snapshot, StorageError, StorageKey};
use tracing::{debug, instrument};

use crate::atomic::{read_optional, write_atomic};

/// On-disk layout: one JSON object mapping key -> base64 value.
type StoredMap = BTreeMap<String, String>;

/// Unencrypted backend persisting every key in a single JSON file.
///
/// Each write reads, merges and rewrites the whole file, which keeps the
/// format trivial but only suits small key counts.
pub struct DurableBackend {
    path: PathBuf,
    lock: Mutex<()>,
    changes: ChangeChannel,
}

impl DurableBackend {
    /// Open (creating with an empty map if needed) the store file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if read_optional(&path)?.is_none() {
            debug!(?path, "creating empty durable store");
            write_map(&path, &StoredMap::new())?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
            changes: ChangeChannel::new(),
        })
    }

    /// Open `file_name` inside the platform data directory (`<data>/keystash/`).
    pub fn in_data_dir(file_name: &str) -> Result<Self, StorageError> {
        let base = dirs::data_dir().ok_or_else(|| StorageError::Io {
            reason: "no data directory available".to_string(),
        })?;
        Self::open(base.join("keystash").join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.lock.lock().map_err(|err| StorageError::Io {
            reason: format!("lock poisoned: {err}"),
        })
    }

    fn lookup(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let map = read_map(&self.path)?;
        map.get(key.as_str())
            .map(|encoded| {
                STANDARD.decode(encoded).map_err(|e| StorageError::Io {
                    reason: format!("corrupt entry for {key}: {e}"),
                })
            })
            .transpose()
    }
}

#[async_trait]
impl Backend for DurableBackend {
    fn name(&self) -> &'static str {
        "durable"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.lock()?;
        self.lookup(key)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError> {
        let _guard = self.lock()?;
        let mut map = read_map(&self.path)?;
        map.insert(key.to_string(), STANDARD.encode(value));
        write_map(&self.path, &map)?;
        self.changes.publish(key, Some(value.to_vec()));
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let _guard = self.lock()?;
        let mut map = read_map(&self.path)?;
        if map.remove(key.as_str()).is_some() {
            write_map(&self.path, &map)?;
            self.changes.publish(key, None);
        }
        Ok(())
    }

    fn changes(&self) -> Option<&ChangeChannel> {
        Some(&self.changes)
    }

    async fn snapshot(&self, key: &StorageKey) -> Result<Snapshot, StorageError> {
        let _guard = self.lock()?;
        Ok(Snapshot {
            bytes: self.lookup(key)?,
            sequence: self.changes.sequence(),
        })
    }
}

/// A vanished file reads as an empty map; it is recreated on next write.
fn read_map(path: &Path) -> Result<StoredMap, StorageError> {
    match read_optional(path)? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Io {
            reason: format!("corrupt store file {}: {e}", path.display()),
        }),
        None => Ok(StoredMap::new()),
    }
}

fn write_map(path: &Path, map: &StoredMap) -> Result<(), StorageError> {
    let json = serde_json::to_vec(map).map_err(StorageError::io)?;
    write_atomic(path, &json)
}
