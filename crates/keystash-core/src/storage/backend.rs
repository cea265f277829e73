use std::sync::Arc;

use async_trait::async_trait;

use crate::{channel::ChangeChannel, error::StorageError, key::StorageKey};

/// Stored bytes together with the channel sequence they are consistent with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: Option<Vec<u8>>,
    /// Sequence of the last change published before the read. Events with a
    /// sequence at or below this are already reflected in `bytes`.
    pub sequence: u64,
}

/// Byte-level persistence medium shared by the secure, volatile and durable
/// stores. Backends never inspect the bytes they hold.
///
/// Observe-capable backends expose a [`ChangeChannel`] and must publish
/// while still holding the lock that made the write visible, so that
/// publish order equals persist order.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    /// Retrieve the bytes for a key; `None` when absent.
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist bytes under a key, overwriting any existing entry.
    async fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;

    /// Change channel, for backends that notify on write.
    fn changes(&self) -> Option<&ChangeChannel> {
        None
    }

    /// Consistent read of bytes and channel sequence.
    ///
    /// The default reads the sequence before the value, which can only make
    /// a caller re-apply an event it already saw, never miss one. Backends
    /// with a write lock override this to read both under that lock.
    async fn snapshot(&self, key: &StorageKey) -> Result<Snapshot, StorageError> {
        let sequence = self.changes().map(ChangeChannel::sequence).unwrap_or(0);
        let bytes = self.get(key).await?;
        Ok(Snapshot { bytes, sequence })
    }
}

pub type SharedBackend = Arc<dyn Backend>;
