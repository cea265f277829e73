use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use keystash_core::{SharedBackend, StorageKey};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cell::{ObservableCell, Storable};

/// Identity of a backend instance (pointer of its shared allocation).
///
/// Registered cells hold the backend alive, so an id cannot be reused while
/// its entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BackendId(usize);

impl BackendId {
    fn of(backend: &SharedBackend) -> Self {
        Self(Arc::as_ptr(backend) as *const () as usize)
    }
}

type SlotKey = (BackendId, StorageKey);

trait ErasedCell: Send + Sync {
    fn cancel(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Storable> ErasedCell for ObservableCell<T> {
    fn cancel(&self) {
        ObservableCell::cancel(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    cell: Arc<dyn ErasedCell>,
}

impl Entry {
    fn new<T: Storable>(cell: Arc<ObservableCell<T>>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            cell,
        }
    }

    fn typed<T: Storable>(&self) -> Option<Arc<ObservableCell<T>>> {
        if self.type_id != TypeId::of::<T>() {
            return None;
        }
        self.cell.clone().into_any().downcast::<ObservableCell<T>>().ok()
    }
}

/// Maps `(backend, key)` to its single live cell, so a key never has more
/// than one backend subscription no matter how many consumers observe it.
///
/// Cells of any value type share the map; a lookup with a different type
/// than the registered one finds nothing. Removing or replacing an entry
/// always cancels the cell it held.
#[derive(Default)]
pub struct ObservationRegistry {
    cells: Mutex<HashMap<SlotKey, Entry>>,
}

impl ObservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup only; never creates.
    pub fn observation<T: Storable>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
    ) -> Option<Arc<ObservableCell<T>>> {
        let cells = self.cells.lock();
        cells
            .get(&(BackendId::of(backend), key.clone()))
            .and_then(Entry::typed::<T>)
    }

    /// Inserts `cell` under its own backend and key. A previously registered
    /// cell for that slot is cancelled; returns whether one was replaced.
    pub fn register<T: Storable>(&self, cell: Arc<ObservableCell<T>>) -> bool {
        let slot = (BackendId::of(cell.backend()), cell.key().clone());
        let previous = self.cells.lock().insert(slot, Entry::new(cell));
        match previous {
            Some(entry) => {
                debug!(type_name = entry.type_name, "replacing registered observation");
                entry.cell.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes and cancels the cell for `(backend, key)`.
    pub fn unregister(&self, backend: &SharedBackend, key: &StorageKey) -> bool {
        let removed = self.cells.lock().remove(&(BackendId::of(backend), key.clone()));
        match removed {
            Some(entry) => {
                entry.cell.cancel();
                debug!(%key, "observation unregistered");
                true
            }
            None => false,
        }
    }

    /// Returns the registered cell for `(backend, key)`, creating and
    /// registering one if absent. A cell of another type under the same key
    /// is replaced and cancelled.
    pub fn get_or_create<T: Storable>(
        &self,
        backend: &SharedBackend,
        key: &StorageKey,
        default: impl FnOnce() -> T,
    ) -> Arc<ObservableCell<T>> {
        let slot = (BackendId::of(backend), key.clone());
        let (cell, replaced) = {
            let mut cells = self.cells.lock();
            if let Some(existing) = cells.get(&slot).and_then(Entry::typed::<T>) {
                return existing;
            }
            let cell = ObservableCell::new(backend.clone(), key.clone(), default());
            let replaced = cells.insert(slot, Entry::new(cell.clone()));
            (cell, replaced)
        };

        if let Some(entry) = replaced {
            warn!(
                %key,
                previous = entry.type_name,
                requested = std::any::type_name::<T>(),
                "key observed with a different type; replacing observation"
            );
            entry.cell.cancel();
        }
        cell
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels and removes every cell.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.cells.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.cell.cancel();
        }
    }
}

impl Drop for ObservationRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ObservationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationRegistry")
            .field("cells", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use keystash_core::{Backend, VolatileBackend};

    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(name).unwrap()
    }

    fn volatile() -> (SharedBackend, VolatileBackend) {
        let backend = VolatileBackend::new();
        (Arc::new(backend.clone()), backend)
    }

    #[test]
    fn lookup_does_not_create() {
        let registry = ObservationRegistry::new();
        let (backend, _) = volatile();
        assert!(registry.observation::<u32>(&backend, &key("k")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn get_or_create_returns_same_cell() {
        let registry = ObservationRegistry::new();
        let (backend, _) = volatile();

        let first = registry.get_or_create(&backend, &key("k"), || 1u32);
        let second = registry.get_or_create(&backend, &key("k"), || 2u32);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.value(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_key_on_different_backends_is_separate() {
        let registry = ObservationRegistry::new();
        let (a, _) = volatile();
        let (b, _) = volatile();

        let on_a = registry.get_or_create(&a, &key("k"), || 0u32);
        let on_b = registry.get_or_create(&b, &key("k"), || 0u32);

        assert!(!Arc::ptr_eq(&on_a, &on_b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn type_mismatch_is_not_found() {
        let registry = ObservationRegistry::new();
        let (backend, _) = volatile();
        registry.get_or_create(&backend, &key("k"), || 0u32);

        assert!(registry.observation::<String>(&backend, &key("k")).is_none());
        assert!(registry.observation::<u32>(&backend, &key("k")).is_some());
    }

    #[tokio::test]
    async fn register_replaces_and_cancels_previous() {
        let registry = ObservationRegistry::new();
        let (backend, inner) = volatile();
        let channel = inner.changes().unwrap().clone();

        let first = ObservableCell::new(backend.clone(), key("k"), 0u32);
        assert!(!registry.register(first.clone()));
        first.subscribe().await;
        assert_eq!(channel.listener_count(), 1);

        let second = ObservableCell::new(backend.clone(), key("k"), 0u32);
        assert!(registry.register(second.clone()));

        assert!(!first.is_active());
        assert_eq!(channel.listener_count(), 0);
        let found = registry.observation::<u32>(&backend, &key("k")).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[tokio::test]
    async fn different_type_replaces_cell() {
        let registry = ObservationRegistry::new();
        let (backend, inner) = volatile();
        let channel = inner.changes().unwrap().clone();

        let numeric = registry.get_or_create(&backend, &key("k"), || 0u32);
        numeric.subscribe().await;
        let textual = registry.get_or_create(&backend, &key("k"), String::new);
        textual.subscribe().await;

        assert!(!numeric.is_active());
        assert_eq!(registry.len(), 1);
        assert_eq!(channel.listener_count(), 1);
    }

    #[tokio::test]
    async fn unregister_cancels_subscription() {
        let registry = ObservationRegistry::new();
        let (backend, inner) = volatile();
        let channel = inner.changes().unwrap().clone();

        let cell = registry.get_or_create(&backend, &key("k"), || 0u32);
        cell.subscribe().await;
        assert_eq!(channel.listener_count(), 1);

        assert!(registry.unregister(&backend, &key("k")));
        assert!(!registry.unregister(&backend, &key("k")));
        assert!(!cell.is_active());
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn dropping_registry_cancels_all() {
        let (backend, inner) = volatile();
        let channel = inner.changes().unwrap().clone();
        let cell = {
            let registry = ObservationRegistry::new();
            let cell = registry.get_or_create(&backend, &key("a"), || 0u32);
            cell.subscribe().await;
            registry
                .get_or_create(&backend, &key("b"), || 0u32)
                .subscribe()
                .await;
            assert_eq!(channel.listener_count(), 2);
            cell
        };

        assert!(!cell.is_active());
        assert_eq!(channel.listener_count(), 0);
    }
}
