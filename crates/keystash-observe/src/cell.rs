//! Shared, observable view of one key in one backend.
//!
//! A cell starts `Idle`. The first [`ObservableCell::subscribe`] attaches to
//! the backend's change channel, replays the persisted value and spawns a
//! drain task; later calls are no-ops while the cell stays `Active`.
//! Only the drain task applies backend events, so state transitions for a
//! key are serialized through a single path.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
};

use keystash_core::{
    codec, ChangeEvent, SharedBackend, Snapshot, StorageError, StorageKey, Subscription,
    SubscriptionCanceller,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Values that can live in a cell.
pub trait Storable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Storable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

enum Phase {
    Idle,
    Active {
        canceller: Option<SubscriptionCanceller>,
        task: Option<JoinHandle<()>>,
    },
}

struct Observer<T> {
    id: u64,
    sender: UnboundedSender<T>,
}

struct CellState<T> {
    value: T,
    /// Whether `value` came from the backend or a write (vs. the default).
    loaded: bool,
    /// Encoded form of `value`, when known.
    current_bytes: Option<Vec<u8>>,
    error: Option<StorageError>,
    phase: Phase,
    /// Bumped on every activation and cancel; stale drain tasks compare it.
    generation: u64,
    /// Highest channel sequence reflected in `value` (snapshot or event).
    last_sequence: u64,
    /// Bytes of local writes whose channel echo has not arrived yet.
    pending_echoes: VecDeque<Vec<u8>>,
    observers: Vec<Observer<T>>,
    next_observer: u64,
}

impl<T: Clone> CellState<T> {
    fn listening(&self) -> bool {
        matches!(
            self.phase,
            Phase::Active {
                canceller: Some(_),
                ..
            }
        )
    }

    fn set(&mut self, value: T, bytes: Option<Vec<u8>>, loaded: bool) {
        self.value = value;
        self.current_bytes = bytes;
        self.loaded = loaded;
        self.notify();
    }

    fn notify(&mut self) {
        let value = &self.value;
        self.observers
            .retain(|observer| observer.sender.send(value.clone()).is_ok());
    }

    /// Consumes a matching echo; true when the event is our own write and a
    /// newer local write is still in flight or the value is unchanged.
    fn absorb_echo(&mut self, bytes: &[u8]) -> bool {
        let Some(pos) = self.pending_echoes.iter().position(|p| p == bytes) else {
            return false;
        };
        self.pending_echoes.drain(..=pos);
        !self.pending_echoes.is_empty() || self.current_bytes.as_deref() == Some(bytes)
    }
}

/// Last known decoded value, last error and backend subscription for one
/// `(backend, key, T)`.
pub struct ObservableCell<T: Storable> {
    key: StorageKey,
    backend: SharedBackend,
    default: T,
    activation: tokio::sync::Mutex<()>,
    state: Mutex<CellState<T>>,
}

impl<T: Storable> ObservableCell<T> {
    pub fn new(backend: SharedBackend, key: StorageKey, default: T) -> Arc<Self> {
        Arc::new(Self {
            key,
            backend,
            activation: tokio::sync::Mutex::new(()),
            state: Mutex::new(CellState {
                value: default.clone(),
                loaded: false,
                current_bytes: None,
                error: None,
                phase: Phase::Idle,
                generation: 0,
                last_sequence: 0,
                pending_echoes: VecDeque::new(),
                observers: Vec::new(),
                next_observer: 0,
            }),
            default,
        })
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Current value. Never suspends.
    pub fn value(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Most recent error, if the last operation on this cell failed.
    pub fn error(&self) -> Option<StorageError> {
        self.state.lock().error.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Active { .. })
    }

    /// Highest backend change sequence the cached value accounts for.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Number of attached value streams.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Moves the cell from `Idle` to `Active`: attach, replay, drain.
    /// Idempotent while active; concurrent callers wait for the replay.
    pub async fn subscribe(self: &Arc<Self>) {
        let _activation = self.activation.lock().await;

        let (subscription, generation) = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Active { .. }) {
                return;
            }
            state.generation += 1;
            // Attach before reading so no write can fall between the two.
            let subscription = self.backend.changes().map(|c| c.subscribe(&self.key));
            state.phase = Phase::Active {
                canceller: subscription.as_ref().map(Subscription::canceller),
                task: None,
            };
            (subscription, state.generation)
        };
        debug!(key = %self.key, backend = self.backend.name(), "activating observation");

        let since = match self.backend.snapshot(&self.key).await {
            Ok(snapshot) => {
                let since = snapshot.sequence;
                self.apply_snapshot(generation, snapshot);
                since
            }
            Err(err) => {
                warn!(key = %self.key, %err, "initial read failed");
                self.record_error(err);
                0
            }
        };

        let Some(subscription) = subscription else {
            return;
        };
        let task = tokio::spawn(drain(Arc::downgrade(self), subscription, since, generation));

        let mut state = self.state.lock();
        let current = state.generation == generation;
        match &mut state.phase {
            Phase::Active { task: slot, .. } if current => *slot = Some(task),
            _ => task.abort(),
        }
    }

    /// Optimistic local write: the new value is visible immediately, then
    /// persisted. On failure the error is recorded and returned; the local
    /// value is kept. A successful write clears any recorded error.
    pub async fn update_value(&self, value: T) -> Result<(), StorageError> {
        let encoded = codec::encode(&value);
        {
            let mut state = self.state.lock();
            match &encoded {
                Ok(bytes) => {
                    if state.listening() {
                        state.pending_echoes.push_back(bytes.clone());
                    }
                    state.set(value, Some(bytes.clone()), true);
                }
                Err(err) => {
                    state.error = Some(err.clone());
                    state.set(value, None, true);
                }
            }
        }

        let bytes = encoded?;
        if let Err(err) = self.backend.set(&self.key, &bytes).await {
            warn!(key = %self.key, %err, "write failed; keeping optimistic value");
            let mut state = self.state.lock();
            if let Some(pos) = state.pending_echoes.iter().position(|p| *p == bytes) {
                state.pending_echoes.remove(pos);
            }
            state.error = Some(err.clone());
            return Err(err);
        }
        // The echo of this write is absorbed, so it cannot clear the error.
        self.state.lock().error = None;
        Ok(())
    }

    /// Attaches a value stream. It first yields the current value when one
    /// was loaded or written, then every later value in order.
    pub fn watch(self: &Arc<Self>) -> ValueStream<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if state.loaded {
            let _ = sender.send(state.value.clone());
        }
        let id = state.next_observer;
        state.next_observer += 1;
        state.observers.push(Observer { id, sender });

        ValueStream {
            id,
            receiver,
            cell: Arc::downgrade(self),
        }
    }

    /// Tears down the subscription synchronously: the channel listener is
    /// gone and every value stream is closed when this returns.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Phase::Active { canceller, task } = std::mem::replace(&mut state.phase, Phase::Idle) {
            if let Some(canceller) = canceller {
                canceller.cancel();
            }
            if let Some(task) = task {
                task.abort();
            }
            debug!(key = %self.key, "observation cancelled");
        }
        state.pending_echoes.clear();
        state.observers.clear();
    }

    fn unwatch(&self, id: u64) {
        self.state.lock().observers.retain(|o| o.id != id);
    }

    fn record_error(&self, err: StorageError) {
        self.state.lock().error = Some(err);
    }

    fn apply_snapshot(&self, generation: u64, snapshot: Snapshot) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.last_sequence = snapshot.sequence;
        let Some(bytes) = snapshot.bytes else {
            return;
        };
        match codec::decode::<T>(&bytes) {
            Ok(value) => {
                state.error = None;
                state.set(value, Some(bytes), true);
            }
            Err(err) => {
                warn!(key = %self.key, %err, "stored value does not decode; keeping default");
                state.error = Some(err);
            }
        }
    }

    /// Returns false when the cell was cancelled and the drain should stop.
    fn apply_event(&self, generation: u64, since: u64, event: ChangeEvent) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.last_sequence = state.last_sequence.max(event.sequence);

        let Some(bytes) = event.payload else {
            if event.sequence > since {
                state.error = None;
                state.set(self.default.clone(), None, false);
            }
            return true;
        };

        if state.absorb_echo(&bytes) || event.sequence <= since {
            return true;
        }

        match codec::decode::<T>(&bytes) {
            Ok(value) => {
                state.error = None;
                state.set(value, Some(bytes), true);
            }
            Err(err) => {
                // Stale-but-valid: keep the previous good value.
                warn!(key = %self.key, %err, "dropping undecodable change");
                state.error = Some(err);
            }
        }
        true
    }
}

impl<T: Storable> Drop for ObservableCell<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T: Storable + fmt::Debug> fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObservableCell")
            .field("key", &self.key)
            .field("backend", &self.backend.name())
            .field("value", &state.value)
            .field("error", &state.error)
            .field("last_sequence", &state.last_sequence)
            .field("active", &matches!(state.phase, Phase::Active { .. }))
            .finish()
    }
}

async fn drain<T: Storable>(
    cell: Weak<ObservableCell<T>>,
    mut subscription: Subscription,
    since: u64,
    generation: u64,
) {
    while let Some(event) = subscription.recv().await {
        let Some(cell) = cell.upgrade() else {
            break;
        };
        if !cell.apply_event(generation, since, event) {
            break;
        }
    }
}

/// Ordered stream of values applied to a cell.
pub struct ValueStream<T: Storable> {
    id: u64,
    receiver: UnboundedReceiver<T>,
    cell: Weak<ObservableCell<T>>,
}

impl<T: Storable> ValueStream<T> {
    /// Next value; `None` once the stream is detached or the cell cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Detaches from the cell and discards anything still queued.
    pub fn unwatch(&mut self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.unwatch(self.id);
        }
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl<T: Storable> Drop for ValueStream<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.unwatch(self.id);
        }
    }
}
