//! Per-backend change channel.
//!
//! Every successful write or delete on an observe-capable backend is
//! published here as a [`ChangeEvent`]. Listeners subscribe to a single key
//! and only ever receive events for that key; filtering happens at publish
//! time, before anything is queued.
//!
//! The channel:
//! - Preserves publish order per listener
//! - Never drops or coalesces events (each listener has an unbounded queue)
//! - Does not replay events to late subscribers
//! - Removes a listener synchronously when its subscription is cancelled

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::key::StorageKey;

/// A single change published by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Channel-wide publish sequence, starting at 1.
    pub sequence: u64,
    /// Key that changed.
    pub key: StorageKey,
    /// New encoded value. `None` for a delete.
    pub payload: Option<Vec<u8>>,
}

struct Listener {
    key: StorageKey,
    sender: UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct ChannelState {
    sequence: u64,
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

#[derive(Default)]
struct ChannelInner {
    state: Mutex<ChannelState>,
    registrations: AtomicU64,
}

/// Multicast of `(key, bytes?)` events to per-key listeners.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone, Default)]
pub struct ChangeChannel {
    inner: Arc<ChannelInner>,
}

impl ChangeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a change to every listener of `key` and returns its sequence.
    ///
    /// Callers that need publish order to match persist order must hold
    /// their own write lock across persist and publish.
    pub fn publish(&self, key: &StorageKey, payload: Option<Vec<u8>>) -> u64 {
        let mut state = self.inner.state.lock();
        state.sequence += 1;
        let event = ChangeEvent {
            sequence: state.sequence,
            key: key.clone(),
            payload,
        };

        // Send to matching listeners, dropping ones whose receiver is gone.
        state.listeners.retain(|_, listener| {
            listener.key != event.key || listener.sender.send(event.clone()).is_ok()
        });
        trace!(key = %event.key, sequence = event.sequence, "published change");
        event.sequence
    }

    /// Sequence of the most recent publish (0 if nothing was published yet).
    pub fn sequence(&self) -> u64 {
        self.inner.state.lock().sequence
    }

    /// Subscribes to future changes of `key`.
    pub fn subscribe(&self, key: &StorageKey) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.insert(
                id,
                Listener {
                    key: key.clone(),
                    sender,
                },
            );
            id
        };
        self.inner.registrations.fetch_add(1, Ordering::Relaxed);

        Subscription {
            key: key.clone(),
            receiver,
            canceller: SubscriptionCanceller {
                id,
                channel: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Number of live listeners across all keys.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Number of live listeners for one key.
    pub fn listener_count_for(&self, key: &StorageKey) -> usize {
        self.inner
            .state
            .lock()
            .listeners
            .values()
            .filter(|l| &l.key == key)
            .count()
    }

    /// Total number of `subscribe` calls over the channel's lifetime.
    pub fn registrations(&self) -> u64 {
        self.inner.registrations.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ChangeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChangeChannel")
            .field("sequence", &state.sequence)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Receiving side of a per-key subscription. Dropping it unregisters the
/// listener.
pub struct Subscription {
    key: StorageKey,
    receiver: UnboundedReceiver<ChangeEvent>,
    canceller: SubscriptionCanceller,
}

impl Subscription {
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Waits for the next event. Returns `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Detached handle that can cancel this subscription from elsewhere
    /// (e.g. while a task owns the subscription).
    pub fn canceller(&self) -> SubscriptionCanceller {
        self.canceller.clone()
    }

    /// Unregisters the listener and discards anything still queued.
    pub fn cancel(&mut self) {
        self.canceller.cancel();
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.canceller.id)
            .finish_non_exhaustive()
    }
}

/// Cancels a listener registration. Cancelling is synchronous and
/// idempotent: once `cancel` returns the channel no longer knows the
/// listener.
#[derive(Clone)]
pub struct SubscriptionCanceller {
    id: u64,
    channel: Weak<ChannelInner>,
}

impl SubscriptionCanceller {
    pub fn cancel(&self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.state.lock().listeners.remove(&self.id);
        }
    }
}

impl fmt::Debug for SubscriptionCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCanceller")
            .field("id", &self.id)
            .finish()
    }
}
