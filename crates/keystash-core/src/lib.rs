//! Core abstractions for Keystash: storage keys, the byte-level backend
//! contract, the per-backend change channel and the JSON codec.
//! Concrete persistent backends live in `keystash-storage`.

pub mod channel;
pub mod codec;
pub mod error;
pub mod key;
pub mod storage;

pub use channel::{ChangeChannel, ChangeEvent, Subscription, SubscriptionCanceller};
pub use error::StorageError;
pub use key::StorageKey;
pub use storage::{Backend, SharedBackend, Snapshot, VolatileBackend};
