//! Persistent backends for Keystash.
//! `SecureBackend` encrypts at rest with AES-GCM using a key sourced from the
//! OS keyring (or a test double); `DurableBackend` keeps a plain JSON map on disk.

mod atomic;
pub mod durable;
pub mod key_provider;
pub mod secure;

pub use durable::DurableBackend;
pub use key_provider::{InMemoryKeyProvider, KeyError, KeyMaterial, KeyProvider, KeyringProvider};
pub use secure::SecureBackend;
