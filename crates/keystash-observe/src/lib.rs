//! Typed, shared observations over Keystash backends.
//!
//! [`StorageFacade`] is the entry point: one-shot reads and writes go
//! straight to a backend, while [`StorageFacade::observe`] hands out
//! [`ObservationHandle`]s backed by a single [`ObservableCell`] per
//! `(backend, key)`, tracked by the [`ObservationRegistry`].

pub mod cell;
pub mod facade;
pub mod key_def;
pub mod registry;

pub use cell::{ObservableCell, Storable, ValueStream};
pub use facade::{ObservationHandle, StorageFacade};
pub use key_def::KeyDefinition;
pub use registry::ObservationRegistry;
