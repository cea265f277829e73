mod backend;
mod volatile;

pub use backend::{Backend, SharedBackend, Snapshot};
pub use volatile::VolatileBackend;
