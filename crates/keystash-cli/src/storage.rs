use std::{path::PathBuf, sync::Arc};

use crate::{cli::BackendKind, config::Config};
use color_eyre::Result;
use dirs::data_dir;
use keystash_core::{SharedBackend, VolatileBackend};
use keystash_storage::{DurableBackend, KeyringProvider, SecureBackend};
use tracing::debug;

/// Resolve the default data directory for Keystash.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("keystash"))
}

fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Build the backend of the given kind using config overrides.
pub fn backend_from_config(config: &Config, kind: BackendKind) -> Result<SharedBackend> {
    let backend: SharedBackend = match kind {
        BackendKind::Secure => {
            let root = data_root(config)?.join("secure");
            debug!(?root, "initializing secure backend");
            Arc::new(SecureBackend::new(
                root,
                KeyringProvider::new(config.keyring_service(), config.keyring_account()),
            ))
        }
        BackendKind::Durable => {
            let durable = match &config.data_dir {
                Some(root) => DurableBackend::open(root.join(config.durable_file()))?,
                None => DurableBackend::in_data_dir(config.durable_file())?,
            };
            debug!(path = ?durable.path(), "initializing durable backend");
            Arc::new(durable)
        }
        BackendKind::Memory => {
            debug!("initializing volatile backend");
            Arc::new(VolatileBackend::new())
        }
    };
    Ok(backend)
}

/// Helper for tests to construct a secure backend rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_backend(root: impl Into<PathBuf>) -> SharedBackend {
    use keystash_storage::InMemoryKeyProvider;

    Arc::new(SecureBackend::new(root, InMemoryKeyProvider::default()))
}
