use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use keystash_core::StorageError;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::{debug, instrument};

/// Key material used for encryption at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier for logging/rotation (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

impl From<KeyError> for StorageError {
    fn from(err: KeyError) -> Self {
        StorageError::access_denied(format!("key provider: {err}"))
    }
}

/// Provides access to the data key (OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

/// OS keyring-backed provider. The data key lives as a base64 secret under
/// `service`/`account`.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    #[instrument(skip_all, fields(service = %self.service, account = %self.account))]
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(secret) => decode_key(&self.account, &secret),
            // Only a missing entry may be replaced; a locked or denied
            // keystore must not lose its existing key.
            Err(keyring::Error::NoEntry) => {
                debug!("no data key in keyring, generating one");
                let material = generate_key(&self.account);
                entry
                    .set_password(&encode_key(&material))
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                Ok(material)
            }
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    /// Provider pinned to the given key bytes.
    pub fn with_key(bytes: [u8; 32]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(KeyMaterial {
                id: "memory".to_string(),
                bytes,
            }))),
        }
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = generate_key("memory");
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn generate_key(id: &str) -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial {
        id: id.to_string(),
        bytes,
    }
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(material.bytes)
}

fn decode_key(id: &str, secret: &str) -> Result<KeyMaterial, KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|raw: Vec<u8>| KeyError::Decode(format!("expected 32 bytes, got {}", raw.len())))?;

    Ok(KeyMaterial {
        id: id.to_string(),
        bytes,
    })
}
