use thiserror::Error;

/// Errors produced by backends, the codec and observations.
///
/// Every variant carries a rendered reason rather than a source error so the
/// value can be cloned into an observation's error slot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    #[error("entry not found for key: {key}")]
    NotFound { key: String },
    /// Key failed validation (e.g. empty).
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },
    /// Value could not be serialized.
    #[error("encoding failed: {reason}")]
    Encoding { reason: String },
    /// Stored bytes did not match the requested type.
    #[error("decoding failed: {reason}")]
    Decoding { reason: String },
    /// Underlying medium unavailable or failed.
    #[error("storage failure: {reason}")]
    Io { reason: String },
    /// Secure medium locked, unauthorized, or keyed differently.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },
}

impl StorageError {
    pub fn io<E: ToString>(err: E) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }

    pub fn access_denied<E: ToString>(err: E) -> Self {
        Self::AccessDenied {
            reason: err.to_string(),
        }
    }

    /// True for the recoverable "nothing stored" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
