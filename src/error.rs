//! Error types for rsmediadrm.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for rsmediadrm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No session is registered with the specified identifier.
    #[error("Session identifier {} is invalid", hex::encode(.0))]
    InvalidSession(Vec<u8>),

    /// A session with the same exchange id is already registered.
    #[error("Session identifier {} is already registered", hex::encode(.0))]
    DuplicateSession(Vec<u8>),

    /// The device has no certificate; provisioning is required.
    #[error("Device not provisioned")]
    NotProvisioned,

    /// The license or provisioning server response was rejected.
    #[error("Denied by server: {0}")]
    DeniedByServer(String),

    /// The DRM engine is in a state that cannot serve the request.
    #[error("Illegal engine state: {0}")]
    IllegalState(String),

    /// The crypto scheme is not supported on this platform.
    #[error("Unsupported crypto scheme {0}")]
    UnsupportedScheme(Uuid),

    /// The key type is not valid for the requested operation.
    #[error("Invalid key type: {0}")]
    InvalidKeyType(String),

    /// The operation is not supported for this session.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The engine was released, every further operation fails.
    #[error("MediaDrm released previously")]
    Released,

    /// A provisioning round is already in flight.
    #[error("Provisioning already in progress")]
    ProvisioningInProgress,

    /// No provisioning round is in flight.
    #[error("No provisioning in progress")]
    NotProvisioning,

    /// The decryption handle could not be created.
    #[error("MediaCrypto unavailable: {0}")]
    MediaCryptoUnavailable(String),

    /// The persistent license storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Failed to parse or serialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error signals a missing device certificate.
    #[must_use]
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self, Error::NotProvisioned)
    }
}

/// Result type alias for rsmediadrm operations.
pub type Result<T> = std::result::Result<T, Error>;
