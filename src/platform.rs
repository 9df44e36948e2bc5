//! Interface of the platform DRM engine the bridge drives.
//!
//! [`DrmPlatform`] creates engine instances and decryption handles;
//! [`MediaDrm`] exposes the per-instance session, key and provisioning
//! primitives. Both are implemented by the host over its native DRM stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::PlatformFeatures;
use crate::error::Result;
use crate::key::{KeyRequest, KeyStatus};
use crate::session::KeyType;

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// ClearKey system UUID.
pub const CLEARKEY_UUID: Uuid = Uuid::from_u128(0xe2719d58a985b3c9781ab030af78d30e);

/// Property holding the engine's security level (`L1`, `L3`).
pub const PROPERTY_SECURITY_LEVEL: &str = "securityLevel";
/// Property holding the per-origin certificate scope.
pub const PROPERTY_ORIGIN: &str = "origin";
/// Property enabling encrypted client identification.
pub const PROPERTY_PRIVACY_MODE: &str = "privacyMode";
/// Property allowing sessions to share keys.
pub const PROPERTY_SESSION_SHARING: &str = "sessionSharing";
/// Byte-array property holding the license server certificate.
pub const PROPERTY_SERVICE_CERTIFICATE: &str = "serviceCertificate";
/// Provisioning response that removes the origin-bound certificate.
pub const UNPROVISION_RESPONSE: &[u8] = b"unprovision";

/// Whether `scheme` is the Widevine system.
#[must_use]
pub fn is_widevine(scheme: Uuid) -> bool {
    scheme == WIDEVINE_UUID
}

/// Device certificate request to forward to a provisioning server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub default_url: String,
    pub data: Vec<u8>,
}

/// Event raised by the platform engine for one of its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDrmEvent {
    /// The session needs a new license (renewal).
    KeyRequired { engine_id: Vec<u8>, data: Vec<u8> },
    /// The session's keys expired.
    KeyExpired { engine_id: Vec<u8> },
    /// Vendor-specific notification.
    VendorDefined { engine_id: Vec<u8> },
    /// The device needs provisioning.
    ProvisionRequired,
    /// The session's state was lost, e.g. after a resource reclaim.
    SessionLostState { engine_id: Vec<u8> },
    /// Per-key status update.
    KeyStatusChange {
        engine_id: Vec<u8>,
        keys: Vec<KeyStatus>,
        has_new_usable_key: bool,
    },
    /// New license expiration time, milliseconds since the Unix epoch.
    ExpirationUpdate { engine_id: Vec<u8>, expiration_ms: i64 },
}

/// One platform DRM engine instance.
///
/// Calls that need a device certificate fail with
/// [`Error::NotProvisioned`](crate::error::Error::NotProvisioned).
pub trait MediaDrm: Send {
    /// Open a session and return its engine id.
    fn open_session(&mut self) -> Result<Vec<u8>>;

    fn close_session(&mut self, engine_id: &[u8]) -> Result<()>;

    /// Build a license request. `scope_id` is the engine id, or the
    /// persistent id for [`KeyType::Release`].
    fn get_key_request(
        &mut self,
        scope_id: &[u8],
        init_data: Option<&[u8]>,
        mime_type: &str,
        key_type: KeyType,
        optional_parameters: &HashMap<String, String>,
    ) -> Result<KeyRequest>;

    /// Apply a license response. Returns the persistent id for offline licenses.
    fn provide_key_response(&mut self, scope_id: &[u8], response: &[u8])
        -> Result<Option<Vec<u8>>>;

    fn remove_keys(&mut self, engine_id: &[u8]) -> Result<()>;

    /// Load a persisted license into an open session. Fails with
    /// [`Error::IllegalState`](crate::error::Error::IllegalState) when the
    /// license is no longer valid.
    fn restore_keys(&mut self, engine_id: &[u8], persistent_id: &[u8]) -> Result<()>;

    fn get_provision_request(&mut self) -> Result<ProvisionRequest>;

    fn provide_provision_response(&mut self, response: &[u8]) -> Result<()>;

    fn get_property_string(&self, name: &str) -> Result<String>;

    fn set_property_string(&mut self, name: &str, value: &str) -> Result<()>;

    fn set_property_byte_array(&mut self, name: &str, value: &[u8]) -> Result<()>;

    /// Next buffered event, if any.
    fn poll_event(&mut self) -> Option<MediaDrmEvent> {
        None
    }

    /// Free the engine; no call follows.
    fn release(&mut self);
}

/// Decryption handle bound to the crypto session, consumed by the decoder.
pub trait MediaCrypto: Send + Sync + fmt::Debug {
    fn release(&self);
}

/// Factory side of the platform DRM stack.
pub trait DrmPlatform: Send + Sync {
    /// Whether `scheme` is supported, optionally for a container mime type.
    fn is_scheme_supported(&self, scheme: Uuid, container_mime_type: Option<&str>) -> bool;

    fn create_media_drm(&self, scheme: Uuid) -> Result<Box<dyn MediaDrm>>;

    /// Create the decryption handle for an open crypto session.
    fn create_media_crypto(&self, scheme: Uuid, engine_id: &[u8]) -> Result<Arc<dyn MediaCrypto>>;

    fn features(&self) -> PlatformFeatures {
        PlatformFeatures::default()
    }
}
