//! Key requests and key status reports.

use std::fmt;

use uuid::Uuid;

/// Status the platform reports for one key of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStatusCode {
    Usable,
    Expired,
    OutputNotAllowed,
    StatusPending,
    InternalError,
    UsableInFuture,
}

/// One entry of a session's key status list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    /// Key ID bytes as reported by the platform.
    pub key_id: Vec<u8>,
    pub status: KeyStatusCode,
}

impl KeyStatus {
    pub fn new(key_id: Vec<u8>, status: KeyStatusCode) -> Self {
        Self { key_id, status }
    }

    /// Single-entry report with a one-byte zero key id, used where the
    /// platform cannot report per-key status.
    #[must_use]
    pub fn placeholder(status: KeyStatusCode) -> Vec<Self> {
        vec![Self::new(vec![0], status)]
    }

    /// Key ID as UUID.
    ///
    /// 16-byte ids map directly; shorter ids are zero padded, longer ids are
    /// truncated to their first 16 bytes.
    #[must_use]
    pub fn kid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        let len = self.key_id.len().min(16);
        bytes[..len].copy_from_slice(&self.key_id[..len]);
        Uuid::from_bytes(bytes)
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.kid().as_simple(), self.status)
    }
}

/// Whether any key in the list can be used for decryption now.
#[must_use]
pub fn has_usable_key(keys: &[KeyStatus]) -> bool {
    keys.iter().any(|k| k.status == KeyStatusCode::Usable)
}

/// Kind of license message sent to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRequestType {
    Initial,
    Renewal,
    Release,
}

/// License request produced by the platform engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    /// Opaque request payload for the license server.
    pub data: Vec<u8>,
    /// License server URL suggested by the engine, empty when none.
    pub default_url: String,
    /// Explicit request type, only reported by newer platforms.
    pub request_type: Option<KeyRequestType>,
}

impl KeyRequest {
    /// Message type to report for this request.
    ///
    /// When the platform cannot report the type, requests carrying a URL are
    /// assumed to be renewals and all others initial requests. This is a
    /// heuristic, not a protocol rule.
    #[must_use]
    pub fn message_type(&self, platform_reports_type: bool) -> KeyRequestType {
        match self.request_type {
            Some(request_type) if platform_reports_type => request_type,
            _ if self.default_url.is_empty() => KeyRequestType::Initial,
            _ => KeyRequestType::Renewal,
        }
    }
}
