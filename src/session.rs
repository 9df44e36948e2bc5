//! Session identifiers and per-session metadata.
//!
//! A DRM session is known under up to three ids: the exchange id handed to the
//! application, the engine id of the live platform session, and the persistent
//! id of a stored offline license. [`SessionId`] keeps the three together.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::PersistentInfo;
use crate::utils::hex_or_dash;

/// License type requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    /// Keys live only as long as the engine session.
    Streaming,
    /// Keys are persisted and can be restored later.
    Offline,
    /// A persisted license is being released.
    Release,
}

impl KeyType {
    /// Upper-case name as used in logs and config files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Streaming => "STREAMING",
            KeyType::Offline => "OFFLINE",
            KeyType::Release => "RELEASE",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "STREAMING" | "TEMPORARY" => Ok(KeyType::Streaming),
            "OFFLINE" | "PERSISTENT" | "PERSISTENT-LICENSE" => Ok(KeyType::Offline),
            "RELEASE" => Ok(KeyType::Release),
            _ => Err(Error::InvalidKeyType(s.to_string())),
        }
    }
}

/// Identifier of a DRM session across the exchange, engine and persistent id spaces.
///
/// Two ids are equal when their exchange ids match, whatever the state of the
/// other two ids.
#[derive(Debug, Clone)]
pub struct SessionId {
    exchange_id: Vec<u8>,
    engine_id: Option<Vec<u8>>,
    persistent_id: Option<Vec<u8>>,
}

impl SessionId {
    /// Session for an offline license. The exchange id is a random UUID in
    /// simple hex form, so it stays stable when the license is later restored
    /// into a different engine session.
    #[must_use]
    pub fn persistent(engine_id: Vec<u8>) -> Self {
        Self {
            exchange_id: Uuid::new_v4().simple().to_string().into_bytes(),
            engine_id: Some(engine_id),
            persistent_id: None,
        }
    }

    /// Session whose exchange id is the engine id itself.
    #[must_use]
    pub fn temporary(engine_id: Vec<u8>) -> Self {
        Self {
            exchange_id: engine_id.clone(),
            engine_id: Some(engine_id),
            persistent_id: None,
        }
    }

    /// The "no such license" id resolved by a load that found nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            exchange_id: Vec::new(),
            engine_id: None,
            persistent_id: None,
        }
    }

    /// Session rebuilt from a stored license record, not yet opened with the engine.
    pub(crate) fn restored(exchange_id: Vec<u8>, persistent_id: Vec<u8>) -> Self {
        Self {
            exchange_id,
            engine_id: None,
            persistent_id: Some(persistent_id),
        }
    }

    pub fn exchange_id(&self) -> &[u8] {
        &self.exchange_id
    }

    pub fn engine_id(&self) -> Option<&[u8]> {
        self.engine_id.as_deref()
    }

    pub fn persistent_id(&self) -> Option<&[u8]> {
        self.persistent_id.as_deref()
    }

    /// Whether this is the id returned for a missing persistent license.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchange_id.is_empty()
    }

    /// Attach the live engine session handle.
    pub fn set_engine_id(&mut self, engine_id: Vec<u8>) {
        self.engine_id = Some(engine_id);
    }

    /// Attach the persistent license handle.
    pub fn set_persistent_id(&mut self, persistent_id: Vec<u8>) {
        self.persistent_id = Some(persistent_id);
    }

    pub(crate) fn clear_persistent_id(&mut self) {
        self.persistent_id = None;
    }

    /// Hex rendering of the exchange id.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.exchange_id)
    }
}

impl PartialEq for SessionId {
    fn eq(&self, other: &Self) -> bool {
        self.exchange_id == other.exchange_id
    }
}

impl Eq for SessionId {}

impl Hash for SessionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.exchange_id.hash(state);
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (engine: {}, persistent: {})",
            self.to_hex(),
            hex_or_dash(self.engine_id()),
            hex_or_dash(self.persistent_id())
        )
    }
}

/// Metadata the registry keeps for each live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub(crate) session_id: SessionId,
    pub(crate) mime_type: String,
    pub(crate) key_type: KeyType,
}

impl SessionInfo {
    pub(crate) fn new(session_id: SessionId, mime_type: String, key_type: KeyType) -> Self {
        Self {
            session_id,
            mime_type,
            key_type,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Record stored for an offline license, `None` until the license is persisted.
    pub(crate) fn to_persistent_info(&self) -> Option<PersistentInfo> {
        let persistent_id = self.session_id.persistent_id()?;
        Some(PersistentInfo {
            exchange_id: self.session_id.exchange_id().to_vec(),
            persistent_id: persistent_id.to_vec(),
            mime_type: self.mime_type.clone(),
        })
    }
}
