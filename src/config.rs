//! Engine configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::platform::WIDEVINE_UUID;

/// Requested robustness level of the Widevine engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Keep whatever level the platform picked.
    #[default]
    #[serde(rename = "")]
    Default,
    L1,
    L3,
}

impl SecurityLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Default => "",
            SecurityLevel::L1 => "L1",
            SecurityLevel::L3 => "L3",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "" => Ok(SecurityLevel::Default),
            "L1" => Ok(SecurityLevel::L1),
            "L3" => Ok(SecurityLevel::L3),
            _ => Err(Error::Other(format!("Invalid security level: {}", s))),
        }
    }
}

/// Capabilities that depend on the platform version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformFeatures {
    /// The engine reports per-key status changes and expiration updates.
    pub key_status_listener: bool,
    /// Key requests carry an explicit request type.
    pub request_type: bool,
    /// Device certificates can be isolated per origin.
    pub origin_isolation: bool,
}

impl Default for PlatformFeatures {
    fn default() -> Self {
        Self {
            key_status_listener: true,
            request_type: true,
            origin_isolation: true,
        }
    }
}

impl PlatformFeatures {
    /// Capabilities of a platform predating key status and request type reporting.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            key_status_listener: false,
            request_type: false,
            origin_isolation: false,
        }
    }
}

/// Parameters for [`DrmEngine::create`](crate::engine::DrmEngine::create).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrmConfig {
    /// Crypto scheme (DRM system) UUID.
    pub scheme: Uuid,
    /// Security origin for per-origin device certificates, empty for none.
    pub origin: String,
    pub security_level: SecurityLevel,
    /// Open a crypto session and hand a decryption handle to the pipeline.
    pub requires_media_crypto: bool,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self::widevine()
    }
}

impl DrmConfig {
    /// Widevine, no origin, default security level, MediaCrypto required.
    #[must_use]
    pub fn widevine() -> Self {
        Self {
            scheme: WIDEVINE_UUID,
            origin: String::new(),
            security_level: SecurityLevel::Default,
            requires_media_crypto: true,
        }
    }

    /// Parse a JSON config, missing fields take their defaults.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
