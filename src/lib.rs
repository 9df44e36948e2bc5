//! rsmediadrm - bridge between a media decryption pipeline and a platform DRM engine.
//!
//! This crate provides:
//! - Session lifecycle (create, update, load, remove, close) over a platform engine.
//! - Offline license persistence through a pluggable storage.
//! - Process-wide serialisation of device provisioning.
//! - Key status, expiration and renewal event forwarding.
//!
//! Feature flags:
//! - `cli`: enable the license store CLI binary.
//! - `log`: log through the `log` crate (default).
//! - `tracing`: log through `tracing` instead.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Ordered callback queues and load-time event deferral.
pub mod callbacks;
/// Outbound interface towards the decryption pipeline.
pub mod client;
/// Engine configuration.
pub mod config;
/// DRM engine bridge.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// Key requests and key status reports.
pub mod key;
/// Platform DRM engine interface.
pub mod platform;
/// Process-wide provisioning coordinator.
pub mod provisioning;
/// Session bookkeeping and offline license persistence.
pub mod registry;
/// Session identifiers and descriptors.
pub mod session;
/// Offline license storage.
pub mod storage;
/// Shared helper utilities.
pub mod utils;

#[cfg(test)]
mod testing;

pub use engine::{DrmEngine, DrmEnvironment, EngineStatus};
pub use error::{Error, Result};
