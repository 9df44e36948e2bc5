//! Outbound interface towards the decryption pipeline.

use std::sync::Arc;

use crate::error::Error;
use crate::key::{KeyRequestType, KeyStatus};
use crate::platform::MediaCrypto;
use crate::session::SessionId;

/// Identifier of a pending pipeline call; settled exactly once.
pub type PromiseId = u32;

/// Receiver of promise outcomes and session events.
///
/// Called on the thread that drove the engine, after the engine released its
/// state lock. Callbacks arrive in the order the engine produced them, and an
/// implementation may call back into the engine from inside one.
pub trait DrmClient: Send + Sync {
    /// The decryption handle is ready, or `None` if it never will be.
    fn on_media_crypto_ready(&self, media_crypto: Option<Arc<dyn MediaCrypto>>);

    /// Fetch a device certificate and feed it to
    /// [`DrmEngine::process_provision_response`](crate::engine::DrmEngine::process_provision_response).
    fn on_start_provisioning(&self, default_url: &str, request: &[u8]);

    fn on_promise_resolved(&self, promise_id: PromiseId);

    fn on_promise_resolved_with_session(&self, promise_id: PromiseId, session_id: &SessionId);

    fn on_promise_rejected(&self, promise_id: PromiseId, error: &Error);

    fn on_session_message(
        &self,
        session_id: &SessionId,
        request_type: KeyRequestType,
        message: &[u8],
    );

    fn on_session_closed(&self, session_id: &SessionId);

    fn on_session_keys_change(
        &self,
        session_id: &SessionId,
        keys: &[KeyStatus],
        has_usable_key: bool,
        is_key_release: bool,
    );

    fn on_session_expiration_update(&self, session_id: &SessionId, expiration_ms: i64);

    fn on_reset_device_credentials_completed(&self, success: bool);
}
