//! DRM engine bridge.
//!
//! This module drives one platform DRM engine on behalf of a decryption
//! pipeline: it opens the crypto session backing the decryption handle,
//! creates/updates/loads/removes/closes application sessions, runs device
//! provisioning through the process-wide [`ProvisioningCoordinator`], and keeps
//! offline licenses in [`LicenseStorage`] through the [`SessionRegistry`].
//!
//! Every pipeline call is settled exactly once through the [`DrmClient`].
//! Client callbacks are queued while the engine state is locked and delivered
//! in order once it is unlocked, so a client may call back into the engine.
//! Failures that leave the platform engine in an unknown state release the
//! whole engine; later calls are rejected with [`Error::Released`].
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;

use crate::callbacks::{CallbackQueue, EventDeferrer};
use crate::client::{DrmClient, PromiseId};
use crate::config::{DrmConfig, PlatformFeatures, SecurityLevel};
use crate::error::{Error, Result};
use crate::key::{has_usable_key, KeyRequest, KeyStatus, KeyStatusCode};
use crate::platform::{
    is_widevine, DrmPlatform, MediaCrypto, MediaDrm, MediaDrmEvent, PROPERTY_ORIGIN,
    PROPERTY_PRIVACY_MODE, PROPERTY_SECURITY_LEVEL, PROPERTY_SERVICE_CERTIFICATE,
    PROPERTY_SESSION_SHARING, UNPROVISION_RESPONSE,
};
use crate::provisioning::{ProvisionSlot, ProvisioningCoordinator};
use crate::registry::SessionRegistry;
use crate::session::{KeyType, SessionId, SessionInfo};
use crate::storage::LicenseStorage;

/// Collaborators an engine is wired to.
pub struct DrmEnvironment {
    pub platform: Arc<dyn DrmPlatform>,
    pub storage: Arc<dyn LicenseStorage>,
    pub client: Arc<dyn DrmClient>,
    pub coordinator: Arc<ProvisioningCoordinator>,
}

impl DrmEnvironment {
    /// Environment using the process-wide provisioning coordinator.
    pub fn new(
        platform: Arc<dyn DrmPlatform>,
        storage: Arc<dyn LicenseStorage>,
        client: Arc<dyn DrmClient>,
    ) -> Self {
        Self {
            platform,
            storage,
            client,
            coordinator: ProvisioningCoordinator::global(),
        }
    }

    /// Use an isolated coordinator instead of the process-wide one.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<ProvisioningCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }
}

/// Coarse engine state derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The decryption handle was requested but is not created yet.
    AwaitingMediaCrypto,
    Ready,
    /// A provisioning round-trip of this engine is in flight.
    Provisioning,
    /// Terminal.
    Released,
}

#[derive(Debug, Clone, Copy)]
enum ProvisioningPurpose {
    MediaCrypto,
    ResetCredentials,
}

struct EngineState {
    drm: Option<Box<dyn MediaDrm>>,
    media_crypto: Option<Arc<dyn MediaCrypto>>,
    /// Engine session backing the decryption handle, never exposed to the application.
    crypto_session: Option<SessionId>,
    origin_set: bool,
    released: bool,
    provisioning_pending: bool,
    holds_provisioning_slot: bool,
    /// Set when the slot must be handed back once the state lock is dropped.
    provisioning_slot_release_due: bool,
    reset_credentials_pending: bool,
    deferrer: Option<EventDeferrer>,
}

impl EngineState {
    fn new(drm: Box<dyn MediaDrm>) -> Self {
        Self {
            drm: Some(drm),
            media_crypto: None,
            crypto_session: None,
            origin_set: false,
            released: false,
            provisioning_pending: false,
            holds_provisioning_slot: false,
            provisioning_slot_release_due: false,
            reset_credentials_pending: false,
            deferrer: None,
        }
    }
}

struct Shared {
    this: Weak<Shared>,
    scheme: Uuid,
    requires_media_crypto: bool,
    features: PlatformFeatures,
    platform: Arc<dyn DrmPlatform>,
    storage: Arc<dyn LicenseStorage>,
    client: Arc<dyn DrmClient>,
    coordinator: Arc<ProvisioningCoordinator>,
    registry: SessionRegistry,
    state: Mutex<EngineState>,
    /// Client callbacks waiting for the state lock to be dropped.
    outbox: Mutex<CallbackQueue>,
}

/// Handle to a DRM engine. Clones share the same engine.
#[derive(Clone)]
pub struct DrmEngine {
    shared: Arc<Shared>,
}

impl fmt::Debug for DrmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmEngine")
            .field("scheme", &self.shared.scheme)
            .field("requires_media_crypto", &self.shared.requires_media_crypto)
            .finish_non_exhaustive()
    }
}

impl DrmEngine {
    /// Whether the platform supports `scheme`, optionally for a container
    /// mime type (empty for any).
    pub fn is_scheme_supported(
        platform: &dyn DrmPlatform,
        scheme: Uuid,
        container_mime_type: &str,
    ) -> bool {
        let mime_type = (!container_mime_type.is_empty()).then_some(container_mime_type);
        platform.is_scheme_supported(scheme, mime_type)
    }

    /// Create an engine for `config.scheme`.
    ///
    /// When MediaCrypto is required the crypto session is opened right away;
    /// an unprovisioned device starts (or queues for) provisioning and the
    /// handle is delivered later through `on_media_crypto_ready`.
    pub fn create(config: &DrmConfig, env: DrmEnvironment) -> Result<Self> {
        info!("Creating DRM engine for scheme {}", config.scheme);
        if !env.platform.is_scheme_supported(config.scheme, None) {
            return Err(Error::UnsupportedScheme(config.scheme));
        }

        let mut drm = env.platform.create_media_drm(config.scheme)?;
        if is_widevine(config.scheme) {
            let enabled = drm
                .set_property_string(PROPERTY_PRIVACY_MODE, "enable")
                .and_then(|()| drm.set_property_string(PROPERTY_SESSION_SHARING, "enable"));
            if let Err(e) = enabled {
                error!("Failed to configure Widevine engine: {}", e);
                drm.release();
                return Err(e);
            }
        }

        let features = env.platform.features();
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            scheme: config.scheme,
            requires_media_crypto: config.requires_media_crypto,
            features,
            registry: SessionRegistry::new(env.storage.clone()),
            platform: env.platform,
            storage: env.storage,
            client: env.client,
            coordinator: env.coordinator,
            state: Mutex::new(EngineState::new(drm)),
            outbox: Mutex::new(CallbackQueue::new()),
        });
        let engine = Self { shared };

        if config.security_level != SecurityLevel::Default {
            if let Err(e) = engine.set_security_level(config.security_level) {
                error!("Failed to set security level {}: {}", config.security_level, e);
                engine.destroy();
                return Err(e);
            }
        }

        if !config.origin.is_empty() {
            if let Err(e) = engine.set_origin(&config.origin) {
                error!("Failed to set origin: {}", e);
                engine.destroy();
                return Err(e);
            }
        }

        if config.requires_media_crypto && !engine.create_media_crypto() {
            return Err(Error::MediaCryptoUnavailable(
                "failed to create MediaCrypto".to_string(),
            ));
        }

        Ok(engine)
    }

    fn upgrade(this: &Weak<Shared>) -> Option<Self> {
        this.upgrade().map(|shared| Self { shared })
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Run `f` under the state lock, then deliver the client callbacks it
    /// queued and hand the provisioning slot back if `f` finished a round.
    /// Both may re-enter engines, so the lock must be free.
    fn with_state<R>(&self, f: impl FnOnce(&Shared, &mut EngineState) -> R) -> R {
        let shared = &*self.shared;
        let (result, release_slot) = {
            let mut state = shared.lock();
            let result = f(shared, &mut state);
            let release_slot = std::mem::take(&mut state.provisioning_slot_release_due);
            (result, release_slot)
        };
        let mut callbacks = std::mem::take(&mut *shared.outbox());
        callbacks.run_all();
        if release_slot {
            debug!("Provisioning round finished, releasing slot");
            if let Err(e) = shared.coordinator.on_provision_done() {
                warn!("Provisioning slot release failed: {}", e);
            }
        }
        result
    }

    pub fn scheme(&self) -> Uuid {
        self.shared.scheme
    }

    pub fn status(&self) -> EngineStatus {
        self.with_state(|shared, state| {
            if state.released {
                EngineStatus::Released
            } else if state.provisioning_pending {
                EngineStatus::Provisioning
            } else if shared.requires_media_crypto && state.media_crypto.is_none() {
                EngineStatus::AwaitingMediaCrypto
            } else {
                EngineStatus::Ready
            }
        })
    }

    /// The decryption handle, once created.
    pub fn media_crypto(&self) -> Option<Arc<dyn MediaCrypto>> {
        self.with_state(|_, state| state.media_crypto.clone())
    }

    /// Application-visible sessions.
    pub fn all_session_ids(&self) -> Vec<SessionId> {
        self.shared.registry.all_session_ids()
    }

    fn set_security_level(&self, level: SecurityLevel) -> Result<()> {
        self.with_state(|shared, state| {
            if !is_widevine(shared.scheme) {
                debug!("Security level is not supported");
                return Ok(());
            }
            let drm = state.drm.as_mut().ok_or(Error::Released)?;
            let current = drm.get_property_string(PROPERTY_SECURITY_LEVEL)?;
            debug!("Security level: current {}, new {}", current, level);
            if current == level.as_str() {
                return Ok(());
            }
            drm.set_property_string(PROPERTY_SECURITY_LEVEL, level.as_str())
        })
    }

    fn set_origin(&self, origin: &str) -> Result<()> {
        self.with_state(|shared, state| {
            if !is_widevine(shared.scheme) || !shared.features.origin_isolation {
                debug!("Origin isolated storage is not supported");
                return Ok(());
            }
            let drm = state.drm.as_mut().ok_or(Error::Released)?;
            drm.set_property_string(PROPERTY_ORIGIN, origin)?;
            state.origin_set = true;
            Ok(())
        })
    }

    /// Set the license server certificate used for privacy mode.
    pub fn set_server_certificate(&self, certificate: &[u8]) -> Result<()> {
        self.with_state(|shared, state| {
            let drm = state.drm.as_mut().ok_or(Error::Released)?;
            if !is_widevine(shared.scheme) {
                debug!("Setting server certificate is not supported");
                return Ok(());
            }
            drm.set_property_byte_array(PROPERTY_SERVICE_CERTIFICATE, certificate)
                .map_err(|e| {
                    error!("Failed to set server certificate: {}", e);
                    e
                })
        })
    }

    /// Security level reported by the engine; `None` when released or not Widevine.
    pub fn security_level(&self) -> Option<String> {
        self.with_state(|shared, state| {
            if !is_widevine(shared.scheme) {
                return None;
            }
            let drm = state.drm.as_ref()?;
            match drm.get_property_string(PROPERTY_SECURITY_LEVEL) {
                Ok(level) => Some(level),
                Err(e) => {
                    error!("Failed to read security level: {}", e);
                    None
                }
            }
        })
    }

    fn create_media_crypto(&self) -> bool {
        self.with_state(|shared, state| shared.create_media_crypto(state))
    }

    /// Re-provision the device certificate. Completion is reported through
    /// `on_reset_device_credentials_completed`.
    pub fn reset_device_credentials(&self) {
        debug!("reset_device_credentials()");
        self.with_state(|shared, state| {
            if state.released {
                shared.notify(|client| client.on_reset_device_credentials_completed(false));
                return;
            }
            if state.provisioning_pending || state.reset_credentials_pending {
                warn!("Provisioning already pending, cannot reset credentials");
                shared.notify(|client| client.on_reset_device_credentials_completed(false));
                return;
            }
            state.reset_credentials_pending = true;
            shared.request_provisioning(state, ProvisioningPurpose::ResetCredentials);
        });
    }

    /// Remove the origin-bound device certificate.
    pub fn unprovision(&self) {
        debug!("unprovision()");
        self.with_state(|shared, state| {
            if state.drm.is_none() || !state.origin_set {
                return;
            }
            shared.provide_provision_response(state, UNPROVISION_RESPONSE);
        });
    }

    /// Release the engine. Safe to call in any state, any number of times.
    pub fn destroy(&self) {
        self.with_state(|shared, state| shared.release(state));
    }

    /// Feed the provisioning server's answer back into the engine.
    ///
    /// `is_response_received` is false when the request could not be sent or
    /// answered; `response` is ignored then.
    pub fn process_provision_response(&self, is_response_received: bool, response: &[u8]) {
        debug!("process_provision_response()");
        let provisioned = self.with_state(|shared, state| {
            if state.released {
                return None;
            }
            if !state.provisioning_pending {
                warn!("Unexpected provision response");
                return None;
            }
            state.provisioning_pending = false;

            let success = is_response_received && shared.provide_provision_response(state, response);

            if state.reset_credentials_pending {
                state.reset_credentials_pending = false;
                shared.notify(move |client| {
                    client.on_reset_device_credentials_completed(success)
                });
                shared.release_provisioning_slot(state);
                return None;
            }
            Some(success)
        });

        let Some(success) = provisioned else {
            return;
        };
        self.on_provisioned(success);
        // Only after on_provisioned: a failure there must not keep other
        // engines waiting for the slot.
        self.with_state(|shared, state| shared.release_provisioning_slot(state));
    }

    fn on_provisioned(&self, success: bool) {
        enum Next {
            Stop,
            CreateMediaCrypto,
            NotifyStorage,
        }

        let next = self.with_state(|shared, state| {
            if !success {
                error!("Provisioning failed");
                shared.release(state);
                return Next::Stop;
            }
            if !shared.requires_media_crypto {
                return Next::Stop;
            }
            if state.origin_set {
                Next::NotifyStorage
            } else {
                Next::CreateMediaCrypto
            }
        });

        match next {
            Next::Stop => {}
            Next::CreateMediaCrypto => {
                self.create_media_crypto();
            }
            Next::NotifyStorage => {
                let this = self.downgrade();
                self.shared.storage.on_provisioned(Box::new(move |ok| {
                    let Some(engine) = DrmEngine::upgrade(&this) else {
                        return;
                    };
                    if !ok {
                        error!("Failed to record origin provisioning in storage");
                        engine.destroy();
                        return;
                    }
                    engine.create_media_crypto();
                }));
            }
        }
    }

    /// Open a session and generate its first license request.
    ///
    /// Resolves with the new session id, then emits the request as a session
    /// message.
    pub fn create_session(
        &self,
        init_data: &[u8],
        mime_type: &str,
        key_type: KeyType,
        optional_parameters: &HashMap<String, String>,
        promise_id: PromiseId,
    ) {
        debug!("create_session()");
        self.with_state(|shared, state| {
            shared.create_session(
                state,
                init_data,
                mime_type,
                key_type,
                optional_parameters,
                promise_id,
            )
        });
    }

    /// Apply a license server response to a session.
    pub fn update_session(&self, exchange_id: &[u8], response: &[u8], promise_id: PromiseId) {
        enum Next {
            Done,
            SavePersistentId(SessionId, Vec<u8>),
            ClearPersistent(SessionId),
        }

        debug!("update_session()");
        let next = self.with_state(|shared, state| {
            let Some(drm) = state.drm.as_mut() else {
                shared.reject(promise_id, Error::Released);
                return Next::Done;
            };
            let Some(info) = shared.registry.get_by_exchange_id(exchange_id) else {
                shared.reject(promise_id, Error::InvalidSession(exchange_id.to_vec()));
                return Next::Done;
            };

            let session_id = info.session_id().clone();
            let is_key_release = info.key_type() == KeyType::Release;
            let scope_id = if is_key_release {
                session_id.persistent_id()
            } else {
                session_id.engine_id()
            };
            let result = match scope_id {
                Some(scope_id) => drm.provide_key_response(scope_id, response),
                None => Err(Error::IllegalState(format!(
                    "session {} has no {} id",
                    session_id.to_hex(),
                    if is_key_release { "persistent" } else { "engine" }
                ))),
            };

            match result {
                Err(e) => {
                    error!("Failed to provide key response for {}: {}", session_id.to_hex(), e);
                    shared.reject(promise_id, e);
                    shared.release(state);
                    Next::Done
                }
                Ok(_) if is_key_release => Next::ClearPersistent(session_id),
                Ok(Some(persistent_id))
                    if info.key_type() == KeyType::Offline
                        && !persistent_id.is_empty()
                        && session_id.persistent_id().is_none() =>
                {
                    Next::SavePersistentId(session_id, persistent_id)
                }
                Ok(_) => {
                    shared.on_key_updated(state, &session_id, promise_id, false, true);
                    Next::Done
                }
            }
        });

        let this = self.downgrade();
        let stored = match next {
            Next::Done => return,
            Next::SavePersistentId(session_id, persistent_id) => {
                let target = session_id.clone();
                self.shared.registry.set_persistent_id(
                    &session_id,
                    persistent_id,
                    Box::new(move |ok| {
                        if let Some(engine) = DrmEngine::upgrade(&this) {
                            engine.with_state(|shared, state| {
                                shared.on_key_updated(state, &target, promise_id, false, ok)
                            });
                        }
                    }),
                )
            }
            Next::ClearPersistent(session_id) => {
                let target = session_id.clone();
                self.shared.registry.clear_persistent(
                    &session_id,
                    Box::new(move |ok| {
                        if let Some(engine) = DrmEngine::upgrade(&this) {
                            engine.with_state(|shared, state| {
                                shared.on_key_updated(state, &target, promise_id, true, ok)
                            });
                        }
                    }),
                )
            }
        };
        if let Err(e) = stored {
            self.with_state(|shared, _| shared.reject(promise_id, e));
        }
    }

    /// Restore a persisted license into a new session.
    ///
    /// A missing or no longer valid license resolves with [`SessionId::empty`].
    pub fn load_session(&self, exchange_id: &[u8], promise_id: PromiseId) {
        debug!("load_session()");
        let live = self.with_state(|shared, state| {
            if state.released {
                shared.reject(promise_id, Error::Released);
                return false;
            }
            true
        });
        if !live {
            return;
        }

        let this = self.downgrade();
        self.shared.registry.load(
            exchange_id,
            Box::new(move |loaded| {
                let Some(engine) = DrmEngine::upgrade(&this) else {
                    return;
                };
                match loaded {
                    Some(session_id) => engine.load_session_from_storage(session_id, promise_id),
                    None => engine.with_state(|shared, _| shared.resolve_missing(promise_id)),
                }
            }),
        );
    }

    fn load_session_from_storage(&self, session_id: SessionId, promise_id: PromiseId) {
        let invalid = self.with_state(|shared, state| {
            shared.restore_session(state, session_id, promise_id)
        });
        let Some(session_id) = invalid else {
            return;
        };

        let this = self.downgrade();
        let target = session_id.clone();
        let cleared = self.shared.registry.clear_persistent(
            &session_id,
            Box::new(move |ok| {
                if !ok {
                    warn!("Failed to clear invalid persistent license {}", target.to_hex());
                }
                if let Some(engine) = DrmEngine::upgrade(&this) {
                    engine.with_state(|shared, _| {
                        let _ = shared.registry.remove(&target);
                        shared.resolve_missing(promise_id);
                    });
                }
            }),
        );
        if let Err(e) = cleared {
            warn!("Failed to clear invalid persistent license: {}", e);
            self.with_state(|shared, _| {
                let _ = shared.registry.remove(&session_id);
                shared.resolve_missing(promise_id);
            });
        }
    }

    /// Start releasing an offline license.
    ///
    /// Resolves, then emits the key release request as a session message.
    pub fn remove_session(&self, exchange_id: &[u8], promise_id: PromiseId) {
        debug!("remove_session()");
        self.with_state(|shared, state| shared.remove_session(state, exchange_id, promise_id));
    }

    /// Close a session; key removal is best effort.
    pub fn close_session(&self, exchange_id: &[u8], promise_id: PromiseId) {
        debug!("close_session()");
        self.with_state(|shared, state| shared.close_session(state, exchange_id, promise_id));
    }

    /// Deliver events buffered by the platform engine.
    pub fn dispatch_platform_events(&self) {
        self.with_state(|shared, state| shared.pump_events(state));
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> MutexGuard<'_, CallbackQueue> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a client callback; it runs once the state lock is dropped.
    fn notify<F>(&self, callback: F)
    where
        F: FnOnce(&dyn DrmClient) + Send + 'static,
    {
        let client = self.client.clone();
        self.outbox().push(move || callback(client.as_ref()));
    }

    fn reject(&self, promise_id: PromiseId, error: Error) {
        warn!("Promise {} rejected: {}", promise_id, error);
        self.notify(move |client| client.on_promise_rejected(promise_id, &error));
    }

    fn resolve(&self, promise_id: PromiseId) {
        self.notify(move |client| client.on_promise_resolved(promise_id));
    }

    fn resolve_with_session(&self, promise_id: PromiseId, session_id: &SessionId) {
        let session_id = session_id.clone();
        self.notify(move |client| client.on_promise_resolved_with_session(promise_id, &session_id));
    }

    fn resolve_missing(&self, promise_id: PromiseId) {
        debug!("Persistent license does not exist");
        self.resolve_with_session(promise_id, &SessionId::empty());
    }

    fn session_closed(&self, session_id: &SessionId) {
        let session_id = session_id.clone();
        self.notify(move |client| client.on_session_closed(&session_id));
    }

    /// Report a single status for the whole session, for platforms without
    /// per-key status events.
    fn placeholder_keys_change(
        &self,
        session_id: &SessionId,
        status: KeyStatusCode,
        is_key_release: bool,
    ) {
        let session_id = session_id.clone();
        let keys = KeyStatus::placeholder(status);
        let usable = has_usable_key(&keys);
        self.notify(move |client| {
            client.on_session_keys_change(&session_id, &keys, usable, is_key_release)
        });
    }

    fn release_provisioning_slot(&self, state: &mut EngineState) {
        if state.holds_provisioning_slot {
            state.holds_provisioning_slot = false;
            state.provisioning_slot_release_due = true;
        }
    }

    fn create_media_crypto(&self, state: &mut EngineState) -> bool {
        debug!("create_media_crypto()");
        if state.released {
            return false;
        }
        if state.crypto_session.is_some() {
            return true;
        }
        let Some(drm) = state.drm.as_mut() else {
            return false;
        };

        let engine_id = match drm.open_session() {
            Ok(engine_id) => engine_id,
            Err(e) if e.is_not_provisioned() => {
                debug!("Not provisioned during open_session()");
                return self.request_provisioning(state, ProvisioningPurpose::MediaCrypto);
            }
            Err(e) => {
                error!("Cannot open MediaCrypto session: {}", e);
                self.release(state);
                return false;
            }
        };

        let crypto_session = SessionId::temporary(engine_id);
        debug!("MediaCrypto session opened: {}", crypto_session.to_hex());
        state.crypto_session = Some(crypto_session.clone());

        match self
            .platform
            .create_media_crypto(self.scheme, crypto_session.exchange_id())
        {
            Ok(media_crypto) => {
                state.media_crypto = Some(media_crypto.clone());
                self.notify(move |client| client.on_media_crypto_ready(Some(media_crypto)));
                true
            }
            Err(e) => {
                error!("Cannot create MediaCrypto: {}", e);
                self.release(state);
                false
            }
        }
    }

    /// Take the process-wide provisioning slot, or queue a retry behind the
    /// engine that holds it.
    fn request_provisioning(&self, state: &mut EngineState, purpose: ProvisioningPurpose) -> bool {
        let this = self.this.clone();
        let slot = self.coordinator.acquire_or_defer(move || {
            if let Some(engine) = DrmEngine::upgrade(&this) {
                engine.resume_after_provisioning(purpose);
            }
        });
        match slot {
            ProvisionSlot::Acquired => {
                state.holds_provisioning_slot = true;
                self.start_provisioning(state)
            }
            ProvisionSlot::Deferred => {
                debug!("Another engine is provisioning, deferring {:?}", purpose);
                true
            }
        }
    }

    fn start_provisioning(&self, state: &mut EngineState) -> bool {
        debug!("start_provisioning()");
        let Some(drm) = state.drm.as_mut() else {
            self.release_provisioning_slot(state);
            return false;
        };
        match drm.get_provision_request() {
            Ok(request) => {
                state.provisioning_pending = true;
                self.notify(move |client| {
                    client.on_start_provisioning(&request.default_url, &request.data)
                });
                true
            }
            Err(e) => {
                error!("Failed to get provision request: {}", e);
                self.release(state);
                false
            }
        }
    }

    fn provide_provision_response(&self, state: &mut EngineState, response: &[u8]) -> bool {
        if response.is_empty() {
            error!("Invalid provision response");
            return false;
        }
        let Some(drm) = state.drm.as_mut() else {
            return false;
        };
        match drm.provide_provision_response(response) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to provide provision response: {}", e);
                false
            }
        }
    }

    fn create_session(
        &self,
        state: &mut EngineState,
        init_data: &[u8],
        mime_type: &str,
        key_type: KeyType,
        optional_parameters: &HashMap<String, String>,
        promise_id: PromiseId,
    ) {
        if key_type == KeyType::Release {
            self.reject(promise_id, Error::InvalidKeyType(key_type.to_string()));
            return;
        }
        let Some(drm) = state.drm.as_mut() else {
            self.reject(promise_id, Error::Released);
            return;
        };

        let engine_id = match drm.open_session() {
            Ok(engine_id) => engine_id,
            Err(e) => {
                error!("Open session failed: {}", e);
                self.reject(promise_id, e);
                return;
            }
        };
        let session_id = match key_type {
            KeyType::Offline => SessionId::persistent(engine_id),
            _ => SessionId::temporary(engine_id),
        };

        let request = match get_key_request(
            drm.as_mut(),
            &session_id,
            Some(init_data),
            mime_type,
            key_type,
            optional_parameters,
        ) {
            Ok(request) => request,
            Err(e) => {
                error!("Generate request failed: {}", e);
                close_session_quietly(drm.as_mut(), &session_id);
                self.reject(promise_id, e);
                return;
            }
        };

        if let Err(e) = self.registry.put(session_id.clone(), mime_type, key_type) {
            close_session_quietly(drm.as_mut(), &session_id);
            self.reject(promise_id, e);
            return;
        }

        debug!("Session created: {} ({})", session_id.to_hex(), key_type);
        self.resolve_with_session(promise_id, &session_id);
        self.emit_session_message(&session_id, request);
        self.pump_events(state);
    }

    fn on_key_updated(
        &self,
        state: &mut EngineState,
        session_id: &SessionId,
        promise_id: PromiseId,
        is_key_release: bool,
        success: bool,
    ) {
        if !success {
            self.reject(
                promise_id,
                Error::Storage("failed to update key after response accepted".to_string()),
            );
            return;
        }

        debug!(
            "Key successfully {} for session {}",
            if is_key_release { "released" } else { "added" },
            session_id.to_hex()
        );
        self.resolve(promise_id);

        if is_key_release {
            self.finish_key_release(state, session_id);
        } else if !self.features.key_status_listener {
            self.placeholder_keys_change(session_id, KeyStatusCode::Usable, false);
        }
        self.pump_events(state);
    }

    /// The server acknowledged the license release; the session ends here.
    fn finish_key_release(&self, state: &mut EngineState, session_id: &SessionId) {
        let Ok(info) = self.registry.remove(session_id) else {
            return;
        };
        if let Some(drm) = state.drm.as_mut() {
            close_session_quietly(drm.as_mut(), info.session_id());
        }
        self.session_closed(info.session_id());
    }

    /// Open an engine session for a stored license and restore its keys.
    ///
    /// Returns the session when its persisted license turned out to be
    /// invalid and must be cleared from storage.
    fn restore_session(
        &self,
        state: &mut EngineState,
        mut session_id: SessionId,
        promise_id: PromiseId,
    ) -> Option<SessionId> {
        let Some(drm) = state.drm.as_mut() else {
            let _ = self.registry.remove(&session_id);
            self.reject(promise_id, Error::Released);
            return None;
        };

        let engine_id = match drm.open_session() {
            Ok(engine_id) => engine_id,
            Err(e) => {
                error!("Failed to open session to load license: {}", e);
                let _ = self.registry.remove(&session_id);
                self.reject(promise_id, e);
                return None;
            }
        };
        if let Err(e) = self.registry.set_engine_id(&session_id, engine_id.clone()) {
            if let Err(e) = drm.close_session(&engine_id) {
                warn!("Failed to close session: {}", e);
            }
            self.reject(promise_id, e);
            return None;
        }
        session_id.set_engine_id(engine_id.clone());
        let persistent_id = session_id.persistent_id().map(<[u8]>::to_vec).unwrap_or_default();

        state.deferrer = Some(EventDeferrer::new(session_id.clone()));
        match drm.restore_keys(&engine_id, &persistent_id) {
            Ok(()) => {
                self.pump_events(state);
                self.resolve_with_session(promise_id, &session_id);
                if let Some(mut deferrer) = state.deferrer.take() {
                    deferrer.fire(&mut self.outbox());
                }
                if !self.features.key_status_listener {
                    self.placeholder_keys_change(&session_id, KeyStatusCode::Usable, false);
                }
                None
            }
            Err(e) if e.is_not_provisioned() => {
                state.deferrer = None;
                error!("Device not provisioned while loading {}", session_id.to_hex());
                if let Some(drm) = state.drm.as_mut() {
                    close_session_quietly(drm.as_mut(), &session_id);
                }
                let _ = self.registry.remove(&session_id);
                self.reject(promise_id, Error::NotProvisioned);
                None
            }
            Err(e) => {
                state.deferrer = None;
                warn!("Persistent license {} is no longer valid: {}", session_id.to_hex(), e);
                if let Some(drm) = state.drm.as_mut() {
                    close_session_quietly(drm.as_mut(), &session_id);
                }
                Some(session_id)
            }
        }
    }

    fn remove_session(&self, state: &mut EngineState, exchange_id: &[u8], promise_id: PromiseId) {
        let Some(drm) = state.drm.as_mut() else {
            self.reject(promise_id, Error::Released);
            return;
        };
        let Some(info) = self.registry.get_by_exchange_id(exchange_id) else {
            self.reject(promise_id, Error::InvalidSession(exchange_id.to_vec()));
            return;
        };
        if info.key_type() != KeyType::Offline {
            self.reject(
                promise_id,
                Error::NotSupported("removing a temporary session".to_string()),
            );
            return;
        }
        if info.session_id().persistent_id().is_none() {
            self.reject(
                promise_id,
                Error::IllegalState("no persisted license to remove".to_string()),
            );
            return;
        }
        if let Err(e) = self.registry.mark_released(info.session_id()) {
            self.reject(promise_id, e);
            return;
        }

        match get_key_request(
            drm.as_mut(),
            info.session_id(),
            None,
            info.mime_type(),
            KeyType::Release,
            &HashMap::new(),
        ) {
            Ok(request) => {
                self.resolve(promise_id);
                self.emit_session_message(info.session_id(), request);
            }
            Err(e) => {
                error!("Failed to generate key release request: {}", e);
                self.reject(promise_id, e);
            }
        }
    }

    fn close_session(&self, state: &mut EngineState, exchange_id: &[u8], promise_id: PromiseId) {
        let Some(drm) = state.drm.as_mut() else {
            self.reject(promise_id, Error::Released);
            return;
        };
        let Some(info) = self.registry.get_by_exchange_id(exchange_id) else {
            self.reject(promise_id, Error::InvalidSession(exchange_id.to_vec()));
            return;
        };

        let session_id = info.session_id();
        remove_keys_quietly(drm.as_mut(), session_id);
        close_session_quietly(drm.as_mut(), session_id);
        let _ = self.registry.remove(session_id);

        self.resolve(promise_id);
        self.session_closed(session_id);
    }

    fn emit_session_message(&self, session_id: &SessionId, request: KeyRequest) {
        let request_type = request.message_type(self.features.request_type);
        trace!("Session message {:?} for {}", request_type, session_id.to_hex());
        let session_id = session_id.clone();
        self.notify(move |client| {
            client.on_session_message(&session_id, request_type, &request.data)
        });
    }

    fn pump_events(&self, state: &mut EngineState) {
        while let Some(event) = state.drm.as_mut().and_then(|drm| drm.poll_event()) {
            self.handle_event(state, event);
        }
    }

    fn session_for_event(&self, engine_id: &[u8]) -> Option<SessionInfo> {
        let info = self.registry.get_by_engine_id(engine_id);
        if info.is_none() {
            debug!("Event for unknown session {}", hex::encode(engine_id));
        }
        info
    }

    /// Queue `handler` for delivery now, or after the in-flight load of
    /// `session_id` resolved.
    fn defer_if_needed<F>(&self, state: &mut EngineState, session_id: &SessionId, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match state.deferrer.as_mut() {
            Some(deferrer) if deferrer.should_defer(session_id) => deferrer.defer(handler),
            _ => self.outbox().push(handler),
        }
    }

    fn handle_event(&self, state: &mut EngineState, event: MediaDrmEvent) {
        match event {
            MediaDrmEvent::KeyStatusChange {
                engine_id,
                keys,
                has_new_usable_key,
            } => {
                let Some(info) = self.session_for_event(&engine_id) else {
                    return;
                };
                let is_key_release = info.key_type() == KeyType::Release;
                let session_id = info.session_id().clone();
                let client = self.client.clone();
                let target = session_id.clone();
                self.defer_if_needed(state, &session_id, move || {
                    client.on_session_keys_change(&target, &keys, has_new_usable_key, is_key_release)
                });
            }
            MediaDrmEvent::ExpirationUpdate {
                engine_id,
                expiration_ms,
            } => {
                let Some(info) = self.session_for_event(&engine_id) else {
                    return;
                };
                let session_id = info.session_id().clone();
                let client = self.client.clone();
                let target = session_id.clone();
                self.defer_if_needed(state, &session_id, move || {
                    client.on_session_expiration_update(&target, expiration_ms)
                });
            }
            MediaDrmEvent::KeyRequired { engine_id, data } => {
                let Some(info) = self.session_for_event(&engine_id) else {
                    return;
                };
                let Some(drm) = state.drm.as_mut() else {
                    return;
                };
                match get_key_request(
                    drm.as_mut(),
                    info.session_id(),
                    Some(&data),
                    info.mime_type(),
                    info.key_type(),
                    &HashMap::new(),
                ) {
                    Ok(request) => self.emit_session_message(info.session_id(), request),
                    Err(e) => {
                        error!("Failed to build renewal request: {}", e);
                        if !self.features.key_status_listener {
                            self.placeholder_keys_change(
                                info.session_id(),
                                KeyStatusCode::InternalError,
                                info.key_type() == KeyType::Release,
                            );
                        }
                    }
                }
            }
            MediaDrmEvent::KeyExpired { engine_id } => {
                let Some(info) = self.session_for_event(&engine_id) else {
                    return;
                };
                debug!("Keys expired for {}", info.session_id().to_hex());
                if !self.features.key_status_listener {
                    self.placeholder_keys_change(
                        info.session_id(),
                        KeyStatusCode::Expired,
                        info.key_type() == KeyType::Release,
                    );
                }
            }
            MediaDrmEvent::VendorDefined { engine_id } => {
                debug!("Vendor defined event for {}", hex::encode(engine_id));
            }
            MediaDrmEvent::SessionLostState { engine_id } => {
                warn!("Session {} lost its state", hex::encode(engine_id));
            }
            MediaDrmEvent::ProvisionRequired => {
                debug!("Provision required event ignored, provisioning runs on demand");
            }
        }
    }

    fn release(&self, state: &mut EngineState) {
        if state.released {
            return;
        }
        info!("Releasing DRM engine");
        state.released = true;

        for session_id in self.registry.all_session_ids() {
            if let Some(drm) = state.drm.as_mut() {
                remove_keys_quietly(drm.as_mut(), &session_id);
                close_session_quietly(drm.as_mut(), &session_id);
            }
            self.session_closed(&session_id);
        }
        self.registry.clear();

        if let Some(crypto_session) = state.crypto_session.take() {
            if let Some(drm) = state.drm.as_mut() {
                close_session_quietly(drm.as_mut(), &crypto_session);
            }
        }

        if state.reset_credentials_pending {
            state.reset_credentials_pending = false;
            self.notify(|client| client.on_reset_device_credentials_completed(false));
        }

        state.deferrer = None;
        state.provisioning_pending = false;
        self.release_provisioning_slot(state);

        if let Some(mut drm) = state.drm.take() {
            drm.release();
        }

        match state.media_crypto.take() {
            Some(media_crypto) => media_crypto.release(),
            // The pipeline is still waiting for a handle.
            None => self.notify(|client| client.on_media_crypto_ready(None)),
        }
    }
}

impl DrmEngine {
    fn resume_after_provisioning(&self, purpose: ProvisioningPurpose) {
        debug!("Resuming {:?} after another engine's provisioning", purpose);
        match purpose {
            ProvisioningPurpose::MediaCrypto => {
                self.create_media_crypto();
            }
            ProvisioningPurpose::ResetCredentials => self.with_state(|shared, state| {
                if state.released || !state.reset_credentials_pending || state.provisioning_pending {
                    return;
                }
                shared.request_provisioning(state, ProvisioningPurpose::ResetCredentials);
            }),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut drm) = state.drm.take() {
            drm.release();
        }
        if let Some(media_crypto) = state.media_crypto.take() {
            media_crypto.release();
        }
        if state.holds_provisioning_slot || state.provisioning_slot_release_due {
            state.holds_provisioning_slot = false;
            state.provisioning_slot_release_due = false;
            if let Err(e) = self.coordinator.on_provision_done() {
                warn!("Provisioning slot release failed: {}", e);
            }
        }
    }
}

fn get_key_request(
    drm: &mut dyn MediaDrm,
    session_id: &SessionId,
    init_data: Option<&[u8]>,
    mime_type: &str,
    key_type: KeyType,
    optional_parameters: &HashMap<String, String>,
) -> Result<KeyRequest> {
    let scope_id = if key_type == KeyType::Release {
        session_id.persistent_id()
    } else {
        session_id.engine_id()
    }
    .ok_or_else(|| {
        Error::IllegalState(format!(
            "session {} cannot request {} keys",
            session_id.to_hex(),
            key_type
        ))
    })?;

    let request = drm.get_key_request(scope_id, init_data, mime_type, key_type, optional_parameters);
    debug!(
        "get_key_request {}",
        if request.is_ok() { "succeeded" } else { "failed" }
    );
    request
}

fn remove_keys_quietly(drm: &mut dyn MediaDrm, session_id: &SessionId) {
    if let Some(engine_id) = session_id.engine_id() {
        if let Err(e) = drm.remove_keys(engine_id) {
            warn!("Failed to remove keys of {}: {}", session_id.to_hex(), e);
        }
    }
}

fn close_session_quietly(drm: &mut dyn MediaDrm, session_id: &SessionId) {
    if let Some(engine_id) = session_id.engine_id() {
        if let Err(e) = drm.close_session(engine_id) {
            warn!("Failed to close session {}: {}", session_id.to_hex(), e);
        }
    }
}
