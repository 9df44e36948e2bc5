//! In-process fakes of the platform DRM stack, the pipeline client and
//! license storage, shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::callbacks::CallbackQueue;
use crate::client::{DrmClient, PromiseId};
use crate::config::PlatformFeatures;
use crate::error::{Error, Result};
use crate::key::{KeyRequest, KeyRequestType, KeyStatus, KeyStatusCode};
use crate::platform::{
    DrmPlatform, MediaCrypto, MediaDrm, MediaDrmEvent, ProvisionRequest, CLEARKEY_UUID,
    PROPERTY_SECURITY_LEVEL, UNPROVISION_RESPONSE, WIDEVINE_UUID,
};
use crate::session::{KeyType, SessionId};
use crate::storage::{LicenseStorage, MemoryStorage, PersistentInfo, StorageCallback};

pub(crate) const LICENSE_URL: &str = "https://license.test/widevine";
pub(crate) const PROVISIONING_URL: &str = "https://provisioning.test/certificate";
pub(crate) const KEY_ID: &[u8] = b"kid-0001";
pub(crate) const EXPIRATION_MS: i64 = 1_700_000_000_000;

/// State of the simulated device, shared by every engine of a [`FakePlatform`].
#[derive(Debug)]
pub(crate) struct FakeDevice {
    pub provisioned: bool,
    pub key_status_events: bool,
    pub key_request_url: String,
    pub fail_get_key_request: bool,
    pub fail_remove_keys: bool,
    next_session: u32,
    pub open_sessions: HashSet<Vec<u8>>,
    session_key_types: HashMap<Vec<u8>, KeyType>,
    /// Persisted licenses by persistent id.
    pub licenses: HashSet<Vec<u8>>,
    pub properties: HashMap<String, String>,
    pub byte_properties: HashMap<String, Vec<u8>>,
    pub events: VecDeque<MediaDrmEvent>,
    pub removed_keys: Vec<Vec<u8>>,
    pub provision_requests: usize,
    pub released_engines: usize,
}

impl FakeDevice {
    fn new(provisioned: bool, key_status_events: bool) -> Self {
        let mut properties = HashMap::new();
        properties.insert(PROPERTY_SECURITY_LEVEL.to_string(), "L1".to_string());
        Self {
            provisioned,
            key_status_events,
            key_request_url: LICENSE_URL.to_string(),
            fail_get_key_request: false,
            fail_remove_keys: false,
            next_session: 0,
            open_sessions: HashSet::new(),
            session_key_types: HashMap::new(),
            licenses: HashSet::new(),
            properties,
            byte_properties: HashMap::new(),
            events: VecDeque::new(),
            removed_keys: Vec::new(),
            provision_requests: 0,
            released_engines: 0,
        }
    }

    fn push_key_events(&mut self, engine_id: &[u8], with_expiration: bool) {
        if !self.key_status_events {
            return;
        }
        self.events.push_back(MediaDrmEvent::KeyStatusChange {
            engine_id: engine_id.to_vec(),
            keys: vec![KeyStatus::new(KEY_ID.to_vec(), KeyStatusCode::Usable)],
            has_new_usable_key: true,
        });
        if with_expiration {
            self.events.push_back(MediaDrmEvent::ExpirationUpdate {
                engine_id: engine_id.to_vec(),
                expiration_ms: EXPIRATION_MS,
            });
        }
    }
}

type SharedDevice = Arc<Mutex<FakeDevice>>;

pub(crate) struct FakePlatform {
    device: SharedDevice,
    features: PlatformFeatures,
    fail_media_crypto: AtomicBool,
    pub media_cryptos: Mutex<Vec<Arc<FakeMediaCrypto>>>,
}

impl FakePlatform {
    pub fn new(provisioned: bool) -> Arc<Self> {
        Self::with_features(provisioned, PlatformFeatures::default())
    }

    pub fn legacy(provisioned: bool) -> Arc<Self> {
        Self::with_features(provisioned, PlatformFeatures::legacy())
    }

    pub fn with_features(provisioned: bool, features: PlatformFeatures) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::new(Mutex::new(FakeDevice::new(
                provisioned,
                features.key_status_listener,
            ))),
            features,
            fail_media_crypto: AtomicBool::new(false),
            media_cryptos: Mutex::new(Vec::new()),
        })
    }

    pub fn device(&self) -> MutexGuard<'_, FakeDevice> {
        self.device.lock().unwrap()
    }

    pub fn fail_media_crypto(&self, fail: bool) {
        self.fail_media_crypto.store(fail, Ordering::SeqCst);
    }
}

impl DrmPlatform for FakePlatform {
    fn is_scheme_supported(&self, scheme: Uuid, container_mime_type: Option<&str>) -> bool {
        let scheme_known = scheme == WIDEVINE_UUID || scheme == CLEARKEY_UUID;
        let container_known = container_mime_type
            .map_or(true, |mime| mime.starts_with("video/") || mime.starts_with("audio/"));
        scheme_known && container_known
    }

    fn create_media_drm(&self, scheme: Uuid) -> Result<Box<dyn MediaDrm>> {
        if !self.is_scheme_supported(scheme, None) {
            return Err(Error::UnsupportedScheme(scheme));
        }
        Ok(Box::new(FakeMediaDrm {
            device: self.device.clone(),
        }))
    }

    fn create_media_crypto(&self, _scheme: Uuid, engine_id: &[u8]) -> Result<Arc<dyn MediaCrypto>> {
        if self.fail_media_crypto.load(Ordering::SeqCst) {
            return Err(Error::MediaCryptoUnavailable("scripted failure".to_string()));
        }
        if !self.device().open_sessions.contains(engine_id) {
            return Err(Error::IllegalState("crypto session is not open".to_string()));
        }
        let media_crypto = Arc::new(FakeMediaCrypto::default());
        self.media_cryptos.lock().unwrap().push(media_crypto.clone());
        Ok(media_crypto)
    }

    fn features(&self) -> PlatformFeatures {
        self.features
    }
}

struct FakeMediaDrm {
    device: SharedDevice,
}

impl FakeMediaDrm {
    fn device(&self) -> MutexGuard<'_, FakeDevice> {
        self.device.lock().unwrap()
    }
}

impl MediaDrm for FakeMediaDrm {
    fn open_session(&mut self) -> Result<Vec<u8>> {
        let mut device = self.device();
        if !device.provisioned {
            return Err(Error::NotProvisioned);
        }
        device.next_session += 1;
        let engine_id = format!("drm-{}", device.next_session).into_bytes();
        device.open_sessions.insert(engine_id.clone());
        Ok(engine_id)
    }

    fn close_session(&mut self, engine_id: &[u8]) -> Result<()> {
        let mut device = self.device();
        device.session_key_types.remove(engine_id);
        if device.open_sessions.remove(engine_id) {
            Ok(())
        } else {
            Err(Error::InvalidSession(engine_id.to_vec()))
        }
    }

    fn get_key_request(
        &mut self,
        scope_id: &[u8],
        init_data: Option<&[u8]>,
        _mime_type: &str,
        key_type: KeyType,
        _optional_parameters: &HashMap<String, String>,
    ) -> Result<KeyRequest> {
        let mut device = self.device();
        if device.fail_get_key_request {
            return Err(Error::IllegalState("scripted key request failure".to_string()));
        }
        let (data, request_type) = if key_type == KeyType::Release {
            if !device.licenses.contains(scope_id) {
                return Err(Error::IllegalState("unknown key set".to_string()));
            }
            ([&b"release:"[..], scope_id].concat(), KeyRequestType::Release)
        } else {
            if !device.open_sessions.contains(scope_id) {
                return Err(Error::InvalidSession(scope_id.to_vec()));
            }
            let renewal = device
                .session_key_types
                .insert(scope_id.to_vec(), key_type)
                .is_some();
            let init_data = init_data.unwrap_or_default();
            let request_type = if renewal {
                KeyRequestType::Renewal
            } else {
                KeyRequestType::Initial
            };
            ([&b"request:"[..], init_data].concat(), request_type)
        };
        Ok(KeyRequest {
            data,
            default_url: device.key_request_url.clone(),
            request_type: Some(request_type),
        })
    }

    fn provide_key_response(&mut self, scope_id: &[u8], response: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut device = self.device();
        if response == b"bad" {
            return Err(Error::DeniedByServer("license rejected".to_string()));
        }
        if let Some(key_type) = device.session_key_types.get(scope_id).copied() {
            device.push_key_events(scope_id, false);
            if key_type != KeyType::Offline {
                return Ok(None);
            }
            let persistent_id = [&b"ks-"[..], scope_id].concat();
            device.licenses.insert(persistent_id.clone());
            return Ok(Some(persistent_id));
        }
        if device.licenses.remove(scope_id) {
            return Ok(None);
        }
        Err(Error::InvalidSession(scope_id.to_vec()))
    }

    fn remove_keys(&mut self, engine_id: &[u8]) -> Result<()> {
        let mut device = self.device();
        if device.fail_remove_keys {
            return Err(Error::IllegalState("scripted remove keys failure".to_string()));
        }
        device.removed_keys.push(engine_id.to_vec());
        Ok(())
    }

    fn restore_keys(&mut self, engine_id: &[u8], persistent_id: &[u8]) -> Result<()> {
        let mut device = self.device();
        if !device.provisioned {
            return Err(Error::NotProvisioned);
        }
        if !device.open_sessions.contains(engine_id) {
            return Err(Error::InvalidSession(engine_id.to_vec()));
        }
        if !device.licenses.contains(persistent_id) {
            return Err(Error::IllegalState("invalid key set id".to_string()));
        }
        device
            .session_key_types
            .insert(engine_id.to_vec(), KeyType::Offline);
        device.push_key_events(engine_id, true);
        Ok(())
    }

    fn get_provision_request(&mut self) -> Result<ProvisionRequest> {
        self.device().provision_requests += 1;
        Ok(ProvisionRequest {
            default_url: PROVISIONING_URL.to_string(),
            data: b"provision-request".to_vec(),
        })
    }

    fn provide_provision_response(&mut self, response: &[u8]) -> Result<()> {
        let mut device = self.device();
        if response == UNPROVISION_RESPONSE {
            device.provisioned = false;
            return Ok(());
        }
        if response == b"bad" {
            return Err(Error::DeniedByServer("certificate rejected".to_string()));
        }
        device.provisioned = true;
        Ok(())
    }

    fn get_property_string(&self, name: &str) -> Result<String> {
        self.device()
            .properties
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IllegalState(format!("unknown property {}", name)))
    }

    fn set_property_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.device()
            .properties
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn set_property_byte_array(&mut self, name: &str, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(Error::IllegalState(format!("empty value for {}", name)));
        }
        self.device()
            .byte_properties
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn poll_event(&mut self) -> Option<MediaDrmEvent> {
        self.device().events.pop_front()
    }

    fn release(&mut self) {
        self.device().released_engines += 1;
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeMediaCrypto {
    released: AtomicBool,
}

impl FakeMediaCrypto {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl MediaCrypto for FakeMediaCrypto {
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Everything a [`RecordingClient`] was told, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClientEvent {
    MediaCryptoReady(bool),
    StartProvisioning(String),
    Resolved(PromiseId),
    ResolvedWithSession(PromiseId, Vec<u8>),
    Rejected(PromiseId, String),
    Message(Vec<u8>, KeyRequestType, Vec<u8>),
    Closed(Vec<u8>),
    KeysChange {
        session: Vec<u8>,
        keys: Vec<KeyStatus>,
        has_usable_key: bool,
        is_key_release: bool,
    },
    Expiration(Vec<u8>, i64),
    ResetCompleted(bool),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingClient {
    events: Mutex<Vec<ClientEvent>>,
    /// Run from inside the next `on_media_crypto_ready`.
    on_ready: Mutex<CallbackQueue>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// How many times `promise_id` was settled.
    pub fn settlements(&self, promise_id: PromiseId) -> usize {
        self.events()
            .iter()
            .filter(|event| match event {
                ClientEvent::Resolved(id)
                | ClientEvent::ResolvedWithSession(id, _)
                | ClientEvent::Rejected(id, _) => *id == promise_id,
                _ => false,
            })
            .count()
    }

    /// Exchange id the promise resolved with.
    pub fn session_of(&self, promise_id: PromiseId) -> Option<Vec<u8>> {
        self.events().into_iter().find_map(|event| match event {
            ClientEvent::ResolvedWithSession(id, session) if id == promise_id => Some(session),
            _ => None,
        })
    }

    /// Run `callback` from inside the next `on_media_crypto_ready`.
    pub fn on_next_media_crypto_ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_ready.lock().unwrap().push(callback);
    }

    pub fn rejected(&self, promise_id: PromiseId) -> bool {
        self.events()
            .iter()
            .any(|event| matches!(event, ClientEvent::Rejected(id, _) if *id == promise_id))
    }
}

impl DrmClient for RecordingClient {
    fn on_media_crypto_ready(&self, media_crypto: Option<Arc<dyn MediaCrypto>>) {
        self.push(ClientEvent::MediaCryptoReady(media_crypto.is_some()));
        let mut callbacks = std::mem::take(&mut *self.on_ready.lock().unwrap());
        callbacks.run_all();
    }

    fn on_start_provisioning(&self, default_url: &str, _request: &[u8]) {
        self.push(ClientEvent::StartProvisioning(default_url.to_string()));
    }

    fn on_promise_resolved(&self, promise_id: PromiseId) {
        self.push(ClientEvent::Resolved(promise_id));
    }

    fn on_promise_resolved_with_session(&self, promise_id: PromiseId, session_id: &SessionId) {
        self.push(ClientEvent::ResolvedWithSession(
            promise_id,
            session_id.exchange_id().to_vec(),
        ));
    }

    fn on_promise_rejected(&self, promise_id: PromiseId, error: &Error) {
        self.push(ClientEvent::Rejected(promise_id, error.to_string()));
    }

    fn on_session_message(
        &self,
        session_id: &SessionId,
        request_type: KeyRequestType,
        message: &[u8],
    ) {
        self.push(ClientEvent::Message(
            session_id.exchange_id().to_vec(),
            request_type,
            message.to_vec(),
        ));
    }

    fn on_session_closed(&self, session_id: &SessionId) {
        self.push(ClientEvent::Closed(session_id.exchange_id().to_vec()));
    }

    fn on_session_keys_change(
        &self,
        session_id: &SessionId,
        keys: &[KeyStatus],
        has_usable_key: bool,
        is_key_release: bool,
    ) {
        self.push(ClientEvent::KeysChange {
            session: session_id.exchange_id().to_vec(),
            keys: keys.to_vec(),
            has_usable_key,
            is_key_release,
        });
    }

    fn on_session_expiration_update(&self, session_id: &SessionId, expiration_ms: i64) {
        self.push(ClientEvent::Expiration(
            session_id.exchange_id().to_vec(),
            expiration_ms,
        ));
    }

    fn on_reset_device_credentials_completed(&self, success: bool) {
        self.push(ClientEvent::ResetCompleted(success));
    }
}

/// [`MemoryStorage`] with scripted failures.
#[derive(Debug, Default)]
pub(crate) struct ScriptedStorage {
    pub inner: MemoryStorage,
    fail_saves: AtomicBool,
    fail_provisioned: AtomicBool,
    provisioned_calls: AtomicUsize,
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_provisioned(&self, fail: bool) {
        self.fail_provisioned.store(fail, Ordering::SeqCst);
    }

    pub fn provisioned_calls(&self) -> usize {
        self.provisioned_calls.load(Ordering::SeqCst)
    }
}

impl LicenseStorage for ScriptedStorage {
    fn on_provisioned(&self, done: StorageCallback<bool>) {
        self.provisioned_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_provisioned.load(Ordering::SeqCst) {
            done(false);
        } else {
            self.inner.on_provisioned(done);
        }
    }

    fn load_info(&self, exchange_id: &[u8], done: StorageCallback<Option<PersistentInfo>>) {
        self.inner.load_info(exchange_id, done);
    }

    fn save_info(&self, info: PersistentInfo, done: StorageCallback<bool>) {
        if self.fail_saves.load(Ordering::SeqCst) {
            done(false);
        } else {
            self.inner.save_info(info, done);
        }
    }

    fn clear_info(&self, exchange_id: &[u8], done: StorageCallback<bool>) {
        self.inner.clear_info(exchange_id, done);
    }
}
