//! Registry of live sessions, indexed by exchange id and by engine id.
//!
//! The registry also fronts the license storage for offline sessions: it
//! writes the persistent id once a license is accepted, rebuilds sessions from
//! stored records, and clears records on release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::session::{KeyType, SessionId, SessionInfo};
use crate::storage::{LicenseStorage, StorageCallback};

#[derive(Debug, Default)]
struct Indices {
    by_exchange_id: HashMap<Vec<u8>, SessionInfo>,
    /// Engine id -> exchange id. An entry exists iff the session has an engine id.
    by_engine_id: HashMap<Vec<u8>, Vec<u8>>,
}

impl Indices {
    fn get_mut(&mut self, session_id: &SessionId) -> Result<&mut SessionInfo> {
        self.by_exchange_id
            .get_mut(session_id.exchange_id())
            .ok_or_else(|| Error::InvalidSession(session_id.exchange_id().to_vec()))
    }
}

/// Session bookkeeping shared by an engine and its storage continuations.
#[derive(Clone)]
pub struct SessionRegistry {
    indices: Arc<Mutex<Indices>>,
    storage: Arc<dyn LicenseStorage>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn LicenseStorage>) -> Self {
        Self {
            indices: Arc::new(Mutex::new(Indices::default())),
            storage,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session.
    pub fn put(
        &self,
        session_id: SessionId,
        mime_type: impl Into<String>,
        key_type: KeyType,
    ) -> Result<()> {
        let mut indices = self.lock();
        let exchange_id = session_id.exchange_id().to_vec();
        if indices.by_exchange_id.contains_key(&exchange_id) {
            return Err(Error::DuplicateSession(exchange_id));
        }
        if let Some(engine_id) = session_id.engine_id() {
            indices
                .by_engine_id
                .insert(engine_id.to_vec(), exchange_id.clone());
        }
        indices.by_exchange_id.insert(
            exchange_id,
            SessionInfo::new(session_id, mime_type.into(), key_type),
        );
        Ok(())
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.get_by_exchange_id(session_id.exchange_id())
    }

    pub fn get_by_exchange_id(&self, exchange_id: &[u8]) -> Option<SessionInfo> {
        self.lock().by_exchange_id.get(exchange_id).cloned()
    }

    pub fn get_by_engine_id(&self, engine_id: &[u8]) -> Option<SessionInfo> {
        let indices = self.lock();
        let exchange_id = indices.by_engine_id.get(engine_id)?;
        indices.by_exchange_id.get(exchange_id).cloned()
    }

    /// Drop a session from both indices.
    pub fn remove(&self, session_id: &SessionId) -> Result<SessionInfo> {
        let mut indices = self.lock();
        let info = indices
            .by_exchange_id
            .remove(session_id.exchange_id())
            .ok_or_else(|| Error::InvalidSession(session_id.exchange_id().to_vec()))?;
        if let Some(engine_id) = info.session_id.engine_id() {
            indices.by_engine_id.remove(engine_id);
        }
        Ok(info)
    }

    /// Attach an engine session to a session restored without one.
    pub fn set_engine_id(&self, session_id: &SessionId, engine_id: Vec<u8>) -> Result<()> {
        let mut indices = self.lock();
        let info = indices.get_mut(session_id)?;
        if info.session_id.engine_id().is_some() {
            return Err(Error::IllegalState(format!(
                "session {} already has an engine id",
                session_id.to_hex()
            )));
        }
        info.session_id.set_engine_id(engine_id.clone());
        let exchange_id = info.session_id.exchange_id().to_vec();
        indices.by_engine_id.insert(engine_id, exchange_id);
        Ok(())
    }

    /// Record the persistent id of an accepted offline license and save it.
    ///
    /// The id is kept in memory even if the storage write fails; `done`
    /// receives the storage outcome.
    pub fn set_persistent_id(
        &self,
        session_id: &SessionId,
        persistent_id: Vec<u8>,
        done: StorageCallback<bool>,
    ) -> Result<()> {
        let record = {
            let mut indices = self.lock();
            let info = indices.get_mut(session_id)?;
            if info.key_type != KeyType::Offline {
                return Err(Error::InvalidKeyType(info.key_type.to_string()));
            }
            if info.session_id.persistent_id().is_some() {
                return Err(Error::IllegalState(format!(
                    "session {} already has a persistent id",
                    session_id.to_hex()
                )));
            }
            info.session_id.set_persistent_id(persistent_id);
            info.to_persistent_info()
                .ok_or_else(|| Error::Other("persistent id missing after assignment".to_string()))?
        };
        self.storage.save_info(record, done);
        Ok(())
    }

    /// Switch an offline session to release mode.
    pub fn mark_released(&self, session_id: &SessionId) -> Result<()> {
        let mut indices = self.lock();
        let info = indices.get_mut(session_id)?;
        if info.key_type != KeyType::Offline {
            return Err(Error::InvalidKeyType(info.key_type.to_string()));
        }
        info.key_type = KeyType::Release;
        Ok(())
    }

    /// Rebuild a session from storage.
    ///
    /// `done` receives the restored id (offline, no engine id yet), or `None`
    /// when there is no record or the license is already loaded in another
    /// live session.
    pub fn load(&self, exchange_id: &[u8], done: Box<dyn FnOnce(Option<SessionId>) + Send>) {
        let registry = self.clone();
        let requested = exchange_id.to_vec();
        self.storage.load_info(
            exchange_id,
            Box::new(move |info| {
                let Some(info) = info else {
                    debug!("No stored license for {}", hex::encode(&requested));
                    done(None);
                    return;
                };
                let session_id = SessionId::restored(info.exchange_id, info.persistent_id);
                if let Err(e) = registry.put(session_id.clone(), info.mime_type, KeyType::Offline) {
                    warn!("Cannot load license into a second session: {}", e);
                    done(None);
                    return;
                }
                done(Some(session_id));
            }),
        );
    }

    /// Forget the persistent id and delete the stored record.
    pub fn clear_persistent(&self, session_id: &SessionId, done: StorageCallback<bool>) -> Result<()> {
        {
            let mut indices = self.lock();
            indices.get_mut(session_id)?.session_id.clear_persistent_id();
        }
        self.storage.clear_info(session_id.exchange_id(), done);
        Ok(())
    }

    /// Ids of every registered session.
    pub fn all_session_ids(&self) -> Vec<SessionId> {
        self.lock()
            .by_exchange_id
            .values()
            .map(|info| info.session_id.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut indices = self.lock();
        indices.by_exchange_id.clear();
        indices.by_engine_id.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().by_exchange_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
