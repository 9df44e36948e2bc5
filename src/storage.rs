//! Persistent license storage contract and implementations.
//!
//! Offline licenses outlive the engine session that fetched them. The engine
//! records, for each exchange id, the persistent id the platform returned and
//! the container mime type, and asks storage for them again on load.
//!
//! Every storage call is asynchronous: the callback is invoked at most once,
//! possibly before the call returns. The bundled implementations complete
//! synchronously.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::ensure_parent_dir;

/// Completion callback handed to a [`LicenseStorage`] call.
pub type StorageCallback<T> = Box<dyn FnOnce(T) + Send>;

/// Durable record of an offline license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentInfo {
    /// Exchange id the application knows the session by.
    #[serde(with = "hex::serde")]
    pub exchange_id: Vec<u8>,
    /// Platform handle of the stored license.
    #[serde(with = "hex::serde")]
    pub persistent_id: Vec<u8>,
    /// Container mime type the license was requested for.
    pub mime_type: String,
}

/// Asynchronous key-value store for offline license records.
pub trait LicenseStorage: Send + Sync {
    /// Tell storage that the origin-bound device certificate was provisioned.
    fn on_provisioned(&self, done: StorageCallback<bool>);

    /// Look up the record for an exchange id.
    fn load_info(&self, exchange_id: &[u8], done: StorageCallback<Option<PersistentInfo>>);

    /// Insert or replace a record.
    fn save_info(&self, info: PersistentInfo, done: StorageCallback<bool>);

    /// Delete the record for an exchange id.
    fn clear_info(&self, exchange_id: &[u8], done: StorageCallback<bool>);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process storage, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<Vec<u8>, PersistentInfo>>,
    provisioned: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for an exchange id.
    pub fn get(&self, exchange_id: &[u8]) -> Option<PersistentInfo> {
        lock(&self.records).get(exchange_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `on_provisioned` was received.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }
}

impl LicenseStorage for MemoryStorage {
    fn on_provisioned(&self, done: StorageCallback<bool>) {
        self.provisioned.store(true, Ordering::SeqCst);
        done(true);
    }

    fn load_info(&self, exchange_id: &[u8], done: StorageCallback<Option<PersistentInfo>>) {
        let info = self.get(exchange_id);
        done(info);
    }

    fn save_info(&self, info: PersistentInfo, done: StorageCallback<bool>) {
        lock(&self.records).insert(info.exchange_id.clone(), info);
        done(true);
    }

    fn clear_info(&self, exchange_id: &[u8], done: StorageCallback<bool>) {
        lock(&self.records).remove(exchange_id);
        done(true);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    provisioned: bool,
    #[serde(default)]
    licenses: BTreeMap<String, PersistentInfo>,
}

/// License records kept in a JSON file; every mutation is flushed to disk.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    contents: Mutex<StoreFile>,
}

impl JsonFileStorage {
    /// Open a store file, starting empty when it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = if path.is_file() {
            let data = std::fs::read(&path)?;
            serde_json::from_slice(&data)?
        } else {
            StoreFile::default()
        };
        debug!("Opened license store {}", path.display());
        Ok(Self {
            path,
            contents: Mutex::new(contents),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored records, ordered by hex exchange id.
    pub fn records(&self) -> Vec<PersistentInfo> {
        lock(&self.contents).licenses.values().cloned().collect()
    }

    pub fn get(&self, exchange_id: &[u8]) -> Option<PersistentInfo> {
        lock(&self.contents)
            .licenses
            .get(&hex::encode(exchange_id))
            .cloned()
    }

    pub fn is_provisioned(&self) -> bool {
        lock(&self.contents).provisioned
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, exchange_id: &[u8]) -> Result<bool> {
        let key = hex::encode(exchange_id);
        self.update(|contents| contents.licenses.remove(&key).is_some())
    }

    fn insert(&self, info: PersistentInfo) -> Result<()> {
        self.update(|contents| {
            contents
                .licenses
                .insert(hex::encode(&info.exchange_id), info);
            true
        })
        .map(|_| ())
    }

    fn mark_provisioned(&self) -> Result<()> {
        self.update(|contents| !std::mem::replace(&mut contents.provisioned, true))
            .map(|_| ())
    }

    /// Apply `change` to a copy of the store and flush it when `change`
    /// reports a modification. The in-memory store only takes the copy once
    /// the file was written.
    fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut StoreFile) -> bool,
    {
        let mut contents = lock(&self.contents);
        let mut next = contents.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.flush(&next)?;
        *contents = next;
        Ok(true)
    }

    fn flush(&self, contents: &StoreFile) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let data = serde_json::to_vec_pretty(contents)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl LicenseStorage for JsonFileStorage {
    fn on_provisioned(&self, done: StorageCallback<bool>) {
        let result = self.mark_provisioned();
        if let Err(ref e) = result {
            error!("Failed to record provisioning in {}: {}", self.path.display(), e);
        }
        done(result.is_ok());
    }

    fn load_info(&self, exchange_id: &[u8], done: StorageCallback<Option<PersistentInfo>>) {
        let info = self.get(exchange_id);
        done(info);
    }

    fn save_info(&self, info: PersistentInfo, done: StorageCallback<bool>) {
        let result = self.insert(info);
        if let Err(ref e) = result {
            error!("Failed to save license record: {}", e);
        }
        done(result.is_ok());
    }

    fn clear_info(&self, exchange_id: &[u8], done: StorageCallback<bool>) {
        let result = self.remove(exchange_id);
        if let Err(ref e) = result {
            error!("Failed to clear license record: {}", e);
        }
        done(result.is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn record(id: &[u8]) -> PersistentInfo {
        PersistentInfo {
            exchange_id: id.to_vec(),
            persistent_id: b"ks-1".to_vec(),
            mime_type: "video/mp4".to_string(),
        }
    }

    fn capture<T: Send + 'static>() -> (Arc<Mutex<Option<T>>>, StorageCallback<T>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (slot, Box::new(move |value| *sink.lock().unwrap() = Some(value)))
    }

    #[test]
    fn memory_storage_save_load_clear() {
        let storage = MemoryStorage::new();
        let (saved, done) = capture();
        storage.save_info(record(b"eme-1"), done);
        assert_eq!(*saved.lock().unwrap(), Some(true));

        let (loaded, done) = capture();
        storage.load_info(b"eme-1", done);
        assert_eq!(*loaded.lock().unwrap(), Some(Some(record(b"eme-1"))));

        let (cleared, done) = capture();
        storage.clear_info(b"eme-1", done);
        assert_eq!(*cleared.lock().unwrap(), Some(true));
        assert!(storage.is_empty());
    }

    #[test]
    fn memory_storage_miss() {
        let storage = MemoryStorage::new();
        let (loaded, done) = capture();
        storage.load_info(&[0xaa], done);
        assert_eq!(*loaded.lock().unwrap(), Some(None));
    }

    #[test]
    fn json_storage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("licenses.json");

        let storage = JsonFileStorage::open(&path).unwrap();
        let (saved, done) = capture();
        storage.save_info(record(b"eme-1"), done);
        assert_eq!(*saved.lock().unwrap(), Some(true));
        let (provisioned, done) = capture();
        storage.on_provisioned(done);
        assert_eq!(*provisioned.lock().unwrap(), Some(true));

        let reopened = JsonFileStorage::open(&path).unwrap();
        assert!(reopened.is_provisioned());
        assert_eq!(reopened.records(), vec![record(b"eme-1")]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(&hex::encode(b"eme-1")));

        assert!(reopened.remove(b"eme-1").unwrap());
        assert!(!reopened.remove(b"eme-1").unwrap());
        assert!(JsonFileStorage::open(&path).unwrap().records().is_empty());
    }

    #[test]
    fn json_storage_failed_write_is_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let storage = JsonFileStorage::open(blocker.join("licenses.json")).unwrap();

        let (saved, done) = capture();
        storage.save_info(record(b"eme-1"), done);
        assert_eq!(*saved.lock().unwrap(), Some(false));

        let (loaded, done) = capture();
        storage.load_info(b"eme-1", done);
        assert_eq!(*loaded.lock().unwrap(), Some(None));

        let (provisioned, done) = capture();
        storage.on_provisioned(done);
        assert_eq!(*provisioned.lock().unwrap(), Some(false));
        assert!(!storage.is_provisioned());
    }

    #[test]
    fn json_storage_failed_remove_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("licenses.json");
        let storage = JsonFileStorage::open(&path).unwrap();
        let (saved, done) = capture();
        storage.save_info(record(b"eme-1"), done);
        assert_eq!(*saved.lock().unwrap(), Some(true));

        // The store path turns into a directory, so the next write fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let (cleared, done) = capture();
        storage.clear_info(b"eme-1", done);
        assert_eq!(*cleared.lock().unwrap(), Some(false));
        assert_eq!(storage.get(b"eme-1"), Some(record(b"eme-1")));
    }
}
