//! Durable storage for the status cache.
//!
//! Only the status cache writes through a [`PayloadStore`]; anything may read.
//! A broken record never fails the whole load: callers get an error for that
//! key only and degrade it to an invisible payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{HostError, Result};
use crate::extension::{ExtensionIdentity, StatusPayload};

const STORE_SCHEMA_VERSION: u32 = 1;

pub trait PayloadStore: Send + Sync {
    fn load_payload(&self, identity: &ExtensionIdentity) -> Result<Option<StatusPayload>>;
    fn save_payload(&self, identity: &ExtensionIdentity, payload: &StatusPayload) -> Result<()>;
    fn remove_payload(&self, identity: &ExtensionIdentity) -> Result<()>;

    /// `None` when no active list was ever saved.
    fn load_active(&self) -> Result<Option<Vec<ExtensionIdentity>>>;
    fn save_active(&self, identities: &[ExtensionIdentity]) -> Result<()>;

    /// Blocks until every accepted write is durable.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    schema: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active: Option<Vec<String>>,
    #[serde(default)]
    payloads: BTreeMap<String, Value>,
}

impl StoreFile {
    fn payload(&self, identity: &ExtensionIdentity) -> Result<Option<StatusPayload>> {
        match self.payloads.get(&identity.to_string()) {
            None => Ok(None),
            Some(record) => StatusPayload::from_record(record)
                .map(Some)
                .map_err(|e| HostError::Persistence(format!("corrupt record for {identity}: {e}"))),
        }
    }

    fn active(&self) -> Option<Vec<ExtensionIdentity>> {
        self.active.as_ref().map(|names| {
            names
                .iter()
                .filter_map(|name| match name.parse() {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!("Skipping persisted active entry: {}", e);
                        None
                    }
                })
                .collect()
        })
    }
}

/// Store kept in one JSON file and cached in memory.
///
/// Reads and writes go to the in-memory document. Inside a tokio runtime the
/// file is rewritten by a background writer, so callers never wait on disk;
/// outside one every change is flushed inline. [`PayloadStore::sync`] forces
/// pending changes out.
pub struct JsonFileStore {
    shared: Arc<FileShared>,
    writer: Option<(Arc<Notify>, JoinHandle<()>)>,
}

struct FileShared {
    path: PathBuf,
    data: Mutex<StoreFile>,
    dirty: AtomicBool,
    // Serializes file writes so an older snapshot never lands last.
    write: Mutex<()>,
}

impl FileShared {
    fn flush(&self) -> Result<()> {
        let _write = self.write.lock().expect("store write lock poisoned");
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let contents = {
            let data = self.data.lock().expect("store lock poisoned");
            serde_json::to_string_pretty(&*data)?
        };
        let written = self.write_file(&contents);
        if written.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        written
    }

    fn write_file(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(persistence)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(persistence)?;
        std::fs::rename(&tmp, &self.path).map_err(persistence)?;
        Ok(())
    }
}

impl JsonFileStore {
    /// Opens the store. A missing file starts empty; an unreadable one is
    /// logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StoreFile>(&contents) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), "Status cache file is corrupt, starting empty: {}", e);
                    StoreFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => {
                warn!(path = %path.display(), "Failed to read status cache, starting empty: {}", e);
                StoreFile::default()
            }
        };
        trace!(path = %path.display(), records = data.payloads.len(), "Opened status cache");
        let shared = Arc::new(FileShared {
            path,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
            write: Mutex::new(()),
        });
        let writer = Handle::try_current().ok().map(|handle| {
            let wake = Arc::new(Notify::new());
            let task = handle.spawn(write_behind(shared.clone(), wake.clone()));
            (wake, task)
        });
        Self { shared, writer }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn modify(&self, f: impl FnOnce(&mut StoreFile) -> bool) -> Result<()> {
        {
            let mut data = self.shared.data.lock().expect("store lock poisoned");
            if !f(&mut data) {
                return Ok(());
            }
            data.schema = STORE_SCHEMA_VERSION;
            self.shared.dirty.store(true, Ordering::SeqCst);
        }
        match &self.writer {
            Some((wake, _)) => {
                wake.notify_one();
                Ok(())
            }
            None => self.shared.flush(),
        }
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Some((_, task)) = self.writer.take() {
            task.abort();
        }
        if let Err(e) = self.shared.flush() {
            warn!(path = %self.shared.path.display(), "Failed to write status cache: {}", e);
        }
    }
}

async fn write_behind(shared: Arc<FileShared>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let target = shared.clone();
        match tokio::task::spawn_blocking(move || target.flush()).await {
            Ok(Ok(())) => trace!(path = %shared.path.display(), "Status cache written"),
            Ok(Err(e)) => {
                warn!(path = %shared.path.display(), "Failed to write status cache: {}", e)
            }
            Err(e) => warn!("Status cache writer failed: {}", e),
        }
    }
}

fn persistence(e: std::io::Error) -> HostError {
    HostError::Persistence(e.to_string())
}

impl PayloadStore for JsonFileStore {
    fn load_payload(&self, identity: &ExtensionIdentity) -> Result<Option<StatusPayload>> {
        self.shared.data.lock().expect("store lock poisoned").payload(identity)
    }

    fn save_payload(&self, identity: &ExtensionIdentity, payload: &StatusPayload) -> Result<()> {
        let record = payload.to_record()?;
        self.modify(|data| {
            data.payloads.insert(identity.to_string(), record);
            true
        })
    }

    fn remove_payload(&self, identity: &ExtensionIdentity) -> Result<()> {
        let key = identity.to_string();
        self.modify(|data| data.payloads.remove(&key).is_some())
    }

    fn load_active(&self) -> Result<Option<Vec<ExtensionIdentity>>> {
        Ok(self.shared.data.lock().expect("store lock poisoned").active())
    }

    fn save_active(&self, identities: &[ExtensionIdentity]) -> Result<()> {
        let names = identities.iter().map(ToString::to_string).collect();
        self.modify(|data| {
            data.active = Some(names);
            true
        })
    }

    fn sync(&self) -> Result<()> {
        self.shared.flush()
    }
}

/// In-process store; counts writes so callers can observe persistence.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreFile>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payload or active-list writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stores a raw record, bypassing validation.
    pub fn insert_raw(&self, identity: &ExtensionIdentity, record: Value) {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.payloads.insert(identity.to_string(), record);
    }

    pub fn contains(&self, identity: &ExtensionIdentity) -> bool {
        let data = self.data.lock().expect("store lock poisoned");
        data.payloads.contains_key(&identity.to_string())
    }
}

impl PayloadStore for MemoryStore {
    fn load_payload(&self, identity: &ExtensionIdentity) -> Result<Option<StatusPayload>> {
        self.data.lock().expect("store lock poisoned").payload(identity)
    }

    fn save_payload(&self, identity: &ExtensionIdentity, payload: &StatusPayload) -> Result<()> {
        let record = payload.to_record()?;
        self.insert_raw(identity, record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_payload(&self, identity: &ExtensionIdentity) -> Result<()> {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.payloads.remove(&identity.to_string());
        Ok(())
    }

    fn load_active(&self) -> Result<Option<Vec<ExtensionIdentity>>> {
        Ok(self.data.lock().expect("store lock poisoned").active())
    }

    fn save_active(&self, identities: &[ExtensionIdentity]) -> Result<()> {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.active = Some(identities.iter().map(ToString::to_string).collect());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ExtensionIdentity {
        ExtensionIdentity::new("pkg", name)
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let store = JsonFileStore::open(&path);
        assert_eq!(store.load_active().unwrap(), None);
        store
            .save_payload(&id("A"), &StatusPayload::visible("hello"))
            .unwrap();
        store.save_active(&[id("A"), id("B")]).unwrap();

        let reopened = JsonFileStore::open(&path);
        assert_eq!(
            reopened.load_payload(&id("A")).unwrap(),
            Some(StatusPayload::visible("hello"))
        );
        assert_eq!(reopened.load_active().unwrap(), Some(vec![id("A"), id("B")]));
        assert_eq!(reopened.load_payload(&id("B")).unwrap(), None);
    }

    #[test]
    fn file_store_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("cache.json"));
        store.save_payload(&id("A"), &StatusPayload::visible("x")).unwrap();
        store.remove_payload(&id("A")).unwrap();
        store.remove_payload(&id("never")).unwrap();
        assert_eq!(store.load_payload(&id("A")).unwrap(), None);
    }

    #[tokio::test]
    async fn file_writes_happen_behind_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let store = JsonFileStore::open(&path);
        store
            .save_payload(&id("A"), &StatusPayload::visible("hello"))
            .unwrap();
        // The writer has not run yet on this single-threaded runtime.
        assert!(!path.exists());
        assert!(store.load_payload(&id("A")).unwrap().is_some());

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !path.exists() {
            assert!(tokio::time::Instant::now() < deadline, "cache never written");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        store.remove_payload(&id("A")).unwrap();
        store.sync().unwrap();

        let reopened = JsonFileStore::open(&path);
        assert_eq!(reopened.load_payload(&id("A")).unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_the_store_writes_pending_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let store = JsonFileStore::open(&path);
        store.save_active(&[id("A")]).unwrap();
        drop(store);

        assert_eq!(
            JsonFileStore::open(&path).load_active().unwrap(),
            Some(vec![id("A")])
        );
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::open(&path);
        assert_eq!(store.load_active().unwrap(), None);
        assert_eq!(store.load_payload(&id("A")).unwrap(), None);
    }

    #[test]
    fn corrupt_record_is_an_error_for_that_key_only() {
        let store = MemoryStore::new();
        store.insert_raw(&id("A"), Value::String("garbage".into()));
        store.save_payload(&id("B"), &StatusPayload::visible("ok")).unwrap();

        assert!(matches!(
            store.load_payload(&id("A")),
            Err(HostError::Persistence(_))
        ));
        assert!(store.load_payload(&id("B")).unwrap().is_some());
    }

    #[test]
    fn memory_store_counts_writes() {
        let store = MemoryStore::new();
        store.save_payload(&id("A"), &StatusPayload::hidden()).unwrap();
        store.save_active(&[id("A")]).unwrap();
        assert_eq!(store.writes(), 2);
        assert!(store.contains(&id("A")));
    }
}
