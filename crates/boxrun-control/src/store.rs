//! File-locked local sandbox store.
//!
//! Local sandbox records live in a single JSON document. Whoever holds a
//! [`LocalStore`] holds an exclusive advisory lock on a `.lock` sidecar next
//! to it, so at most one control plane process writes the document at a
//! time. Other processes retry the open with linear backoff.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use boxrun_core::SandboxRecord;

const DOCUMENT_VERSION: u32 = 1;

/// Errors from the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {} is locked (gave up after {attempts} attempts)", path.display())]
    Locked { path: PathBuf, attempts: u32 },

    #[error("a sandbox named '{0}' already exists")]
    DuplicateName(String),

    #[error("a sandbox with id '{0}' already exists")]
    DuplicateId(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store document {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    sandboxes: Vec<SandboxRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            sandboxes: Vec::new(),
        }
    }
}

/// An open, locked store.
///
/// The lock is released when the store is dropped.
#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    doc: StoreDocument,
    _lock: File,
}

impl LocalStore {
    /// Open the store, failing at once if another process holds it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let lock_path = lock_path(&path);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        if let Err(e) = lock.try_lock_exclusive() {
            if is_contended(&e) {
                return Err(StoreError::Locked { path, attempts: 1 });
            }
            return Err(StoreError::io(&lock_path, e));
        }

        let doc = load(&path)?;
        debug!(path = %path.display(), sandboxes = doc.sandboxes.len(), "Opened local store");
        Ok(Self {
            path,
            doc,
            _lock: lock,
        })
    }

    /// Open the store, retrying while another process holds the lock.
    ///
    /// Waits `backoff * attempt` between attempts. Only lock contention is
    /// retried; any other failure is returned immediately.
    pub async fn open_with_retry(
        path: impl Into<PathBuf>,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            match Self::open(&path) {
                Ok(store) => return Ok(store),
                Err(StoreError::Locked { .. }) if attempt < attempts => {
                    let delay = backoff * attempt;
                    debug!(
                        path = %path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Local store is locked, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::Locked { .. }) => {
                    warn!(path = %path.display(), attempts, "Gave up waiting for local store lock");
                    return Err(StoreError::Locked { path, attempts });
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Locked { path, attempts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a new record. Ids and names are unique.
    pub fn insert(&mut self, record: SandboxRecord) -> Result<(), StoreError> {
        if self.doc.sandboxes.iter().any(|r| r.id == record.id) {
            return Err(StoreError::DuplicateId(record.id.to_string()));
        }
        if self.doc.sandboxes.iter().any(|r| r.name == record.name) {
            return Err(StoreError::DuplicateName(record.name));
        }
        let mut next = self.doc.clone();
        next.sandboxes.push(record);
        self.commit(next)
    }

    /// Replace the record with the same id.
    pub fn update(&mut self, record: SandboxRecord) -> Result<(), StoreError> {
        if self
            .doc
            .sandboxes
            .iter()
            .any(|r| r.id != record.id && r.name == record.name)
        {
            return Err(StoreError::DuplicateName(record.name));
        }
        let index = self
            .doc
            .sandboxes
            .iter()
            .position(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.to_string()))?;
        let mut next = self.doc.clone();
        next.sandboxes[index] = record;
        self.commit(next)
    }

    pub fn get_by_id(&self, id: &str) -> Option<SandboxRecord> {
        self.doc
            .sandboxes
            .iter()
            .find(|r| r.id.as_str() == id)
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<SandboxRecord> {
        self.doc.sandboxes.iter().find(|r| r.name == name).cloned()
    }

    pub fn list(&self) -> Vec<SandboxRecord> {
        self.doc.sandboxes.clone()
    }

    pub fn list_by_group(&self, group: &str) -> Vec<SandboxRecord> {
        self.doc
            .sandboxes
            .iter()
            .filter(|r| r.group.as_deref() == Some(group))
            .cloned()
            .collect()
    }

    /// Remove a record by id and return it.
    pub fn delete(&mut self, id: &str) -> Result<SandboxRecord, StoreError> {
        let index = self
            .doc
            .sandboxes
            .iter()
            .position(|r| r.id.as_str() == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut next = self.doc.clone();
        let record = next.sandboxes.remove(index);
        self.commit(next)?;
        Ok(record)
    }

    /// Persist `next` and adopt it. On failure the in-memory document is
    /// left as it was, matching what is on disk.
    fn commit(&mut self, next: StoreDocument) -> Result<(), StoreError> {
        persist(&self.path, &next)?;
        self.doc = next;
        Ok(())
    }
}

/// Write the document through a temp file and rename.
fn persist(path: &Path, doc: &StoreDocument) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(doc).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn load(path: &Path) -> Result<StoreDocument, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreDocument::default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(StoreDocument::default());
    }
    serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Owned, lazily opened handle to the local store.
///
/// The store is opened on first use and stays open (and locked) until
/// [`StoreHandle::close`] is called, after which the next use opens it
/// again.
pub struct StoreHandle {
    path: PathBuf,
    attempts: u32,
    backoff: Duration,
    slot: Mutex<Option<LocalStore>>,
}

impl StoreHandle {
    pub fn new(path: impl Into<PathBuf>, attempts: u32, backoff: Duration) -> Self {
        Self {
            path: path.into(),
            attempts,
            backoff,
            slot: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open store, opening it first if needed.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut LocalStore) -> Result<T, StoreError>,
    {
        let mut slot = self.slot.lock().await;
        let store = match slot.take() {
            Some(store) => store,
            None => LocalStore::open_with_retry(&self.path, self.attempts, self.backoff).await?,
        };
        f(slot.insert(store))
    }

    /// Release the store lock. A later call reopens it.
    pub async fn close(&self) {
        if self.slot.lock().await.take().is_some() {
            info!(path = %self.path.display(), "Closed local store");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxrun_core::Locality;

    fn record(name: &str) -> SandboxRecord {
        SandboxRecord::new(name, Locality::Local)
    }

    #[test]
    fn test_insert_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandboxes.json");
        let mut store = LocalStore::open(&path).unwrap();

        let demo = record("demo").with_group(Some("team".to_string()));
        let id = demo.id.clone();
        store.insert(demo).unwrap();
        store.insert(record("other")).unwrap();

        assert_eq!(store.get_by_name("demo").unwrap().id, id);
        assert!(store.get_by_id(id.as_str()).is_some());
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.list_by_group("team").len(), 1);

        store.delete(id.as_str()).unwrap();
        assert!(store.get_by_name("demo").is_none());
        assert!(matches!(
            store.delete(id.as_str()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::open(dir.path().join("s.json")).unwrap();
        store.insert(record("demo")).unwrap();
        assert!(matches!(
            store.insert(record("demo")),
            Err(StoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        {
            let mut store = LocalStore::open(&path).unwrap();
            let mut rec = record("demo");
            store.insert(rec.clone()).unwrap();
            rec.state = "stopped".to_string();
            store.update(rec).unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get_by_name("demo").unwrap().state, "stopped");
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let _held = LocalStore::open(&path).unwrap();
        assert!(matches!(
            LocalStore::open(&path),
            Err(StoreError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_succeeds_when_lock_released_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let held = LocalStore::open(&path).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(held);
        });

        let store = LocalStore::open_with_retry(&path, 5, Duration::from_millis(100)).await;
        releaser.join().unwrap();
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_open_fails_locked_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let _held = LocalStore::open(&path).unwrap();

        let err = LocalStore::open_with_retry(&path, 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        match err {
            StoreError::Locked { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let mut store = LocalStore::open(&path).unwrap();
        let kept = record("kept");
        let kept_id = kept.id.clone();
        store.insert(kept).unwrap();

        // A directory where the temp file goes makes every write fail
        let tmp = path.with_extension("json.tmp");
        fs::create_dir(&tmp).unwrap();

        assert!(matches!(
            store.insert(record("ghost")),
            Err(StoreError::Io { .. })
        ));
        assert!(store.get_by_name("ghost").is_none());
        assert_eq!(store.list().len(), 1);

        assert!(store.delete(kept_id.as_str()).is_err());
        assert!(store.get_by_id(kept_id.as_str()).is_some());

        let mut renamed = store.get_by_name("kept").unwrap();
        renamed.state = "stopped".to_string();
        assert!(store.update(renamed).is_err());
        assert_ne!(store.get_by_name("kept").unwrap().state, "stopped");

        fs::remove_dir(&tmp).unwrap();
        store.insert(record("ghost")).unwrap();
        drop(store);
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 2);
    }

    #[tokio::test]
    async fn test_handle_close_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let handle = StoreHandle::new(&path, 1, Duration::from_millis(1));

        handle.with_store(|s| s.insert(record("demo"))).await.unwrap();
        assert!(handle.is_open().await);
        assert!(LocalStore::open(&path).is_err());

        handle.close().await;
        assert!(!handle.is_open().await);
        let store = LocalStore::open(&path).unwrap();
        assert!(store.get_by_name("demo").is_some());
    }
}
