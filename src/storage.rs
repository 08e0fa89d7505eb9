use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Durable namespace/key blob storage.
pub trait KeyValueStore: Send {
    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
    /// `NotFound` when the key was never written.
    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>>;
}

/// One file per key under `<root>/<namespace>/<key>.bin`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            Error::StorageFault(format!("failed to create {}: {err}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn key_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{key}.bin"))
    }
}

impl KeyValueStore for FileStore {
    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(namespace, key);
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir).map_err(|err| {
            Error::StorageFault(format!("failed to create {}: {err}", dir.display()))
        })?;

        // Write then rename so a torn write never replaces a good blob.
        let staging = path.with_extension("tmp");
        fs::write(&staging, value).map_err(|err| {
            Error::StorageFault(format!("failed to write {}: {err}", staging.display()))
        })?;
        fs::rename(&staging, &path).map_err(|err| {
            Error::StorageFault(format!("failed to commit {}: {err}", path.display()))
        })
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(namespace, key);
        fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::NotFound(format!("{namespace}/{key}")),
            _ => Error::StorageFault(format!("failed to read {}: {err}", path.display())),
        })
    }
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<(String, String), Vec<u8>>,
    writes: usize,
    unreachable: bool,
}

/// Volatile store. Clones share contents, so a test can keep a handle
/// after moving one into a sequencer.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails with `StorageFault`.
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.lock().unreachable = true;
        store
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(Error::StorageFault(String::from("store unreachable")));
        }
        inner
            .values
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>> {
        let inner = self.lock();
        if inner.unreachable {
            return Err(Error::StorageFault(String::from("store unreachable")));
        }
        inner
            .values
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{namespace}/{key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_round_trip_and_overwrite() {
        let dir = tempdir().expect("tempdir");
        let mut store = FileStore::open(dir.path()).expect("open");

        store.put("playlist", "order", b"[1,0]").expect("put");
        store.put("playlist", "order", b"[0,1]").expect("overwrite");
        assert_eq!(store.get("playlist", "order").expect("get"), b"[0,1]");

        let reopened = FileStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get("playlist", "order").expect("get"), b"[0,1]");
    }

    #[test]
    fn file_store_missing_key_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        assert!(matches!(
            store.get("playlist", "absent"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn memory_store_clones_share_contents_and_count_writes() {
        let store = MemoryStore::new();
        let mut writer = store.clone();
        writer.put("ns", "k", b"v").expect("put");
        assert_eq!(store.get("ns", "k").expect("get"), b"v");
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn unreachable_memory_store_faults() {
        let mut store = MemoryStore::unreachable();
        assert!(matches!(store.put("ns", "k", b"v"), Err(Error::StorageFault(_))));
        assert!(matches!(store.get("ns", "k"), Err(Error::StorageFault(_))));
    }
}
