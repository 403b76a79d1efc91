// src/store.rs
//
// Durable persistence for the room registry.
//
// The directory depends only on the `RegistryStore` trait; business logic
// never touches the filesystem directly.  Two implementations:
//
//   MemoryStore    -- keeps the last snapshot in memory.  Used by tests and
//                     by deployments that opt out of durability.
//   JsonFileStore  -- serializes the full registry to a JSON file with an
//                     atomic temp-file + rename write.
//
// Write serialization (one write in flight at a time) is a property of the
// caller: the directory holds its mutex across `save`, so snapshots can
// never interleave on disk.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::directory::RoomRecord;
use crate::error::StoreError;

/// The full persisted state: every claimed room, keyed by normalized name.
pub type RegistrySnapshot = HashMap<String, RoomRecord>;

// ─── Trait ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Load the last saved snapshot.  A store with no prior state returns an
    /// empty snapshot, not an error.
    async fn load(&self) -> Result<RegistrySnapshot, StoreError>;

    /// Replace the persisted state with `snapshot`.
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError>;
}

// ─── In-memory store ────────────────────────────────────────────────────────

/// Keeps the snapshot in process memory.  Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<RegistrySnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<RegistrySnapshot, StoreError> {
        Ok(self.inner.lock().expect("store mutex poisoned").clone())
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        *self.inner.lock().expect("store mutex poisoned") = snapshot.clone();
        Ok(())
    }
}

// ─── JSON file store ────────────────────────────────────────────────────────

/// Serializes the registry to a single JSON file.
///
/// Writes go to `<path>.tmp` first and are renamed over the target, so a
/// crash mid-write never leaves a truncated registry behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        tmp.set_extension("json.tmp");
        tmp
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<RegistrySnapshot, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistrySnapshot::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

// ─── Failing store (test double) ────────────────────────────────────────────

/// A store whose `save` always fails.  Used to exercise the directory's
/// rollback-on-persist-failure contract.
#[cfg(test)]
pub struct FailingStore;

#[cfg(test)]
#[async_trait]
impl RegistryStore for FailingStore {
    async fn load(&self) -> Result<RegistrySnapshot, StoreError> {
        Ok(RegistrySnapshot::new())
    }

    async fn save(&self, _snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "write refused",
        )))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Privacy, RoomRecord};

    fn sample_snapshot() -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::new();
        snapshot.insert("demo".into(), RoomRecord::new("demo".into(), None, Privacy::Private));
        snapshot
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_empty());

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("demo"));
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let store = JsonFileStore::new(&path);

        // Missing file loads as empty, not as an error.
        assert!(store.load().await.unwrap().is_empty());

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();
        assert!(path.exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded["demo"].privacy, Privacy::Private);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        JsonFileStore::new(&path).save(&sample_snapshot()).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert!(loaded.contains_key("demo"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.load().await.is_err());
    }
}
