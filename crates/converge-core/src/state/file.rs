// # File State Store
//
// File-based implementation of StateStore.
//
// ## Purpose
//
// Persists the last-known actual state across runs so the diff engine can
// tell what already exists.
//
// ## Crash Safety
//
// - Atomic writes: the whole document is written to a temp file, synced,
//   and renamed over the live file. A crash at any point leaves either the
//   previous or the new document, never a mix.
// - Backup: the previous document is copied to `.backup` before each
//   rename, for manual recovery.
// - Corruption: a document that fails to parse, or has an unknown schema,
//   is reported as `CorruptState`. It is never repaired automatically.
//
// ## File Format
//
// ```json
// {
//   "schema": "converge.state/v1",
//   "serial": 7,
//   "records": {
//     "web": {
//       "name": "web",
//       "kind": "virtual_machine",
//       "id": "104",
//       "source": "debian-12-template",
//       "declared": { "cores": 2, "memory": 2048 },
//       "attributes": { "cores": 2, "memory": 2048, "id": "104", "address": "10.0.0.5" },
//       "fingerprint": "5f1c...",
//       "dependencies": [],
//       "last_updated": "2025-01-09T12:00:00Z"
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::StateStoreConfig;
use crate::state::lock::{self, StateLock};
use crate::traits::state_store::{StateRecord, StateStore, StateStoreFactory};

/// Schema identifier written into every state document
pub const STATE_SCHEMA: &str = "converge.state/v1";

/// File-based state store
///
/// Every mutation is written through to disk before the call returns.
///
/// # Example
///
/// ```rust,no_run
/// use converge_core::state::FileStateStore;
/// use converge_core::traits::StateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStateStore::new("/var/lib/converge/state.json").await?;
///
///     let snapshot = store.load().await?;
///     println!("{} resource(s) under management", snapshot.len());
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

/// Internal state for file-based store
#[derive(Debug)]
struct FileState {
    records: BTreeMap<String, StateRecord>,
    serial: u64,
    dirty: bool,
}

/// Serializable state file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    schema: String,
    #[serde(default)]
    serial: u64,
    records: BTreeMap<String, StateRecord>,
}

impl FileStateStore {
    /// Create or load a file state store
    ///
    /// A missing file means an empty store. A file that cannot be decoded
    /// fails with [`Error::CorruptState`].
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create state directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let (serial, records) = Self::load_state(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                records,
                serial,
                dirty: false,
            })),
        })
    }

    /// Load state from file
    async fn load_state(path: &Path) -> Result<(u64, BTreeMap<String, StateRecord>), Error> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok((0, BTreeMap::new()));
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            ))
        })?;

        // Check the schema before trusting the rest of the document
        let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            Error::corrupt_state(path.display().to_string(), format!("not valid JSON: {}", e))
        })?;
        match raw.get("schema").and_then(|s| s.as_str()) {
            Some(STATE_SCHEMA) => {}
            Some(other) => {
                return Err(Error::corrupt_state(
                    path.display().to_string(),
                    format!("unsupported schema `{}` (expected `{}`)", other, STATE_SCHEMA),
                ));
            }
            None => {
                return Err(Error::corrupt_state(
                    path.display().to_string(),
                    "missing schema identifier",
                ));
            }
        }

        let state_file: StateFileFormat = serde_json::from_value(raw).map_err(|e| {
            Error::corrupt_state(path.display().to_string(), e.to_string())
        })?;

        for (name, record) in &state_file.records {
            if name != &record.name {
                return Err(Error::corrupt_state(
                    path.display().to_string(),
                    format!("record keyed `{}` is named `{}`", name, record.name),
                ));
            }
        }

        tracing::debug!(
            "Loaded state from file: {} records (serial {})",
            state_file.records.len(),
            state_file.serial
        );
        Ok((state_file.serial, state_file.records))
    }

    /// Write state to file atomically
    async fn write_state(&self) -> Result<(), Error> {
        let mut state_guard = self.state.write().await;

        let state_file = StateFileFormat {
            schema: STATE_SCHEMA.to_string(),
            serial: state_guard.serial + 1,
            records: state_guard.records.clone(),
        };

        let json = serde_json::to_string_pretty(&state_file)
            .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?;

        // Write to temporary file first
        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.sync_all().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        // Keep the previous document for manual recovery
        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        // Atomic rename (temp -> actual)
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        state_guard.serial = state_file.serial;
        state_guard.dirty = false;

        tracing::trace!(
            "State written to file: {} (serial {})",
            self.path.display(),
            state_guard.serial
        );
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        with_suffix(path, ".backup")
    }

    /// Get path to the advisory lock file
    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    /// Number of successful writes recorded in the document
    pub async fn serial(&self) -> u64 {
        self.state.read().await.serial
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<BTreeMap<String, StateRecord>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.records.clone())
    }

    async fn get(&self, name: &str) -> Result<Option<StateRecord>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.records.get(name).cloned())
    }

    async fn put(&self, record: &StateRecord) -> Result<(), Error> {
        {
            let mut state_guard = self.state.write().await;
            state_guard
                .records
                .insert(record.name.clone(), record.clone());
            state_guard.dirty = true;
        }

        // Immediate write for durability
        self.write_state().await
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        {
            let mut state_guard = self.state.write().await;
            if state_guard.records.remove(name).is_none() {
                return Ok(());
            }
            state_guard.dirty = true;
        }

        // Immediate write for durability
        self.write_state().await
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.records.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty {
            self.write_state().await
        } else {
            Ok(())
        }
    }

    async fn lock(&self, holder: &str, stale_after: Duration) -> Result<StateLock, Error> {
        let guard = lock::acquire_file(&self.lock_path(), holder, stale_after).await?;

        // The previous holder may have written since we loaded
        let (serial, records) = Self::load_state(&self.path).await?;
        let mut state_guard = self.state.write().await;
        if serial != state_guard.serial {
            tracing::debug!(
                "State changed on disk (serial {} -> {}), reloaded",
                state_guard.serial,
                serial
            );
        }
        state_guard.serial = serial;
        state_guard.records = records;
        state_guard.dirty = false;
        drop(state_guard);

        Ok(guard)
    }
}

/// `state.json` -> `state.json<suffix>`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Factory for file state stores
pub struct FileStateStoreFactory;

#[async_trait]
impl StateStoreFactory for FileStateStoreFactory {
    async fn create(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>, Error> {
        match config {
            StateStoreConfig::File { path } => Ok(Box::new(FileStateStore::new(path).await?)),
            _ => Err(Error::config("Invalid config for file state store")),
        }
    }
}
