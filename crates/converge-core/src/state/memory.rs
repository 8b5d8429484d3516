// # Memory State Store
//
// In-memory implementation of StateStore.
//
// ## Purpose
//
// Provides a state store that doesn't persist across restarts. Useful for
// tests, for `plan` runs against a scratch state, and for embedding.
//
// ## Crash Behavior
//
// - All state is lost on restart
// - The next run plans a Create for every declared resource

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::StateStoreConfig;
use crate::state::lock::{self, MemoryLockSlot, StateLock};
use crate::traits::state_store::{StateRecord, StateStore, StateStoreFactory};

/// In-memory state store implementation
///
/// Clones share the same records and the same lock.
///
/// # Example
///
/// ```rust,no_run
/// use converge_core::state::MemoryStateStore;
/// use converge_core::traits::StateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStateStore::new();
///     assert!(store.load().await?.is_empty());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    inner: Arc<RwLock<BTreeMap<String, StateRecord>>>,
    lock: MemoryLockSlot,
}

impl MemoryStateStore {
    /// Create a new empty memory state store
    pub fn new() -> Self {
        Self::seeded(BTreeMap::new())
    }

    /// Get the number of records in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Create a store holding a copy of `records`
    ///
    /// Dry runs execute against a seeded store so the persistent one is
    /// never written.
    pub fn seeded(records: BTreeMap<String, StateRecord>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(records)),
            lock: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<BTreeMap<String, StateRecord>, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn get(&self, name: &str) -> Result<Option<StateRecord>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get(name).cloned())
    }

    async fn put(&self, record: &StateRecord) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Nothing buffered
        Ok(())
    }

    async fn lock(&self, holder: &str, stale_after: Duration) -> Result<StateLock, Error> {
        lock::acquire_memory(&self.lock, holder, stale_after)
    }
}

/// Factory for memory state stores
pub struct MemoryStateStoreFactory;

#[async_trait]
impl StateStoreFactory for MemoryStateStoreFactory {
    async fn create(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>, Error> {
        match config {
            StateStoreConfig::Memory => Ok(Box::new(MemoryStateStore::new())),
            _ => Err(Error::config("Invalid config for memory state store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::Declaration;

    fn record(name: &str) -> StateRecord {
        let decl = Declaration::new("virtual_machine", name).with_attribute("cores", 2);
        StateRecord::from_apply(
            &decl,
            Vec::new(),
            "1".to_string(),
            &decl.attributes,
            &Default::default(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStateStore::new();
        assert!(store.is_empty().await);

        store.put(&record("web")).await.unwrap();
        store.put(&record("db")).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.list().await.unwrap(), vec!["db", "web"]);

        store.delete("web").await.unwrap();
        store.delete("web").await.unwrap();
        assert!(store.get("web").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_seeded_store_is_a_copy() {
        let source = MemoryStateStore::new();
        source.put(&record("web")).await.unwrap();

        let scratch = MemoryStateStore::seeded(source.load().await.unwrap());
        scratch.delete("web").await.unwrap();
        scratch.put(&record("db")).await.unwrap();

        assert_eq!(source.list().await.unwrap(), vec!["web"]);
        assert_eq!(scratch.list().await.unwrap(), vec!["db"]);
    }

    #[tokio::test]
    async fn test_clones_share_lock() {
        let store = MemoryStateStore::new();
        let other = store.clone();

        let _guard = store.lock("first", Duration::from_secs(60)).await.unwrap();
        let err = other.lock("second", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::StateLocked { .. }));
    }
}
