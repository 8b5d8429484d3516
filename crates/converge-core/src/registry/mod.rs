//! Plugin-based registry
//!
//! Providers and state stores are registered by name at startup and built
//! from configuration, so the binary never carries a hardcoded if-else chain
//! over implementations.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use converge_core::registry::Registry;
//!
//! let registry = Registry::with_builtin_stores();
//! converge_provider_proxmox::register(&registry);
//!
//! let provider = registry.create_provider(&config.provider)?;
//! let store = registry.create_state_store(&config.state_store).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{ProviderConfig, StateStoreConfig};
use crate::error::{Error, Result};
use crate::state::{FileStateStoreFactory, MemoryStateStoreFactory};
use crate::traits::{Provider, ProviderFactory, StateStore, StateStoreFactory};

/// Registry of provider and state store factories
///
/// ## Thread Safety
///
/// Interior mutability with `RwLock`: concurrent reads, exclusive writes.
/// Poisoned locks are recovered.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
    state_stores: RwLock<HashMap<String, Arc<dyn StateStoreFactory>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file` and `memory` state stores registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_state_store("file", Box::new(FileStateStoreFactory));
        registry.register_state_store("memory", Box::new(MemoryStateStoreFactory));
        registry
    }

    /// Register a provider factory
    ///
    /// # Parameters
    ///
    /// - `name`: Provider type name (e.g., "proxmox")
    /// - `factory`: Factory object for creating provider instances
    pub fn register_provider(&self, name: impl Into<String>, factory: Box<dyn ProviderFactory>) {
        write(&self.providers).insert(name.into(), Arc::from(factory));
    }

    /// Register a state store factory
    pub fn register_state_store(
        &self,
        name: impl Into<String>,
        factory: Box<dyn StateStoreFactory>,
    ) {
        write(&self.state_stores).insert(name.into(), Arc::from(factory));
    }

    /// Create a provider from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Provider>)`: Created provider instance
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_provider(&self, config: &ProviderConfig) -> Result<Box<dyn Provider>> {
        let provider_type = config.type_name();
        let factory = read(&self.providers)
            .get(provider_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown provider type: {}", provider_type)))?;

        factory.create(config)
    }

    /// Create a state store from configuration
    pub async fn create_state_store(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>> {
        let store_type = config.type_name();
        // Clone the factory out so no lock guard is held across the await
        let factory = read(&self.state_stores)
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown state store type: {}", store_type)))?;

        factory.create(config).await
    }

    /// Registered provider type names, sorted
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.providers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered state store type names, sorted
    pub fn list_state_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.state_stores).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_provider(&self, name: &str) -> bool {
        read(&self.providers).contains_key(name)
    }

    pub fn has_state_store(&self, name: &str) -> bool {
        read(&self.state_stores).contains_key(name)
    }
}
