// # State Store Trait
//
// Defines the interface for persisting the last-known actual state of every
// managed resource.
//
// ## Purpose
//
// The state store records, per logical name:
// - The provider-assigned id and the attributes observed after apply
// - The declaration (kind, source, attributes) that produced the resource,
//   and its fingerprint
// - The dependencies at apply time, so orphans can be destroyed in reverse
//   dependency order
//
// ## Implementations
//
// - File-based: versioned JSON document, atomic rename on every write
// - Memory: tests and dry runs
//
// ## Usage
//
// ```rust,ignore
// use converge_core::StateStore;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let store = /* StateStore implementation */;
//
//     let _lock = store.lock("converge apply", Duration::from_secs(3600)).await?;
//     let snapshot = store.load().await?;
//     store.put(&record).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::desired::Declaration;
use crate::fingerprint::Fingerprint;
use crate::state::StateLock;
use crate::value::Attributes;

/// Last-known state of one provisioned resource
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateRecord {
    /// Logical name
    pub name: String,
    /// Resource kind
    pub kind: String,
    /// Provider-assigned identifier
    pub id: String,
    /// Clone source used at creation
    #[serde(default)]
    pub source: Option<String>,
    /// Declared attributes (references unresolved) the resource was built from
    #[serde(default)]
    pub declared: Attributes,
    /// Attributes as last observed from the provider
    #[serde(default)]
    pub attributes: Attributes,
    /// Fingerprint of the declaration
    pub fingerprint: Fingerprint,
    /// Logical names this resource depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Timestamp of the last committed operation
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl StateRecord {
    /// Build the record committed after a successful create or update
    ///
    /// Observed attributes are the resolved desired attributes overlaid with
    /// whatever the provider reported, plus the `id`.
    pub fn from_apply(
        declaration: &Declaration,
        dependencies: Vec<String>,
        id: String,
        resolved: &Attributes,
        observed: &Attributes,
    ) -> Self {
        let mut attributes = resolved.clone();
        attributes.extend(observed.iter().map(|(k, v)| (k.clone(), v.clone())));
        attributes.insert("id".to_string(), id.clone().into());

        Self {
            name: declaration.name.clone(),
            kind: declaration.kind.clone(),
            id,
            source: declaration.source.clone(),
            declared: declaration.attributes.clone(),
            attributes,
            fingerprint: declaration.fingerprint(),
            dependencies,
            last_updated: chrono::Utc::now(),
        }
    }

    /// Recompute the fingerprint from the stored declaration
    pub fn declared_fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.kind, self.source.as_deref(), &self.declared)
    }
}

/// Trait for state store implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - Perform I/O for persistent storage
/// - Implement locking for single-writer access
/// - Cache state in memory (with explicit flush)
///
/// ## Forbidden Capabilities
/// - Repair a document it cannot parse (must fail with `CorruptState`)
/// - Decide which operations to run (owned by the diff engine)
/// - Call the provider (owned by the `Executor`)
///
/// ## Implementation Guidelines
///
/// - **Atomic writes**: a crash between two `put` calls never loses a
///   previously committed record
/// - **Async I/O only**
/// - **No background tasks**
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Snapshot of every record (empty on first run)
    async fn load(&self) -> Result<BTreeMap<String, StateRecord>, crate::Error>;

    /// Get one record
    ///
    /// # Returns
    ///
    /// - `Ok(Some(StateRecord))`: The record
    /// - `Ok(None)`: No record for this name
    /// - `Err(Error)`: Storage error
    async fn get(&self, name: &str) -> Result<Option<StateRecord>, crate::Error>;

    /// Create or overwrite the record for `record.name`
    async fn put(&self, record: &StateRecord) -> Result<(), crate::Error>;

    /// Delete a record
    ///
    /// Deleting a missing record succeeds.
    async fn delete(&self, name: &str) -> Result<(), crate::Error>;

    /// List all record names in the store
    async fn list(&self) -> Result<Vec<String>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;

    /// Acquire the single-writer advisory lock
    ///
    /// A lock held longer than `stale_after` is overridden. Otherwise a
    /// held lock fails with [`Error::StateLocked`](crate::Error::StateLocked).
    async fn lock(&self, holder: &str, stale_after: Duration)
    -> Result<StateLock, crate::Error>;
}

/// Helper trait for constructing state stores from configuration
#[async_trait]
pub trait StateStoreFactory: Send + Sync {
    /// Create a StateStore instance from configuration
    async fn create(
        &self,
        config: &crate::config::StateStoreConfig,
    ) -> Result<Box<dyn StateStore>, crate::Error>;
}
