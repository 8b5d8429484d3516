// # Provider Trait
//
// Defines the boundary to the virtualization platform's management API.
//
// ## Implementations
//
// - Proxmox VE: `converge-provider-proxmox` crate
// - Test doubles: `tests/common/mod.rs`
//
// ## Usage
//
// ```rust,ignore
// use converge_core::Provider;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let provider = /* Provider implementation */;
//
//     let vm = provider
//         .create("virtual_machine", "web", Some("debian-12"), &attributes)
//         .await?;
//     let current = provider.get("virtual_machine", &vm.id).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::diff::AttributeChange;
use crate::value::Attributes;

/// What the provider reports about a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedResource {
    /// Provider-assigned identifier (e.g. a VM id)
    pub id: String,
    /// Attributes as observed by the provider (addresses, MACs, ...)
    pub attributes: Attributes,
    /// Whether the resource is ready for dependents to use
    pub ready: bool,
}

impl ProvisionedResource {
    pub fn new(id: impl Into<String>, attributes: Attributes, ready: bool) -> Self {
        Self {
            id: id.into(),
            attributes,
            ready,
        }
    }
}

/// Trait for provider implementations
///
/// The provider is idempotent on read and best-effort on write. It performs
/// one action per call and reports failure through
/// [`Error::Provider`](crate::Error::Provider), flagging whether a retry may
/// help.
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - Perform API calls to the platform endpoint
/// - Wait for a task the platform itself started during this call
/// - Classify failures as transient or permanent
///
/// ## Forbidden Capabilities
/// - Retry or back off on failure (owned by the `Executor`)
/// - Access the state store (owned by the `Executor`)
/// - Decide whether an operation is needed (owned by the diff engine)
/// - Spawn background tasks
///
/// Returning an error is always the correct reaction to a failed call: the
/// executor retries according to its `RetryPolicy`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a resource
    ///
    /// # Parameters
    ///
    /// - `kind`: Resource kind (e.g. "virtual_machine")
    /// - `name`: Logical name, usable as the platform-side name
    /// - `source`: Clone source / template identifier
    /// - `attributes`: Desired attributes with references already resolved
    ///
    /// # Idempotency
    ///
    /// The executor may call `create` again after a transient failure.
    /// Implementations should adopt a resource left behind by an earlier
    /// partial attempt instead of creating a duplicate.
    async fn create(
        &self,
        kind: &str,
        name: &str,
        source: Option<&str>,
        attributes: &Attributes,
    ) -> Result<ProvisionedResource, crate::Error>;

    /// Apply an attribute delta to an existing resource
    ///
    /// `changes` only contains attributes from the kind's mutable subset.
    /// A change whose `new` is `None` removes the attribute.
    async fn update(
        &self,
        kind: &str,
        id: &str,
        changes: &[AttributeChange],
    ) -> Result<ProvisionedResource, crate::Error>;

    /// Destroy a resource
    ///
    /// Destroying a resource that no longer exists must succeed.
    async fn destroy(&self, kind: &str, id: &str) -> Result<(), crate::Error>;

    /// Read the current state of a resource
    ///
    /// # Returns
    ///
    /// - `Ok(Some(resource))`: The resource exists
    /// - `Ok(None)`: The platform does not know this id
    /// - `Err(Error)`: The request failed
    async fn get(&self, kind: &str, id: &str)
    -> Result<Option<ProvisionedResource>, crate::Error>;

    /// Check if this provider manages the given resource kind
    fn supports_kind(&self, kind: &str) -> bool;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;

    /// Whether mutating calls are only logged
    ///
    /// Results of a dry-run provider are never committed to the persistent
    /// state store.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Helper trait for constructing providers from configuration
pub trait ProviderFactory: Send + Sync {
    /// Create a Provider instance from configuration
    fn create(
        &self,
        config: &crate::config::ProviderConfig,
    ) -> Result<Box<dyn Provider>, crate::Error>;
}
