// # converge-core
//
// Core library for the declarative infrastructure reconciler.
//
// ## Architecture Overview
//
// This library turns a desired-state description into provisioned
// infrastructure and keeps the two converged:
// - **DesiredState**: validated, topologically ordered resource graph
// - **StateStore**: trait for the last-known actual state (file, memory)
// - **diff**: compares the two and produces an ordered `Plan`
// - **Executor**: applies a plan through a `Provider`, committing as it goes
// - **Reconciler**: lock, refresh, diff, execute, publish outputs
// - **Registry**: plugin-based registry for providers and state stores
//
// ## Design Principles
//
// 1. **Separation of Concerns**: planning never mutates; only the executor writes state
// 2. **Plugin-Based**: providers are registered by name, no hard-coded if-else
// 3. **Library-First**: the CLI is a thin wrapper around `Reconciler`
// 4. **Explicit Handles**: the state store is passed in and locked, never global
// 5. **Resumable**: a failed run leaves state as of the last commit

pub mod config;
pub mod desired;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod output;
pub mod registry;
pub mod retry;
pub mod state;
pub mod traits;
pub mod value;

// Re-export core types for convenience
pub use config::{ConvergeConfig, ExecutorConfig, ProviderConfig, RetryConfig, StateStoreConfig};
pub use desired::{Declaration, DesiredState, OutputBinding, Reference};
pub use diff::{AttributeChange, MutabilityRules, Operation, OperationKind, Plan, diff};
pub use engine::{
    Executor, Reconciler, RefreshReport, ResourceOutcome, ResourceStatus, RunEvent, RunReport,
    RunSummary,
};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use output::{OutputValue, Outputs};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use state::{FileStateStore, MemoryStateStore, StateLock};
pub use traits::{Provider, ProvisionedResource, StateRecord, StateStore};
pub use value::{AttrValue, Attributes};
