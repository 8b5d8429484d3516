//! Core traits for the reconciler
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Provider`]: Create, update, destroy and read resources on the platform
//! - [`StateStore`]: Persistent record of what was provisioned

pub mod provider;
pub mod state_store;

pub use provider::{Provider, ProviderFactory, ProvisionedResource};
pub use state_store::{StateRecord, StateStore, StateStoreFactory};
