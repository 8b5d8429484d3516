//! Configuration types for the reconciler
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::diff::MutabilityRules;
use crate::retry::RetryPolicy;

/// Main reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeConfig {
    /// Provider configuration
    pub provider: ProviderConfig,

    /// State store configuration
    pub state_store: StateStoreConfig,

    /// Optional executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Which attributes of each kind can change without replacement
    #[serde(default)]
    pub mutability: MutabilityRules,
}

impl ConvergeConfig {
    /// Create a new configuration with defaults
    pub fn new(provider: ProviderConfig, state_store: StateStoreConfig) -> Self {
        Self {
            provider,
            state_store,
            executor: ExecutorConfig::default(),
            mutability: MutabilityRules::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.provider.validate()?;
        self.state_store.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Proxmox VE provider
    Proxmox {
        /// API endpoint, e.g. `https://pve.example.com:8006`
        endpoint: String,
        /// API token id, `user@realm!tokenname`
        token_id: String,
        /// API token secret
        token_secret: String,
        /// Cluster node that hosts the VMs
        node: String,
        /// Accept self-signed certificates
        #[serde(default)]
        insecure_tls: bool,
        /// Log mutations instead of sending them
        #[serde(default)]
        dry_run: bool,
    },

    /// Custom provider
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ProviderConfig {
    /// Validate the provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ProviderConfig::Proxmox {
                endpoint,
                token_id,
                token_secret,
                node,
                ..
            } => {
                if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                    return Err(crate::Error::config(format!(
                        "Proxmox endpoint must be an http(s) URL, got `{}`",
                        endpoint
                    )));
                }
                if !token_id.contains('@') || !token_id.contains('!') {
                    return Err(crate::Error::config(
                        "Proxmox token id must look like `user@realm!tokenname`",
                    ));
                }
                if token_secret.is_empty() {
                    return Err(crate::Error::config("Proxmox token secret cannot be empty"));
                }
                if node.is_empty() {
                    return Err(crate::Error::config("Proxmox node cannot be empty"));
                }
                Ok(())
            }
            ProviderConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom provider factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config(
                        "Custom provider config cannot be null",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the provider type name
    pub fn type_name(&self) -> &str {
        match self {
            ProviderConfig::Proxmox { .. } => "proxmox",
            ProviderConfig::Custom { factory, .. } => factory,
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// File-based state store
    File {
        /// Path to the state file
        path: String,
    },

    /// In-memory state store (not persistent)
    #[default]
    Memory,

    /// Custom state store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StateStoreConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StateStoreConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("State file path cannot be empty"))
            }
            StateStoreConfig::Custom { factory, .. } if factory.is_empty() => Err(
                crate::Error::config("Custom state store factory cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Get the state store type name
    pub fn type_name(&self) -> &str {
        match self {
            StateStoreConfig::File { .. } => "file",
            StateStoreConfig::Memory => "memory",
            StateStoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Backoff settings, in config-friendly units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Per-attempt timeout (seconds); 0 disables it
    #[serde(default)]
    pub attempt_timeout_secs: u64,
}

impl RetryConfig {
    /// Build the policy object handed to the executor
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            attempt_timeout: (self.attempt_timeout_secs > 0)
                .then(|| Duration::from_secs(self.attempt_timeout_secs)),
        }
    }

    fn validate(&self, what: &str) -> Result<(), crate::Error> {
        if self.max_attempts == 0 {
            return Err(crate::Error::config(format!(
                "{} max_attempts must be at least 1",
                what
            )));
        }
        if self.multiplier < 1.0 {
            return Err(crate::Error::config(format!(
                "{} multiplier must be >= 1.0",
                what
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(crate::Error::config(format!(
                "{} max_backoff_ms must be >= initial_backoff_ms",
                what
            )));
        }
        Ok(())
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of operations in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retry policy for provider calls
    #[serde(default = "default_call_retry")]
    pub retry: RetryConfig,

    /// Polling policy while waiting for a resource to become ready
    #[serde(default = "default_readiness")]
    pub readiness: RetryConfig,

    /// Read every managed resource back from the provider before planning
    #[serde(default)]
    pub refresh: bool,

    /// Age after which another holder's state lock is overridden (seconds)
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,

    /// Capacity of the run event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_concurrency == 0 {
            return Err(crate::Error::config("max_concurrency must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config(
                "event_channel_capacity must be at least 1",
            ));
        }
        if self.stale_lock_secs == 0 {
            return Err(crate::Error::config("stale_lock_secs must be at least 1"));
        }
        self.retry.validate("retry")?;
        self.readiness.validate("readiness")?;
        Ok(())
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: default_call_retry(),
            readiness: default_readiness(),
            refresh: false,
            stale_lock_secs: default_stale_lock_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_call_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_backoff_ms: 1_000,
        max_backoff_ms: 30_000,
        multiplier: default_multiplier(),
        attempt_timeout_secs: 300,
    }
}

fn default_readiness() -> RetryConfig {
    RetryConfig {
        max_attempts: 30,
        initial_backoff_ms: 2_000,
        max_backoff_ms: 15_000,
        multiplier: 1.5,
        attempt_timeout_secs: 60,
    }
}

fn default_stale_lock_secs() -> u64 {
    3600
}

fn default_event_channel_capacity() -> usize {
    1000
}
