//! Reconciliation engine
//!
//! The [`Reconciler`] runs one reconciliation against a provider and a state
//! store:
//!
//! ```text
//!                ┌──────────────┐
//!  DesiredState ─►  Reconciler  │
//!                └──────────────┘
//!                        │
//!     ┌──────────────────┼──────────────────┬──────────────────┐
//!     ▼                  ▼                  ▼                  ▼
//! ┌────────┐      ┌─────────────┐     ┌──────────┐      ┌────────────┐
//! │  lock  │ ───► │ diff (plan) │ ──► │ Executor │ ───► │  outputs   │
//! └────────┘      └─────────────┘     └──────────┘      └────────────┘
//!                                          │
//!                                          ▼
//!                                  ┌──────────────┐
//!                                  │ RunEvent tx  │
//!                                  └──────────────┘
//! ```
//!
//! ## Run Flow
//!
//! 1. Acquire the advisory state lock (a concurrent run is rejected)
//! 2. Optionally refresh records from the provider
//! 3. Diff the desired state against the state snapshot
//! 4. Execute the plan, committing after every successful operation
//! 5. Flush the state store and publish outputs
//!
//! With a dry-run provider, steps 2 to 5 work on an in-memory copy of the
//! state, so the persistent store is left untouched.
//!
//! The lock is released when the run returns, successful or not.

pub mod executor;
pub mod report;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::config::ConvergeConfig;
use crate::desired::DesiredState;
use crate::diff::{MutabilityRules, OperationKind, Plan, diff};
use crate::error::Result;
use crate::output::{self, Outputs};
use crate::state::MemoryStateStore;
use crate::traits::{Provider, StateStore};

pub use executor::{Executor, RefreshReport};
pub use report::{ResourceOutcome, ResourceStatus, RunReport};

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Execution of a plan began
    RunStarted {
        operations: usize,
        changes: usize,
    },

    /// An operation was handed to the provider
    OperationStarted {
        index: usize,
        resource: String,
        kind: OperationKind,
    },

    /// A provider call failed and will be retried
    AttemptFailed {
        resource: String,
        attempt: u32,
        error: String,
    },

    /// An operation's result was written to the state store
    OperationCommitted {
        resource: String,
        kind: OperationKind,
    },

    /// An operation failed for good
    OperationFailed {
        resource: String,
        kind: OperationKind,
        error: String,
    },

    /// A resource was not attempted because a dependency did not commit
    ResourceSkipped {
        resource: String,
        blocked_by: String,
    },

    /// Execution ended
    RunFinished {
        committed: usize,
        failed: usize,
        skipped: usize,
        pending: usize,
    },
}

/// Sending half of the event channel
///
/// Never blocks: when the channel is full the event is dropped with a
/// warning, and a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub(crate) struct EventSink(mpsc::Sender<RunEvent>);

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self(tx)
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        match self.0.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Event channel full, dropping {:?}. Consider increasing event_channel_capacity.",
                    event
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Result of [`Reconciler::apply`]
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The plan that was executed
    pub plan: Plan,
    /// Per-resource outcome
    pub report: RunReport,
    /// Output bindings, resolved or unavailable
    pub outputs: Outputs,
    /// What the optional refresh changed
    pub refresh: Option<RefreshReport>,
}

/// Runs plan and apply against one provider and one state store
///
/// ## Lifecycle
///
/// 1. Create with [`Reconciler::new()`], keep the event receiver
/// 2. Call [`Reconciler::plan()`] to preview, [`Reconciler::apply()`] to converge
/// 3. Drop when done
pub struct Reconciler {
    provider: Arc<dyn Provider>,
    state_store: Arc<dyn StateStore>,
    executor: Executor,
    rules: MutabilityRules,
    refresh: bool,
    stale_lock_after: std::time::Duration,
    holder: String,
}

impl Reconciler {
    /// Create a reconciler
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, event_receiver) where event_receiver yields
    /// run events
    pub fn new(
        provider: Arc<dyn Provider>,
        state_store: Arc<dyn StateStore>,
        config: &ConvergeConfig,
    ) -> Result<(Self, mpsc::Receiver<RunEvent>)> {
        config.executor.validate()?;

        let (tx, rx) = mpsc::channel(config.executor.event_channel_capacity);
        let executor = Executor::new(provider.clone(), state_store.clone(), tx)
            .with_retry(config.executor.retry.to_policy())
            .with_readiness(config.executor.readiness.to_policy())
            .with_max_concurrency(config.executor.max_concurrency);

        let reconciler = Self {
            provider,
            state_store,
            executor,
            rules: config.mutability.clone(),
            refresh: config.executor.refresh,
            stale_lock_after: config.executor.stale_lock_after(),
            holder: format!("converge@{}", hostname()),
        };
        Ok((reconciler, rx))
    }

    /// Override the lock holder description
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Compute the plan without changing anything
    pub async fn plan(&self, desired: &DesiredState) -> Result<Plan> {
        self.check_kinds(desired)?;
        let snapshot = self.state_store.load().await?;
        let plan = diff(desired, &snapshot, &self.rules);
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Converge the desired state
    pub async fn apply(&self, desired: &DesiredState) -> Result<RunSummary> {
        self.apply_with_cancel(desired, None).await
    }

    /// Converge, stopping new operations once `cancel` turns `true`
    ///
    /// Failed operations do not make this return `Err`; inspect
    /// `summary.report` or call `RunReport::into_result`.
    pub async fn apply_with_cancel(
        &self,
        desired: &DesiredState,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunSummary> {
        self.check_kinds(desired)?;

        let lock = self
            .state_store
            .lock(&self.holder, self.stale_lock_after)
            .await?;
        debug!("Acquired state lock as {}", lock.info().holder);

        let (executor, store) = if self.provider.is_dry_run() {
            let scratch: Arc<dyn StateStore> =
                Arc::new(MemoryStateStore::seeded(self.state_store.load().await?));
            info!("Dry run: commits go to a scratch copy of the state");
            (self.executor.with_state_store(scratch.clone()), scratch)
        } else {
            (self.executor.clone(), self.state_store.clone())
        };

        let refresh = if self.refresh {
            Some(executor.refresh().await?)
        } else {
            None
        };

        let snapshot = store.load().await?;
        let plan = diff(desired, &snapshot, &self.rules);
        info!("Plan: {}", plan.summary());

        let report = executor
            .execute_with_cancel(&plan, desired, cancel)
            .await?;
        store.flush().await?;

        let records = store.load().await?;
        let outputs = output::publish(desired.outputs(), &report, &records);
        for (name, value) in &outputs {
            if !value.is_available() {
                warn!("Output {} unavailable: {:?}", name, value);
            }
        }

        drop(lock);
        Ok(RunSummary {
            plan,
            report,
            outputs,
            refresh,
        })
    }

    /// Resolve outputs from the state store without running
    pub async fn outputs(&self, desired: &DesiredState) -> Result<Outputs> {
        let records = self.state_store.load().await?;
        Ok(output::from_state(desired.outputs(), &records))
    }

    /// Fail before planning when the provider cannot manage a declared kind
    fn check_kinds(&self, desired: &DesiredState) -> Result<()> {
        let unsupported: Vec<String> = desired
            .iter()
            .filter(|decl| !self.provider.supports_kind(&decl.kind))
            .map(|decl| decl.name.clone())
            .collect();
        if unsupported.is_empty() {
            return Ok(());
        }
        Err(crate::Error::validation(
            format!(
                "provider {} does not support the declared kind",
                self.provider.provider_name()
            ),
            unsupported,
        ))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
