//! Plan executor
//!
//! Applies a [`Plan`] against a [`Provider`] and commits every successful
//! operation to the [`StateStore`].
//!
//! ## Scheduling
//!
//! An operation starts once every operation it waits for has committed.
//! Ready operations run as tokio tasks in a `JoinSet`, at most
//! `max_concurrency` at a time. Tasks only talk to the provider; the loop in
//! [`Executor::execute`] is the only writer of the state store, so commits
//! are linearized and a dependency is always committed before its dependent
//! starts.
//!
//! ## Failure isolation
//!
//! A failed operation does not stop its siblings. Operations that wait on a
//! failed (or skipped) operation are marked `Skipped`.
//!
//! ## Cancellation
//!
//! When the cancel signal fires, no new operation starts. In-flight provider
//! calls run to completion (or to their attempt timeout) and are committed
//! normally. Everything else stays `Pending`.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::report::{ResourceStatus, RunReport};
use super::{EventSink, RunEvent};
use crate::desired::{DesiredState, Reference, reference};
use crate::diff::{AttributeChange, Operation, OperationKind, Plan};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::traits::{Provider, ProvisionedResource, StateRecord, StateStore};
use crate::value::{Attributes, lookup_path};

/// What a refresh changed in the state store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Records whose observed attributes were re-read
    pub refreshed: Vec<String>,
    /// Records dropped because the provider no longer knows the resource
    pub removed: Vec<String>,
}

/// Everything a provider task needs, cheap to clone into it
#[derive(Clone)]
struct StepContext {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    readiness: RetryPolicy,
    events: EventSink,
}

/// One provider-facing step of an operation
#[derive(Debug)]
enum Step {
    Create {
        kind: String,
        source: Option<String>,
        attributes: Attributes,
    },
    Update {
        kind: String,
        id: String,
        changes: Vec<AttributeChange>,
    },
    Destroy {
        kind: String,
        id: String,
    },
}

enum StepOutcome {
    Provisioned(ProvisionedResource),
    Destroyed,
}

/// Applies plans; see the module docs for the scheduling rules
#[derive(Clone)]
pub struct Executor {
    ctx: StepContext,
    state_store: Arc<dyn StateStore>,
    max_concurrency: usize,
}

impl Executor {
    /// Create an executor with default retry policies and a concurrency of 4
    pub fn new(
        provider: Arc<dyn Provider>,
        state_store: Arc<dyn StateStore>,
        events: mpsc::Sender<RunEvent>,
    ) -> Self {
        Self {
            ctx: StepContext {
                provider,
                retry: RetryPolicy::default(),
                readiness: RetryPolicy::default(),
                events: EventSink::new(events),
            },
            state_store,
            max_concurrency: 4,
        }
    }

    /// Policy for create, update, destroy and refresh calls
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.ctx.retry = policy;
        self
    }

    /// Policy for polling `get` until the resource is ready
    pub fn with_readiness(mut self, policy: RetryPolicy) -> Self {
        self.ctx.readiness = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Same provider and policies, committing to `state_store` instead
    pub fn with_state_store(&self, state_store: Arc<dyn StateStore>) -> Self {
        Self {
            state_store,
            ..self.clone()
        }
    }

    /// Execute a plan to completion
    pub async fn execute(&self, plan: &Plan, desired: &DesiredState) -> Result<RunReport> {
        self.execute_with_cancel(plan, desired, None).await
    }

    /// Execute a plan, stopping new launches once `cancel` turns `true`
    ///
    /// # Returns
    ///
    /// - `Ok(report)`: Every operation reached a final status, or was left
    ///   pending by cancellation. Failures are in the report.
    /// - `Err(Error)`: The state store could not be read, or an operation
    ///   task panicked.
    pub async fn execute_with_cancel(
        &self,
        plan: &Plan,
        desired: &DesiredState,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunReport> {
        let mut records = self.state_store.load().await?;
        let mut report = RunReport::pending(plan);
        let mut resolved: BTreeMap<usize, Attributes> = BTreeMap::new();
        let mut tasks: JoinSet<(usize, Result<StepOutcome>)> = JoinSet::new();
        let mut cancelled = cancel.as_ref().is_some_and(|rx| *rx.borrow());
        let mut halted = false;

        let changes = plan.operations().iter().filter(|op| op.is_change()).count();
        info!(
            "Executing plan: {} operation(s), {} change(s)",
            plan.len(),
            changes
        );
        self.ctx.events.emit(RunEvent::RunStarted {
            operations: plan.len(),
            changes,
        });

        loop {
            let mut progressed = self.skip_blocked(plan, &mut report);

            if !cancelled && !halted {
                for op in plan.operations() {
                    if tasks.len() >= self.max_concurrency {
                        break;
                    }
                    if report.status(op.index) != ResourceStatus::Pending
                        || !op
                            .wait_for
                            .iter()
                            .all(|w| report.status(*w) == ResourceStatus::Committed)
                    {
                        continue;
                    }
                    progressed = true;
                    self.launch(op, desired, &records, &mut report, &mut resolved, &mut tasks);
                }
            }

            if tasks.is_empty() {
                if progressed && !cancelled && !halted {
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (index, outcome) = joined
                        .map_err(|e| Error::Other(format!("operation task failed: {}", e)))?;
                    let Some(op) = plan.get(index) else { continue };

                    let committed = self
                        .finish(op, outcome, desired, &mut records, &mut report, &resolved)
                        .await;
                    match committed {
                        Ok(None) => {}
                        Ok(Some(_)) if halted => {
                            let detail = "destroyed; recreate not started after a failed state commit";
                            warn!("{} {}", op.resource, detail);
                            report.set(index, ResourceStatus::Failed, Some(detail.to_string()));
                            self.ctx.events.emit(RunEvent::OperationFailed {
                                resource: op.resource.clone(),
                                kind: op.kind,
                                error: detail.to_string(),
                            });
                        }
                        Ok(Some(next)) => self.spawn(&mut tasks, index, op.resource.clone(), next),
                        Err(e) => {
                            error!("State commit for {} failed, halting run: {}", op.resource, e);
                            report.set(index, ResourceStatus::Failed, Some(format!("state commit failed: {}", e)));
                            self.ctx.events.emit(RunEvent::OperationFailed {
                                resource: op.resource.clone(),
                                kind: op.kind,
                                error: e.to_string(),
                            });
                            halted = true;
                        }
                    }
                }
                _ = wait_for_cancel(&mut cancel), if !cancelled => {
                    cancelled = true;
                    report.mark_cancelled();
                    warn!(
                        "Cancellation requested; waiting for {} in-flight operation(s)",
                        tasks.len()
                    );
                }
            }
        }

        if cancelled {
            report.mark_cancelled();
        }

        let finished = RunEvent::RunFinished {
            committed: report.committed().len(),
            failed: report.failed().len(),
            skipped: report.skipped().len(),
            pending: report.never_attempted().len(),
        };
        info!("Run finished: {:?}", finished);
        self.ctx.events.emit(finished);

        Ok(report)
    }

    /// Mark pending operations whose prerequisites failed or were skipped
    ///
    /// Prerequisites always have smaller indices, so one forward pass
    /// reaches every transitive dependent.
    fn skip_blocked(&self, plan: &Plan, report: &mut RunReport) -> bool {
        let mut changed = false;
        for op in plan.operations() {
            if report.status(op.index) != ResourceStatus::Pending {
                continue;
            }
            let blocker = op.wait_for.iter().copied().find(|w| {
                matches!(
                    report.status(*w),
                    ResourceStatus::Failed | ResourceStatus::Skipped
                )
            });
            if let Some(blocker) = blocker {
                let blocked_by = plan
                    .get(blocker)
                    .map(|b| b.resource.clone())
                    .unwrap_or_default();
                info!("Skipping {}: {} did not commit", op.resource, blocked_by);
                report.set(op.index, ResourceStatus::Skipped, Some(format!("blocked by {}", blocked_by)));
                self.ctx.events.emit(RunEvent::ResourceSkipped {
                    resource: op.resource.clone(),
                    blocked_by,
                });
                changed = true;
            }
        }
        changed
    }

    /// Start one ready operation
    ///
    /// NoOps commit immediately. References are resolved here, against the
    /// records committed so far; an unresolvable reference fails the
    /// operation without calling the provider.
    fn launch(
        &self,
        op: &Operation,
        desired: &DesiredState,
        records: &BTreeMap<String, StateRecord>,
        report: &mut RunReport,
        resolved: &mut BTreeMap<usize, Attributes>,
        tasks: &mut JoinSet<(usize, Result<StepOutcome>)>,
    ) {
        if op.kind == OperationKind::NoOp {
            debug!("{} is up to date", op.resource);
            report.set(op.index, ResourceStatus::Committed, None);
            self.ctx.events.emit(RunEvent::OperationCommitted {
                resource: op.resource.clone(),
                kind: op.kind,
            });
            return;
        }

        let step = match self.first_step(op, desired, records, resolved) {
            Ok(step) => step,
            Err(e) => {
                warn!("{} {} failed before any provider call: {}", op.kind, op.resource, e);
                report.set(op.index, ResourceStatus::Failed, Some(e.to_string()));
                self.ctx.events.emit(RunEvent::OperationFailed {
                    resource: op.resource.clone(),
                    kind: op.kind,
                    error: e.to_string(),
                });
                return;
            }
        };

        info!("{} {}", op.kind, op.resource);
        report.set(op.index, ResourceStatus::InProgress, None);
        self.ctx.events.emit(RunEvent::OperationStarted {
            index: op.index,
            resource: op.resource.clone(),
            kind: op.kind,
        });
        self.spawn(tasks, op.index, op.resource.clone(), step);
    }

    fn first_step(
        &self,
        op: &Operation,
        desired: &DesiredState,
        records: &BTreeMap<String, StateRecord>,
        resolved: &mut BTreeMap<usize, Attributes>,
    ) -> Result<Step> {
        let prior = || {
            op.prior.as_ref().ok_or_else(|| {
                Error::not_found(format!("no state record for {}", op.resource))
            })
        };

        match op.kind {
            OperationKind::Destroy => {
                let prior = prior()?;
                Ok(Step::Destroy {
                    kind: prior.kind.clone(),
                    id: prior.id.clone(),
                })
            }
            OperationKind::Replace => {
                let attributes = resolve_declared(op, desired, records)?;
                resolved.insert(op.index, attributes);
                let prior = prior()?;
                Ok(Step::Destroy {
                    kind: prior.kind.clone(),
                    id: prior.id.clone(),
                })
            }
            OperationKind::Create => {
                let attributes = resolve_declared(op, desired, records)?;
                resolved.insert(op.index, attributes.clone());
                Ok(Step::Create {
                    kind: op.resource_kind.clone(),
                    source: desired.get(&op.resource).and_then(|d| d.source.clone()),
                    attributes,
                })
            }
            OperationKind::UpdateInPlace => {
                let attributes = resolve_declared(op, desired, records)?;
                let changes = op
                    .changes
                    .iter()
                    .map(|change| AttributeChange {
                        name: change.name.clone(),
                        old: change.old.clone(),
                        new: change
                            .new
                            .as_ref()
                            .and_then(|_| attributes.get(&change.name).cloned()),
                    })
                    .collect();
                resolved.insert(op.index, attributes);
                let prior = prior()?;
                Ok(Step::Update {
                    kind: op.resource_kind.clone(),
                    id: prior.id.clone(),
                    changes,
                })
            }
            OperationKind::NoOp => Err(Error::Other("no-op has no provider step".to_string())),
        }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<(usize, Result<StepOutcome>)>,
        index: usize,
        resource: String,
        step: Step,
    ) {
        let ctx = self.ctx.clone();
        tasks.spawn(async move {
            let outcome = run_step(&ctx, &resource, step).await;
            (index, outcome)
        });
    }

    /// Commit the result of a finished step
    ///
    /// Returns the follow-up step of a Replace whose destroy just committed.
    /// Returns `Err` only when the state store write fails.
    async fn finish(
        &self,
        op: &Operation,
        outcome: Result<StepOutcome>,
        desired: &DesiredState,
        records: &mut BTreeMap<String, StateRecord>,
        report: &mut RunReport,
        resolved: &BTreeMap<usize, Attributes>,
    ) -> Result<Option<Step>> {
        let provisioned = match outcome {
            Err(e) => {
                error!("{} {} failed: {}", op.kind, op.resource, e);
                report.set(op.index, ResourceStatus::Failed, Some(e.to_string()));
                self.ctx.events.emit(RunEvent::OperationFailed {
                    resource: op.resource.clone(),
                    kind: op.kind,
                    error: e.to_string(),
                });
                return Ok(None);
            }
            Ok(StepOutcome::Destroyed) => {
                self.state_store.delete(&op.resource).await?;
                records.remove(&op.resource);

                if op.kind == OperationKind::Replace {
                    // Old resource is gone and forgotten; now build the new one
                    debug!("{} destroyed, recreating", op.resource);
                    return Ok(Some(Step::Create {
                        kind: op.resource_kind.clone(),
                        source: desired.get(&op.resource).and_then(|d| d.source.clone()),
                        attributes: resolved.get(&op.index).cloned().unwrap_or_default(),
                    }));
                }

                info!("Destroyed {}", op.resource);
                report.set(op.index, ResourceStatus::Committed, None);
                self.ctx.events.emit(RunEvent::OperationCommitted {
                    resource: op.resource.clone(),
                    kind: op.kind,
                });
                return Ok(None);
            }
            Ok(StepOutcome::Provisioned(resource)) => resource,
        };

        let Some(declaration) = desired.get(&op.resource) else {
            return Err(Error::not_found(format!(
                "{} is not in the desired state",
                op.resource
            )));
        };

        let mut observed = Attributes::new();
        if op.kind == OperationKind::UpdateInPlace {
            // Keep what the provider told us earlier about fields it owns
            if let Some(prior) = &op.prior {
                observed.extend(
                    prior
                        .attributes
                        .iter()
                        .filter(|(k, _)| {
                            !prior.declared.contains_key(*k)
                                && !declaration.attributes.contains_key(*k)
                        })
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
        }
        observed.extend(provisioned.attributes.clone());

        let record = StateRecord::from_apply(
            declaration,
            desired.dependencies_of(&op.resource).cloned().collect(),
            provisioned.id.clone(),
            resolved.get(&op.index).unwrap_or(&declaration.attributes),
            &observed,
        );
        self.state_store.put(&record).await?;
        records.insert(record.name.clone(), record);

        info!("Committed {} {} (id {})", op.kind, op.resource, provisioned.id);
        report.set(op.index, ResourceStatus::Committed, None);
        self.ctx.events.emit(RunEvent::OperationCommitted {
            resource: op.resource.clone(),
            kind: op.kind,
        });
        Ok(None)
    }

    /// Re-read every recorded resource from the provider
    ///
    /// Records whose resource is gone are deleted so the next plan recreates
    /// them. Otherwise observed attributes are updated; the fingerprint and
    /// declared attributes are left alone.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let records = self.state_store.load().await?;
        let provider = self.ctx.provider.as_ref();
        let mut report = RefreshReport::default();

        for record in records.values() {
            let current = self
                .ctx
                .retry
                .run(
                    &format!("refresh {}", record.name),
                    |_| provider.get(&record.kind, &record.id),
                    |_, _| {},
                )
                .await?;

            match current {
                None => {
                    warn!(
                        "{} ({}) no longer exists at the provider; dropping its record",
                        record.name, record.id
                    );
                    self.state_store.delete(&record.name).await?;
                    report.removed.push(record.name.clone());
                }
                Some(current) => {
                    let mut updated = record.clone();
                    updated.attributes.extend(current.attributes);
                    if updated != *record {
                        updated.last_updated = chrono::Utc::now();
                        self.state_store.put(&updated).await?;
                    }
                    report.refreshed.push(record.name.clone());
                }
            }
        }

        debug!(
            "Refresh: {} refreshed, {} removed",
            report.refreshed.len(),
            report.removed.len()
        );
        Ok(report)
    }
}

/// Resolve every declared attribute of the operation's resource
fn resolve_declared(
    op: &Operation,
    desired: &DesiredState,
    records: &BTreeMap<String, StateRecord>,
) -> Result<Attributes> {
    let declaration = desired.get(&op.resource).ok_or_else(|| {
        Error::not_found(format!("{} is not in the desired state", op.resource))
    })?;

    let lookup = |r: &Reference| {
        records
            .get(&r.resource)
            .and_then(|record| lookup_path(&record.attributes, &r.path_segments()))
            .cloned()
    };

    declaration
        .attributes
        .iter()
        .map(|(name, value)| {
            reference::interpolate(value, &lookup)
                .map(|v| (name.clone(), v))
                .map_err(|r| {
                    Error::validation(
                        format!("attribute `{}`: `${{{}}}` has no committed value", name, r),
                        [op.resource.clone(), r.resource.clone()],
                    )
                })
        })
        .collect()
}

/// Run one provider step with retries, then wait for readiness
async fn run_step(ctx: &StepContext, resource: &str, step: Step) -> Result<StepOutcome> {
    let provider = ctx.provider.as_ref();
    let on_failure = |attempt: u32, e: &Error| {
        ctx.events.emit(RunEvent::AttemptFailed {
            resource: resource.to_string(),
            attempt,
            error: e.to_string(),
        });
    };

    match step {
        Step::Destroy { kind, id } => {
            ctx.retry
                .run(
                    &format!("destroy {}", resource),
                    |_| provider.destroy(&kind, &id),
                    on_failure,
                )
                .await?;
            Ok(StepOutcome::Destroyed)
        }
        Step::Create {
            kind,
            source,
            attributes,
        } => {
            let created = ctx
                .retry
                .run(
                    &format!("create {}", resource),
                    |_| provider.create(&kind, resource, source.as_deref(), &attributes),
                    on_failure,
                )
                .await?;
            wait_ready(ctx, &kind, resource, created, on_failure).await
        }
        Step::Update { kind, id, changes } => {
            let updated = ctx
                .retry
                .run(
                    &format!("update {}", resource),
                    |_| provider.update(&kind, &id, &changes),
                    on_failure,
                )
                .await?;
            wait_ready(ctx, &kind, resource, updated, on_failure).await
        }
    }
}

/// Poll `get` until the provider reports the resource ready
async fn wait_ready<N>(
    ctx: &StepContext,
    kind: &str,
    resource: &str,
    provisioned: ProvisionedResource,
    on_failure: N,
) -> Result<StepOutcome>
where
    N: FnMut(u32, &Error),
{
    if provisioned.ready {
        return Ok(StepOutcome::Provisioned(provisioned));
    }

    let provider = ctx.provider.as_ref();
    let id = provisioned.id.as_str();
    let ready = ctx
        .readiness
        .run(
            &format!("wait for {} ready", resource),
            |_| async move {
                match provider.get(kind, id).await? {
                    Some(current) if current.ready => Ok(current),
                    Some(_) => Err(Error::transient(
                        provider.provider_name(),
                        format!("{} ({}) is not ready yet", resource, id),
                    )),
                    None => Err(Error::transient(
                        provider.provider_name(),
                        format!("{} ({}) is not visible yet", resource, id),
                    )),
                }
            },
            on_failure,
        )
        .await
        .map_err(|e| Error::Other(format!("{} did not become ready: {}", resource, e)))?;

    // Keep attributes returned by the mutating call that `get` does not report
    let mut attributes = provisioned.attributes;
    attributes.extend(ready.attributes);
    Ok(StepOutcome::Provisioned(ProvisionedResource::new(
        ready.id, attributes, true,
    )))
}

/// Resolve once `cancel` holds `true`; never resolves without a receiver
async fn wait_for_cancel(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling
            return std::future::pending().await;
        }
    }
}
