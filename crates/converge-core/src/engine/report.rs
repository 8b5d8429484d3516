//! Per-run outcome of every planned operation

use serde::Serialize;
use std::fmt;

use crate::diff::{OperationKind, Plan};
use crate::error::{Error, Result};

/// Where a resource ended up in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Never attempted (run cancelled or halted)
    Pending,
    /// Provider call in flight
    InProgress,
    /// Operation applied and recorded in the state store
    Committed,
    /// Operation failed after retries
    Failed,
    /// Not attempted because a dependency failed or was skipped
    Skipped,
}

impl ResourceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Committed | ResourceStatus::Failed | ResourceStatus::Skipped
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::InProgress => "in progress",
            ResourceStatus::Committed => "committed",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub resource: String,
    pub operation: OperationKind,
    pub status: ResourceStatus,
    /// Failure message, or the dependency that caused a skip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Explicit per-resource list produced by every run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    resources: Vec<ResourceOutcome>,
    cancelled: bool,
}

impl RunReport {
    /// All operations of the plan, pending
    pub fn pending(plan: &Plan) -> Self {
        Self {
            resources: plan
                .operations()
                .iter()
                .map(|op| ResourceOutcome {
                    resource: op.resource.clone(),
                    operation: op.kind,
                    status: ResourceStatus::Pending,
                    detail: None,
                })
                .collect(),
            cancelled: false,
        }
    }

    pub fn resources(&self) -> &[ResourceOutcome] {
        &self.resources
    }

    /// Status of the operation at `index`
    pub fn status(&self, index: usize) -> ResourceStatus {
        self.resources
            .get(index)
            .map_or(ResourceStatus::Pending, |r| r.status)
    }

    /// Status of a resource by logical name
    pub fn status_of(&self, resource: &str) -> Option<ResourceStatus> {
        self.resources
            .iter()
            .find(|r| r.resource == resource)
            .map(|r| r.status)
    }

    pub(crate) fn set(&mut self, index: usize, status: ResourceStatus, detail: Option<String>) {
        if let Some(outcome) = self.resources.get_mut(index) {
            outcome.status = status;
            outcome.detail = detail;
        }
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Whether the run stopped launching operations because of cancellation
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn names_with(&self, status: ResourceStatus) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.resource.clone())
            .collect()
    }

    pub fn committed(&self) -> Vec<String> {
        self.names_with(ResourceStatus::Committed)
    }

    pub fn failed(&self) -> Vec<String> {
        self.names_with(ResourceStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<String> {
        self.names_with(ResourceStatus::Skipped)
    }

    /// Resources never attempted, including any left in progress
    pub fn never_attempted(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.resource.clone())
            .collect()
    }

    /// True when every operation committed
    pub fn is_converged(&self) -> bool {
        self.resources
            .iter()
            .all(|r| r.status == ResourceStatus::Committed)
    }

    /// Turn an incomplete run into [`Error::PartialApply`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_converged() {
            return Ok(self);
        }
        Err(Error::PartialApply {
            committed: self.committed(),
            failed: self.failed(),
            skipped: self.skipped(),
            pending: self.never_attempted(),
        })
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.resources {
            write!(
                f,
                "{:<24} {:<8} {}",
                outcome.resource, outcome.operation, outcome.status
            )?;
            if let Some(detail) = &outcome.detail {
                write!(f, ": {}", detail)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
