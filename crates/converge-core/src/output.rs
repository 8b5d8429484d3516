//! Output publisher
//!
//! Resolves output bindings after a run. A binding is only resolved when its
//! resource committed in this run; everything else is reported as
//! unavailable with a reason instead of being left out.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::desired::OutputBinding;
use crate::engine::report::{ResourceStatus, RunReport};
use crate::traits::StateRecord;
use crate::value::{AttrValue, lookup_path};

/// Resolved value of one output binding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputValue {
    Available(AttrValue),
    Unavailable { reason: String },
}

impl OutputValue {
    pub fn is_available(&self) -> bool {
        matches!(self, OutputValue::Available(_))
    }

    pub fn value(&self) -> Option<&AttrValue> {
        match self {
            OutputValue::Available(v) => Some(v),
            OutputValue::Unavailable { .. } => None,
        }
    }

    fn unavailable(reason: impl Into<String>) -> Self {
        OutputValue::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Output name → value, ordered by name
pub type Outputs = BTreeMap<String, OutputValue>;

/// Resolve bindings against the outcome of a run
pub fn publish(
    bindings: &[OutputBinding],
    report: &RunReport,
    records: &BTreeMap<String, StateRecord>,
) -> Outputs {
    bindings
        .iter()
        .map(|binding| {
            let resource = &binding.target.resource;
            let value = match report.status_of(resource) {
                Some(ResourceStatus::Committed) => resolve(binding, records),
                Some(status) => OutputValue::unavailable(format!("{} is {}", resource, status)),
                None => OutputValue::unavailable(format!("{} was not part of this run", resource)),
            };
            (binding.name.clone(), value)
        })
        .collect()
}

/// Resolve bindings against the state store alone, without a run
pub fn from_state(bindings: &[OutputBinding], records: &BTreeMap<String, StateRecord>) -> Outputs {
    bindings
        .iter()
        .map(|binding| (binding.name.clone(), resolve(binding, records)))
        .collect()
}

fn resolve(binding: &OutputBinding, records: &BTreeMap<String, StateRecord>) -> OutputValue {
    let target = &binding.target;
    let Some(record) = records.get(&target.resource) else {
        return OutputValue::unavailable(format!("{} has no state record", target.resource));
    };
    match lookup_path(&record.attributes, &target.path_segments()) {
        Some(value) => OutputValue::Available(value.clone()),
        None => OutputValue::unavailable(format!("{} has no attribute {}", target.resource, target.path.join("."))),
    }
}

/// Render outputs the way the CLI prints them
///
/// Available outputs map to their value; unavailable ones to
/// `{"unavailable": "<reason>"}`.
pub fn to_json(outputs: &Outputs) -> serde_json::Value {
    let map = outputs
        .iter()
        .map(|(name, value)| {
            let json = match value {
                OutputValue::Available(v) => v.to_json(),
                OutputValue::Unavailable { reason } => {
                    serde_json::json!({ "unavailable": reason })
                }
            };
            (name.clone(), json)
        })
        .collect();
    serde_json::Value::Object(map)
}
