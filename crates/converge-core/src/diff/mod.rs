//! Diff engine
//!
//! Compares the desired-state graph with a snapshot of the state store and
//! produces the [`Plan`]: one [`Operation`] per declared resource plus one
//! `Destroy` per orphaned record.
//!
//! ## Ordering
//!
//! Destroys of orphans come first, in reverse dependency order. The
//! declared resources follow in topological order. Every operation lists the
//! indices of the operations it waits for, and every such index is smaller
//! than its own, so the plan is also a valid sequential order.
//!
//! Planning reads only; it never touches the provider or the store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

use crate::desired::{Declaration, DesiredState};
use crate::traits::state_store::StateRecord;
use crate::value::{AttrValue, Attributes};

/// What happens to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    UpdateInPlace,
    Replace,
    Destroy,
    NoOp,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::UpdateInPlace => "update",
            OperationKind::Replace => "replace",
            OperationKind::Destroy => "destroy",
            OperationKind::NoOp => "no-op",
        };
        f.write_str(s)
    }
}

/// One changed attribute
///
/// `old == None` means the attribute is new, `new == None` means it was
/// removed from the declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub old: Option<AttrValue>,
    pub new: Option<AttrValue>,
}

/// A single planned step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    /// Position in the plan
    pub index: usize,
    /// Logical name
    pub resource: String,
    /// Resource kind the operation acts on
    pub resource_kind: String,
    pub kind: OperationKind,
    /// Attribute delta, for `UpdateInPlace`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Full declared attribute set, for `Create` and `Replace`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    /// Indices of operations that must commit before this one starts
    pub wait_for: Vec<usize>,
    /// Record the operation starts from, if any
    #[serde(skip)]
    pub prior: Option<StateRecord>,
    /// Why the diff engine chose this kind
    pub reason: String,
}

impl Operation {
    /// Whether executing this operation calls the provider
    pub fn is_change(&self) -> bool {
        self.kind != OperationKind::NoOp
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {} ({})", self.index, self.kind, self.resource, self.reason)
    }
}

/// Count of operations per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub noop: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.noop
        )
    }
}

/// Ordered operation list
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    operations: Vec<Operation>,
}

impl Plan {
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    /// The operation for a logical name
    ///
    /// A rename produces one operation for the old name and one for the new,
    /// so names are unique within a plan.
    pub fn for_resource(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.resource == name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// True when at least one operation calls the provider
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(Operation::is_change)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.kind {
                OperationKind::Create => summary.create += 1,
                OperationKind::UpdateInPlace => summary.update += 1,
                OperationKind::Replace => summary.replace += 1,
                OperationKind::Destroy => summary.destroy += 1,
                OperationKind::NoOp => summary.noop += 1,
            }
        }
        summary
    }

    /// `(name, kind)` pairs in plan order
    pub fn kinds(&self) -> Vec<(&str, OperationKind)> {
        self.operations
            .iter()
            .map(|op| (op.resource.as_str(), op.kind))
            .collect()
    }
}

/// Attributes that may change without replacing the resource, per kind
///
/// The clone source and the kind itself are never mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutabilityRules {
    kinds: BTreeMap<String, BTreeSet<String>>,
}

impl MutabilityRules {
    /// Rules where every attribute change forces a replacement
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Declare attributes of `kind` as mutable
    pub fn with_mutable<I, S>(mut self, kind: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds
            .entry(kind.into())
            .or_default()
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn is_mutable(&self, kind: &str, attribute: &str) -> bool {
        self.kinds
            .get(kind)
            .is_some_and(|set| set.contains(attribute))
    }
}

impl Default for MutabilityRules {
    fn default() -> Self {
        Self::empty().with_mutable(
            "virtual_machine",
            [
                "cores",
                "sockets",
                "memory",
                "balloon",
                "description",
                "tags",
                "onboot",
            ],
        )
    }
}

/// Compute the plan
pub fn diff(
    desired: &DesiredState,
    snapshot: &BTreeMap<String, StateRecord>,
    rules: &MutabilityRules,
) -> Plan {
    let mut operations = Vec::with_capacity(desired.len() + snapshot.len());
    let mut index_of: BTreeMap<String, usize> = BTreeMap::new();

    // Orphans: destroyed first, dependents before their dependencies
    let orphans: BTreeMap<&str, &StateRecord> = snapshot
        .iter()
        .filter(|(name, _)| !desired.contains(name))
        .map(|(name, record)| (name.as_str(), record))
        .collect();

    for name in reverse_dependency_order(&orphans) {
        let record = orphans[name];
        let index = operations.len();
        // Orphans that depended on this one were placed earlier
        let wait_for = orphans
            .values()
            .filter(|other| other.dependencies.iter().any(|d| d == name))
            .filter_map(|other| index_of.get(&other.name).copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        operations.push(Operation {
            index,
            resource: name.to_string(),
            resource_kind: record.kind.clone(),
            kind: OperationKind::Destroy,
            changes: Vec::new(),
            attributes: Attributes::new(),
            wait_for,
            prior: Some(record.clone()),
            reason: "no longer declared".to_string(),
        });
        index_of.insert(name.to_string(), index);
    }

    for decl in desired.iter() {
        let index = operations.len();
        let record = snapshot.get(&decl.name);

        let mut wait_for: BTreeSet<usize> = desired
            .dependencies_of(&decl.name)
            .filter_map(|dep| index_of.get(dep).copied())
            .collect();
        wait_for.extend(
            orphans
                .values()
                .filter(|orphan| orphan.dependencies.iter().any(|d| d == &decl.name))
                .filter_map(|orphan| index_of.get(&orphan.name).copied()),
        );

        let (kind, changes, reason) = match record {
            None => (OperationKind::Create, Vec::new(), "not yet provisioned".to_string()),
            Some(record) if record.fingerprint == decl.fingerprint() => {
                (OperationKind::NoOp, Vec::new(), "up to date".to_string())
            }
            Some(record) if record.kind != decl.kind => (
                OperationKind::Replace,
                Vec::new(),
                format!("kind changed from {} to {}", record.kind, decl.kind),
            ),
            Some(record) if record.source != decl.source => (
                OperationKind::Replace,
                Vec::new(),
                format!(
                    "source changed from {} to {}",
                    record.source.as_deref().unwrap_or("none"),
                    decl.source.as_deref().unwrap_or("none")
                ),
            ),
            Some(record) => {
                let changes = attribute_changes(&record.declared, &decl.attributes);
                let immutable: Vec<&str> = changes
                    .iter()
                    .filter(|c| !rules.is_mutable(&decl.kind, &c.name))
                    .map(|c| c.name.as_str())
                    .collect();

                if changes.is_empty() {
                    // Fingerprint differs only through encoding; treat as in sync
                    (OperationKind::NoOp, Vec::new(), "up to date".to_string())
                } else if immutable.is_empty() {
                    let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
                    let reason = format!("changed: {}", names.join(", "));
                    (OperationKind::UpdateInPlace, changes, reason)
                } else {
                    let reason = format!("immutable attributes changed: {}", immutable.join(", "));
                    (OperationKind::Replace, Vec::new(), reason)
                }
            }
        };

        let reason = if kind == OperationKind::NoOp {
            let recreated = recreated_references(decl, &index_of, &operations);
            if recreated.is_empty() {
                reason
            } else {
                warn!(
                    "{} is unchanged but references {}, which will be recreated; apply again to pick up new values",
                    decl.name,
                    recreated.join(", ")
                );
                format!("{}; references recreated {}", reason, recreated.join(", "))
            }
        } else {
            reason
        };

        let attributes = match kind {
            OperationKind::Create | OperationKind::Replace => decl.attributes.clone(),
            _ => Attributes::new(),
        };

        operations.push(Operation {
            index,
            resource: decl.name.clone(),
            resource_kind: decl.kind.clone(),
            kind,
            changes,
            attributes,
            wait_for: wait_for.into_iter().collect(),
            prior: record.cloned(),
            reason,
        });
        index_of.insert(decl.name.clone(), index);
    }

    Plan { operations }
}

/// Referenced resources that this plan creates or replaces
///
/// Their observed values may change, but a dependent's fingerprint covers
/// only the unresolved references.
fn recreated_references(
    decl: &Declaration,
    index_of: &BTreeMap<String, usize>,
    operations: &[Operation],
) -> Vec<String> {
    let referenced: BTreeSet<String> = decl
        .references()
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.resource)
        .collect();
    referenced
        .into_iter()
        .filter(|name| {
            index_of
                .get(name)
                .and_then(|i| operations.get(*i))
                .is_some_and(|op| matches!(op.kind, OperationKind::Create | OperationKind::Replace))
        })
        .collect()
}

/// Attribute-level delta between two declared sets
pub fn attribute_changes(old: &Attributes, new: &Attributes) -> Vec<AttributeChange> {
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let before = old.get(name);
            let after = new.get(name);
            (before != after).then(|| AttributeChange {
                name: name.clone(),
                old: before.cloned(),
                new: after.cloned(),
            })
        })
        .collect()
}

/// Orphans ordered so that a record precedes the records it depended on
///
/// Dependencies on records outside the orphan set are ignored. Records left
/// over by a cycle (only possible in a hand-edited state file) are appended
/// in name order.
fn reverse_dependency_order<'a>(orphans: &BTreeMap<&'a str, &StateRecord>) -> Vec<&'a str> {
    let mut dependents_left: BTreeMap<&str, usize> =
        orphans.keys().map(|name| (*name, 0)).collect();
    for record in orphans.values() {
        for dep in &record.dependencies {
            if let Some(count) = dependents_left.get_mut(dep.as_str()) {
                *count += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = dependents_left
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(orphans.len());

    while let Some(name) = ready.pop_first() {
        order.push(name);
        for dep in &orphans[name].dependencies {
            let Some((&dep_name, _)) = orphans.get_key_value(dep.as_str()) else {
                continue;
            };
            if let Some(count) = dependents_left.get_mut(dep_name) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dep_name);
                }
            }
        }
    }

    if order.len() < orphans.len() {
        let placed: BTreeSet<&str> = order.iter().copied().collect();
        order.extend(orphans.keys().copied().filter(|name| !placed.contains(name)));
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::Declaration;

    fn vm(name: &str) -> Declaration {
        Declaration::new("virtual_machine", name)
            .with_source("template-A")
            .with_attribute("cores", 2)
            .with_attribute("memory", 2048)
    }

    fn desired(decls: Vec<Declaration>) -> DesiredState {
        DesiredState::from_declarations(decls, Vec::new()).unwrap()
    }

    fn applied(decl: &Declaration, deps: &[&str]) -> StateRecord {
        StateRecord::from_apply(
            decl,
            deps.iter().map(|d| d.to_string()).collect(),
            format!("{}-id", decl.name),
            &decl.attributes,
            &Attributes::new(),
        )
    }

    fn snapshot(records: Vec<StateRecord>) -> BTreeMap<String, StateRecord> {
        records.into_iter().map(|r| (r.name.clone(), r)).collect()
    }

    #[test]
    fn test_create_when_no_record() {
        let plan = diff(
            &desired(vec![vm("web")]),
            &BTreeMap::new(),
            &MutabilityRules::default(),
        );

        assert_eq!(plan.kinds(), vec![("web", OperationKind::Create)]);
        let op = &plan.operations()[0];
        assert_eq!(op.attributes.get("memory"), Some(&AttrValue::from(2048)));
        assert!(op.prior.is_none());
    }

    #[test]
    fn test_noop_when_fingerprint_matches() {
        let web = vm("web");
        let plan = diff(
            &desired(vec![web.clone()]),
            &snapshot(vec![applied(&web, &[])]),
            &MutabilityRules::default(),
        );

        assert_eq!(plan.kinds(), vec![("web", OperationKind::NoOp)]);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_mutable_change_updates_in_place() {
        let before = vm("web");
        let after = vm("web").with_attribute("memory", 4096);

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[])]),
            &MutabilityRules::default(),
        );

        assert_eq!(plan.kinds(), vec![("web", OperationKind::UpdateInPlace)]);
        let op = &plan.operations()[0];
        assert_eq!(
            op.changes,
            vec![AttributeChange {
                name: "memory".to_string(),
                old: Some(2048.into()),
                new: Some(4096.into()),
            }]
        );
        assert!(op.attributes.is_empty());
    }

    #[test]
    fn test_source_change_replaces() {
        let before = vm("web");
        let after = vm("web").with_source("template-B");

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[])]),
            &MutabilityRules::default(),
        );

        assert_eq!(plan.kinds(), vec![("web", OperationKind::Replace)]);
        assert!(plan.operations()[0].reason.contains("template-B"));
    }

    #[test]
    fn test_mixed_changes_prefer_replace() {
        let before = vm("web").with_attribute("disk", "32G");
        let after = vm("web")
            .with_attribute("disk", "64G")
            .with_attribute("memory", 4096);

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[])]),
            &MutabilityRules::default(),
        );

        assert_eq!(plan.kinds(), vec![("web", OperationKind::Replace)]);
        assert!(plan.operations()[0].reason.contains("disk"));
        assert!(!plan.operations()[0].reason.contains("memory"));
    }

    #[test]
    fn test_kind_change_replaces() {
        let before = vm("web");
        let mut after = vm("web");
        after.kind = "container".to_string();

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[])]),
            &MutabilityRules::default(),
        );
        assert_eq!(plan.kinds(), vec![("web", OperationKind::Replace)]);
    }

    #[test]
    fn test_empty_rules_make_everything_immutable() {
        let before = vm("web");
        let after = vm("web").with_attribute("memory", 4096);

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[])]),
            &MutabilityRules::empty(),
        );
        assert_eq!(plan.kinds(), vec![("web", OperationKind::Replace)]);
    }

    #[test]
    fn test_removed_leaf_is_single_destroy() {
        let db = vm("db");
        let web = vm("web").with_attribute("db_host", "${db.address}");
        let cache = vm("cache");

        let plan = diff(
            &desired(vec![db.clone(), cache.clone()]),
            &snapshot(vec![
                applied(&db, &[]),
                applied(&web, &["db"]),
                applied(&cache, &[]),
            ]),
            &MutabilityRules::default(),
        );

        let changes: Vec<_> = plan
            .operations()
            .iter()
            .filter(|op| op.is_change())
            .map(|op| (op.resource.as_str(), op.kind))
            .collect();
        assert_eq!(changes, vec![("web", OperationKind::Destroy)]);
        assert_eq!(plan.operations()[0].kind, OperationKind::Destroy);
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let db = vm("db");
        let app = vm("app").with_attribute("db_host", "${db.address}");
        let web = vm("web")
            .with_attribute("upstream", "${app.address}")
            .with_dependency("db");

        let plan = diff(
            &desired(vec![web, app, db]),
            &BTreeMap::new(),
            &MutabilityRules::default(),
        );

        assert_eq!(
            plan.kinds(),
            vec![
                ("db", OperationKind::Create),
                ("app", OperationKind::Create),
                ("web", OperationKind::Create),
            ]
        );
        for op in plan.operations() {
            assert!(op.wait_for.iter().all(|w| *w < op.index));
        }
        assert_eq!(plan.for_resource("web").unwrap().wait_for, vec![0, 1]);
    }

    #[test]
    fn test_orphans_destroyed_in_reverse_dependency_order() {
        let db = vm("db");
        let app = vm("app");
        let web = vm("web");

        let plan = diff(
            &desired(vec![]),
            &snapshot(vec![
                applied(&db, &[]),
                applied(&app, &["db"]),
                applied(&web, &["app"]),
            ]),
            &MutabilityRules::default(),
        );

        assert_eq!(
            plan.kinds(),
            vec![
                ("web", OperationKind::Destroy),
                ("app", OperationKind::Destroy),
                ("db", OperationKind::Destroy),
            ]
        );
        assert_eq!(plan.get(1).unwrap().wait_for, vec![0]);
        assert_eq!(plan.get(2).unwrap().wait_for, vec![1]);
    }

    #[test]
    fn test_replace_waits_for_orphan_dependents() {
        let before = vm("db");
        let after = vm("db").with_source("template-B");
        let old_web = vm("web");

        let plan = diff(
            &desired(vec![after]),
            &snapshot(vec![applied(&before, &[]), applied(&old_web, &["db"])]),
            &MutabilityRules::default(),
        );

        assert_eq!(
            plan.kinds(),
            vec![("web", OperationKind::Destroy), ("db", OperationKind::Replace)]
        );
        assert_eq!(plan.for_resource("db").unwrap().wait_for, vec![0]);
    }

    #[test]
    fn test_noop_dependent_of_replaced_resource_is_flagged() {
        let before = vm("db");
        let after = vm("db").with_source("template-B");
        let web = vm("web").with_attribute("db_host", "${db.address}");
        let cache = vm("cache");

        let plan = diff(
            &desired(vec![after, web.clone(), cache.clone()]),
            &snapshot(vec![
                applied(&before, &[]),
                applied(&web, &["db"]),
                applied(&cache, &[]),
            ]),
            &MutabilityRules::default(),
        );

        let web_op = plan.for_resource("web").unwrap();
        assert_eq!(web_op.kind, OperationKind::NoOp);
        assert!(web_op.reason.contains("references recreated db"), "{}", web_op.reason);
        assert_eq!(plan.for_resource("cache").unwrap().reason, "up to date");
    }

    #[test]
    fn test_rename_is_destroy_plus_create() {
        let old = vm("web");
        let renamed = vm("frontend");

        let plan = diff(
            &desired(vec![renamed]),
            &snapshot(vec![applied(&old, &[])]),
            &MutabilityRules::default(),
        );

        assert_eq!(
            plan.kinds(),
            vec![("web", OperationKind::Destroy), ("frontend", OperationKind::Create)]
        );
        assert_eq!(
            plan.summary().to_string(),
            "1 to create, 0 to update, 0 to replace, 1 to destroy, 0 unchanged"
        );
    }

    #[test]
    fn test_attribute_changes_cover_added_and_removed() {
        let old: Attributes = [("a".to_string(), AttrValue::from(1)), ("b".to_string(), AttrValue::from(2))]
            .into_iter()
            .collect();
        let new: Attributes = [("b".to_string(), AttrValue::from(2)), ("c".to_string(), AttrValue::from(3))]
            .into_iter()
            .collect();

        let changes = attribute_changes(&old, &new);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name, "a");
        assert!(changes[0].new.is_none());
        assert_eq!(changes[1].name, "c");
        assert!(changes[1].old.is_none());
    }
}
