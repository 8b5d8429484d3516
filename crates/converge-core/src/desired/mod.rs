//! Desired-state loader
//!
//! Parses resource declarations into a validated, topologically ordered
//! graph. Loading is pure: nothing here touches the provider or the state
//! store.
//!
//! ## Input format
//!
//! ```json
//! {
//!   "resources": [
//!     {
//!       "kind": "virtual_machine",
//!       "name": "db",
//!       "source": "debian-12-template",
//!       "attributes": { "cores": 2, "memory": 4096 }
//!     },
//!     {
//!       "kind": "virtual_machine",
//!       "name": "web",
//!       "source": "debian-12-template",
//!       "attributes": {
//!         "cores": 2,
//!         "memory": 2048,
//!         "description": "talks to ${db.address}"
//!       }
//!     }
//!   ],
//!   "outputs": { "web_ip": "web.address" }
//! }
//! ```

pub mod reference;

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::value::{AttrValue, Attributes};

pub use reference::Reference;

/// One managed resource as the operator wants it
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    /// Resource kind (e.g. "virtual_machine")
    pub kind: String,
    /// Unique logical name
    pub name: String,
    /// Template or clone source identifier
    pub source: Option<String>,
    /// Desired attributes, possibly containing `${...}` references
    pub attributes: Attributes,
    /// Explicit dependencies in addition to those implied by references
    pub depends_on: Vec<String>,
}

impl Declaration {
    /// Create a declaration with no attributes
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            source: None,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set the clone source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set one attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add an explicit dependency
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// References embedded in attribute values
    pub fn references(&self) -> std::result::Result<Vec<Reference>, String> {
        let mut refs = Vec::new();
        for (attr, value) in &self.attributes {
            reference::collect(value, &mut refs)
                .map_err(|e| format!("attribute `{}`: {}", attr, e))?;
        }
        Ok(refs)
    }

    /// Fingerprint of the declared content (references unresolved)
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.kind, self.source.as_deref(), &self.attributes)
    }
}

/// Output binding: `name → (resource, attribute path)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBinding {
    pub name: String,
    pub target: Reference,
}

impl OutputBinding {
    /// Parse `resource.attr.path`
    pub fn parse(name: impl Into<String>, expr: &str) -> std::result::Result<Self, String> {
        Ok(Self {
            name: name.into(),
            target: Reference::parse(expr)?,
        })
    }
}

/// Validated desired-state graph
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    resources: BTreeMap<String, Declaration>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
    outputs: Vec<OutputBinding>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    resources: Vec<RawDeclaration>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawDeclaration {
    kind: String,
    name: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
}

impl DesiredState {
    /// Parse and validate a JSON desired-state document
    pub fn from_json_str(input: &str) -> Result<Self> {
        let raw: RawDocument = serde_json::from_str(input).map_err(|e| {
            Error::validation(
                format!("invalid desired-state document: {}", e),
                std::iter::empty::<String>(),
            )
        })?;

        let mut declarations = Vec::with_capacity(raw.resources.len());
        for r in raw.resources {
            let mut attributes = Attributes::new();
            for (key, value) in r.attributes {
                let value = AttrValue::from_json(value, &key)
                    .map_err(|e| Error::validation(e, [r.name.clone()]))?;
                attributes.insert(key, value);
            }
            declarations.push(Declaration {
                kind: r.kind,
                name: r.name,
                source: r.source,
                attributes,
                depends_on: r.depends_on,
            });
        }

        let mut outputs = Vec::with_capacity(raw.outputs.len());
        for (name, expr) in raw.outputs {
            let binding = OutputBinding::parse(name.clone(), &expr)
                .map_err(|e| Error::validation(format!("output `{}`: {}", name, e), [name.clone()]))?;
            outputs.push(binding);
        }

        Self::from_declarations(declarations, outputs)
    }

    /// Read and validate a desired-state document from disk
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("Failed to read desired state {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Validate declarations and build the ordered graph
    ///
    /// Fails when a name is empty or duplicated, when a reference or
    /// `depends_on` entry points at an unknown resource, or when the
    /// dependency graph has a cycle.
    pub fn from_declarations(
        declarations: Vec<Declaration>,
        outputs: Vec<OutputBinding>,
    ) -> Result<Self> {
        let mut resources = BTreeMap::new();
        for decl in declarations {
            if decl.name.trim().is_empty() {
                return Err(Error::validation(
                    "resource name cannot be empty",
                    [decl.kind.clone()],
                ));
            }
            if decl.name.contains(['.', '$', '{', '}']) {
                return Err(Error::validation(
                    "resource name cannot contain `.`, `$`, `{` or `}`",
                    [decl.name.clone()],
                ));
            }
            if decl.kind.trim().is_empty() {
                return Err(Error::validation(
                    "resource kind cannot be empty",
                    [decl.name.clone()],
                ));
            }
            if resources.contains_key(&decl.name) {
                return Err(Error::validation("duplicate resource name", [decl.name.clone()]));
            }
            resources.insert(decl.name.clone(), decl);
        }

        let mut dependencies = BTreeMap::new();
        for (name, decl) in &resources {
            let refs = decl
                .references()
                .map_err(|e| Error::validation(e, [name.clone()]))?;

            let mut deps = BTreeSet::new();
            for target in refs
                .iter()
                .map(|r| &r.resource)
                .chain(decl.depends_on.iter())
            {
                if target == name {
                    return Err(Error::validation(
                        "resource depends on itself",
                        [name.clone()],
                    ));
                }
                if !resources.contains_key(target) {
                    return Err(Error::validation(
                        format!("dangling reference to `{}`", target),
                        [name.clone(), target.clone()],
                    ));
                }
                deps.insert(target.clone());
            }
            dependencies.insert(name.clone(), deps);
        }

        for binding in &outputs {
            if !resources.contains_key(&binding.target.resource) {
                return Err(Error::validation(
                    format!(
                        "output `{}` references unknown resource `{}`",
                        binding.name, binding.target.resource
                    ),
                    [binding.target.resource.clone()],
                ));
            }
        }

        let order = topological_order(&dependencies)?;
        debug!("Loaded desired state: {} resource(s)", order.len());

        Ok(Self {
            resources,
            dependencies,
            order,
            outputs,
        })
    }

    /// Look up a declaration by logical name
    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.resources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Names in an order where every dependency precedes its dependents
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a resource
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(name).into_iter().flatten()
    }

    /// Declarations in topological order
    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.order.iter().filter_map(|name| self.resources.get(name))
    }

    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Kahn's algorithm with name-ordered tie breaking
fn topological_order(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut remaining: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in dependencies {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(name) = ready.pop_first() {
        remaining.remove(name);
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if remaining.is_empty() {
        return Ok(order);
    }

    Err(Error::validation(
        "dependency cycle detected",
        find_cycle(dependencies, &remaining),
    ))
}

/// Extract one cycle from the nodes Kahn's algorithm could not order
///
/// Every leftover node still has an unordered dependency, so following the
/// smallest such dependency from any leftover node must revisit a node.
fn find_cycle(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    leftover: &BTreeMap<&str, usize>,
) -> Vec<String> {
    let Some(start) = leftover.keys().next().copied() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = dependencies
            .get(current)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|dep| leftover.contains_key(dep));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.sort();
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
