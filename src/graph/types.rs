//! Core resource types shared by the graph, planner and executor.
//!
//! Property values are a tagged variant: literal values are known at
//! declaration time, while [`Value::Reference`] stands for an output of
//! another resource that only exists once that resource has been created.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Separator between the type name and the logical name in rendered identities.
pub const ID_SEPARATOR: &str = "::";

/// Identity of a resource: its type plus its logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceId {
    /// Resource type name, used to look up the provider.
    pub type_name: String,
    /// Logical name, unique per type.
    pub name: String,
}

/// A reference to an output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// The resource producing the output.
    pub resource: ResourceId,
    /// Output key on that resource.
    pub output: String,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicit absence of a value.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// List of values.
    List(Vec<Value>),
    /// Pending output of another resource.
    Reference(Reference),
}

/// Mapping of property keys to values.
pub type PropertyMap = BTreeMap<String, Value>;

/// Output properties reported by a provider.
pub type Outputs = BTreeMap<String, Value>;

/// A resource declaration as supplied by the declaration layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Resource identity.
    pub id: ResourceId,
    /// Desired properties.
    pub properties: PropertyMap,
    /// Explicit dependency hints.
    pub depends_on: Vec<ResourceId>,
}

/// Lifecycle state of a resource during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Declared, nothing attempted yet.
    Planned,
    /// Create call in flight.
    Creating,
    /// Exists remotely with known outputs.
    Created,
    /// Update call in flight.
    Updating,
    /// Delete call in flight.
    Deleting,
    /// Last operation failed.
    Failed,
}

/// A resource node in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Resource identity.
    pub id: ResourceId,
    /// Desired properties, possibly containing references.
    pub properties: PropertyMap,
    /// Dependencies declared explicitly.
    pub explicit_dependencies: BTreeSet<ResourceId>,
    /// Dependencies inferred from references in the properties.
    pub inferred_dependencies: BTreeSet<ResourceId>,
    /// Lifecycle state at graph-build time.
    pub state: LifecycleState,
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Builds a reference to one of this resource's outputs.
    #[must_use]
    pub fn output(&self, key: impl Into<String>) -> Value {
        Value::Reference(Reference {
            resource: self.clone(),
            output: key.into(),
        })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_SEPARATOR}{}", self.type_name, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(ID_SEPARATOR) {
            Some((type_name, name)) if !type_name.is_empty() && !name.is_empty() => {
                Ok(Self::new(type_name, name))
            }
            _ => Err(format!("invalid resource identity '{s}', expected 'type{ID_SEPARATOR}name'")),
        }
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

impl Value {
    /// Returns true if the value, or any nested value, is a reference.
    #[must_use]
    pub fn has_references(&self) -> bool {
        match self {
            Self::Reference(_) => true,
            Self::List(items) => items.iter().any(Self::has_references),
            _ => false,
        }
    }

    /// Returns false if the value holds a NaN or infinite float anywhere.
    ///
    /// JSON has no encoding for those, so they cannot be persisted.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(x) => x.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            _ => true,
        }
    }

    /// Collects every reference contained in the value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Replaces references using `lookup`, leaving unresolved ones in place.
    ///
    /// Returns the first reference `lookup` could not satisfy, if any.
    pub fn resolve_with<F>(&self, lookup: &F) -> (Self, Option<Reference>)
    where
        F: Fn(&Reference) -> Option<Self>,
    {
        match self {
            Self::Reference(reference) => lookup(reference).map_or_else(
                || (self.clone(), Some(reference.clone())),
                |resolved| (resolved, None),
            ),
            Self::List(items) => {
                let mut missing = None;
                let resolved = items
                    .iter()
                    .map(|item| {
                        let (value, unresolved) = item.resolve_with(lookup);
                        if missing.is_none() {
                            missing = unresolved;
                        }
                        value
                    })
                    .collect();
                (Self::List(resolved), missing)
            }
            _ => (self.clone(), None),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Reference(reference) => write!(f, "{reference}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

/// Collects every reference in a property map, in key order.
#[must_use]
pub fn property_references(properties: &PropertyMap) -> Vec<&Reference> {
    let mut out = Vec::new();
    for value in properties.values() {
        value.collect_references(&mut out);
    }
    out
}

impl ResourceDecl {
    /// Creates a declaration with no properties and no explicit dependencies.
    #[must_use]
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(type_name, name),
            properties: PropertyMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency hint.
    #[must_use]
    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }
}

impl Resource {
    /// Returns the union of explicit and inferred dependencies.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        self.explicit_dependencies
            .union(&self.inferred_dependencies)
            .cloned()
            .collect()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Planned => "planned",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_roundtrip() {
        let id = ResourceId::new("vpc", "egress-vpc");
        assert_eq!(id.to_string(), "vpc::egress-vpc");
        assert_eq!("vpc::egress-vpc".parse::<ResourceId>(), Ok(id));
        assert!("no-separator".parse::<ResourceId>().is_err());
        assert!("::name".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_collect_nested_references() {
        let a = ResourceId::new("subnet", "a");
        let b = ResourceId::new("subnet", "b");
        let value = Value::List(vec![a.output("id"), Value::from("literal"), b.output("id")]);

        let mut refs = Vec::new();
        value.collect_references(&mut refs);

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].resource, a);
        assert_eq!(refs[1].resource, b);
        assert!(value.has_references());
        assert!(!Value::Integer(7).has_references());
    }

    #[test]
    fn test_resolve_with_partial_lookup() {
        let a = ResourceId::new("subnet", "a");
        let b = ResourceId::new("subnet", "b");
        let value = Value::List(vec![a.output("id"), b.output("id")]);

        let (resolved, missing) = value.resolve_with(&|r: &Reference| {
            (r.resource == a).then(|| Value::from("subnet-123"))
        });

        assert_eq!(missing.map(|r| r.resource), Some(b.clone()));
        assert_eq!(
            resolved,
            Value::List(vec![Value::from("subnet-123"), b.output("id")])
        );
    }

    #[test]
    fn test_value_json_is_lossless() {
        let value = Value::List(vec![
            Value::Integer(1),
            Value::Float(1.0),
            Value::Null,
            ResourceId::new("vpc", "main").output("id"),
        ]);
        let json = serde_json::to_string(&value).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn test_non_finite_floats_are_detected() {
        assert!(Value::Float(-1.1193133179981887e-17).is_finite());
        assert!(!Value::Float(f64::NAN).is_finite());
        assert!(!Value::List(vec![Value::Integer(1), Value::Float(f64::INFINITY)]).is_finite());
        assert!(Value::from("inf").is_finite());
    }
}
