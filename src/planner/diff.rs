//! Diff engine for comparing the declared graph against the snapshot.
//!
//! Resources are visited in topological order. A reference is resolved from
//! the prior outputs of its target only when that target keeps its identity
//! (no change or an in-place update); otherwise its value is known after apply.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::Result;
use crate::graph::{Graph, PropertyMap, Reference, Resource, ResourceId, Value};
use crate::provider::{ProviderRegistry, TypeDescriptor};
use crate::state::{DeposedObject, Snapshot, SnapshotEntry};

/// Engine for computing diffs between the declared graph and the snapshot.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    /// Provides per-type immutability rules.
    registry: &'a ProviderRegistry,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Per-property differences.
    pub details: Vec<PropertyDiff>,
    /// Digest of the applied properties, if any.
    pub old_hash: Option<String>,
    /// Digest of the desired properties when fully known.
    pub new_hash: Option<String>,
    /// Old object left behind by an earlier replacement, for deposed deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposed: Option<DeposedObject>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be replaced.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Difference of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDiff {
    /// Property key.
    pub key: String,
    /// Applied value.
    pub old_value: Option<Value>,
    /// Desired value, partially resolved.
    pub new_value: Option<Value>,
    /// The desired value depends on outputs not known until apply.
    pub known_after_apply: bool,
    /// Changing this property forces a replacement.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Diffs of declared resources in topological order, followed by deletes.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the diff between the declared graph and the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PlanError::UnknownResourceType`] if a declared or
    /// recorded resource has no registered provider.
    pub fn compute_diff(&self, graph: &Graph, snapshot: &Snapshot) -> Result<DiffResult> {
        let mut diffs = Vec::with_capacity(graph.len());
        // Resources whose prior outputs stay valid for this run.
        let mut settled: HashSet<&ResourceId> = HashSet::new();

        for resource in graph.iter() {
            let descriptor = self.registry.descriptor(&resource.id.type_name)?;
            let diff = match snapshot.live(&resource.id) {
                None => Self::create_diff(resource, snapshot, &settled),
                Some(prior) => Self::compare(resource, prior, descriptor, snapshot, &settled),
            };
            if matches!(diff.diff_type, DiffType::NoChange | DiffType::Update) {
                settled.insert(&resource.id);
            }
            debug!("{}: {}", resource.id, diff.diff_type);
            diffs.push(diff);
        }

        for entry in snapshot.live_entries() {
            if graph.contains(&entry.id) {
                continue;
            }
            self.registry.descriptor(&entry.id.type_name)?;
            debug!("{}: no longer declared", entry.id);
            diffs.push(ResourceDiff {
                id: entry.id.clone(),
                diff_type: DiffType::Delete,
                details: entry
                    .properties
                    .iter()
                    .map(|(key, value)| PropertyDiff {
                        key: key.clone(),
                        old_value: Some(value.clone()),
                        new_value: None,
                        known_after_apply: false,
                        forces_replacement: false,
                    })
                    .collect(),
                old_hash: Some(entry.properties_hash.clone()),
                new_hash: None,
                deposed: None,
            });
        }

        for deposed in &snapshot.deposed {
            self.registry.descriptor(&deposed.id.type_name)?;
            debug!("{}: deposed object still exists", deposed.id);
            diffs.push(ResourceDiff {
                id: deposed.id.clone(),
                diff_type: DiffType::Delete,
                details: Vec::new(),
                old_hash: None,
                new_hash: None,
                deposed: Some(deposed.clone()),
            });
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Ok(DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        })
    }

    fn create_diff(
        resource: &Resource,
        snapshot: &Snapshot,
        settled: &HashSet<&ResourceId>,
    ) -> ResourceDiff {
        let resolved = resolve_properties(&resource.properties, snapshot, settled);
        let details = resolved
            .iter()
            .map(|(key, value)| PropertyDiff {
                key: key.clone(),
                old_value: None,
                new_value: Some(value.clone()),
                known_after_apply: value.has_references(),
                forces_replacement: false,
            })
            .collect();

        ResourceDiff {
            id: resource.id.clone(),
            diff_type: DiffType::Create,
            details,
            old_hash: None,
            new_hash: known_hash(&resolved),
            deposed: None,
        }
    }

    fn compare(
        resource: &Resource,
        prior: &SnapshotEntry,
        descriptor: &TypeDescriptor,
        snapshot: &Snapshot,
        settled: &HashSet<&ResourceId>,
    ) -> ResourceDiff {
        let resolved = resolve_properties(&resource.properties, snapshot, settled);

        let keys: BTreeSet<&String> = resolved.keys().chain(prior.properties.keys()).collect();
        let details: Vec<PropertyDiff> = keys
            .into_iter()
            .filter_map(|key| {
                let old_value = prior.properties.get(key);
                let new_value = resolved.get(key);
                let known_after_apply = new_value.is_some_and(Value::has_references);
                if !known_after_apply && old_value == new_value {
                    return None;
                }
                Some(PropertyDiff {
                    key: key.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                    known_after_apply,
                    forces_replacement: descriptor.requires_replacement(key),
                })
            })
            .collect();

        let diff_type = if details.is_empty() {
            DiffType::NoChange
        } else if details.iter().any(|d| d.forces_replacement) {
            DiffType::Replace
        } else {
            DiffType::Update
        };

        ResourceDiff {
            id: resource.id.clone(),
            diff_type,
            details,
            old_hash: Some(prior.properties_hash.clone()),
            new_hash: known_hash(&resolved),
            deposed: None,
        }
    }
}

/// Resolves references whose target is settled, leaving the rest in place.
fn resolve_properties(
    properties: &PropertyMap,
    snapshot: &Snapshot,
    settled: &HashSet<&ResourceId>,
) -> PropertyMap {
    let lookup = |reference: &Reference| -> Option<Value> {
        if !settled.contains(&reference.resource) {
            return None;
        }
        snapshot
            .live(&reference.resource)
            .and_then(|entry| entry.outputs.get(&reference.output))
            .cloned()
    };

    properties
        .iter()
        .map(|(key, value)| (key.clone(), value.resolve_with(&lookup).0))
        .collect()
}

fn known_hash(properties: &PropertyMap) -> Option<String> {
    (!properties.values().any(Value::has_references))
        .then(|| ConfigHasher::hash_properties(properties))
}

impl DiffResult {
    /// Returns true if nothing would change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.creates == 0 && self.updates == 0 && self.replaces == 0 && self.deletes == 0
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PropertyDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let old = self
            .old_value
            .as_ref()
            .map_or_else(|| String::from("(none)"), ToString::to_string);
        let new = if self.known_after_apply {
            String::from("(known after apply)")
        } else {
            self.new_value
                .as_ref()
                .map_or_else(|| String::from("(none)"), ToString::to_string)
        };
        write!(f, "{}: {old} -> {new}", self.key)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}
