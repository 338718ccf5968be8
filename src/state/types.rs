//! Snapshot types for tracking applied resources.
//!
//! The snapshot is the persisted record of what the last runs applied: one
//! entry per resource identity with its applied properties and the outputs the
//! provider reported. It is passed explicitly between the planner and the
//! executor; nothing else holds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::{Result, StateError};
use crate::graph::{Outputs, PropertyMap, ResourceId};

/// Current version of the snapshot format.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Maximum number of run history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version.
    pub version: String,
    /// Incremented on every applied run.
    pub serial: u64,
    /// Identifies the lineage of snapshots this one descends from.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied stack.
    #[serde(default)]
    pub stack_hash: String,
    /// Entries keyed by resource identity, tombstones included.
    #[serde(default)]
    pub entries: BTreeMap<ResourceId, SnapshotEntry>,
    /// When the snapshot was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Objects superseded by a create-before-delete replacement and not yet deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedObject>,
}

/// A remote object that lost its identity to a replacement but still exists.
///
/// The entry for its identity already describes the new object, so the old
/// one is only reachable through the outputs recorded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeposedObject {
    /// Identity the object used to hold.
    pub id: ResourceId,
    /// Outputs of the old object, physical id included.
    pub outputs: Outputs,
    /// Dependencies the old object had.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// When the replacement took over the identity.
    pub deposed_at: DateTime<Utc>,
}

/// Applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Resource identity.
    pub id: ResourceId,
    /// Properties as last applied, references resolved.
    pub properties: PropertyMap,
    /// Outputs reported by the provider.
    pub outputs: Outputs,
    /// Dependencies the resource had when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Digest of `properties`.
    pub properties_hash: String,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub last_modified: DateTime<Utc>,
    /// Set once the resource has been deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Snapshot serial produced by the run.
    pub serial: u64,
    /// Stack hash at the time of the run.
    pub stack_hash: String,
    /// Resources the run changed.
    pub resources: Vec<String>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Apply of a declared stack.
    Apply,
    /// Removal of every resource.
    Destroy,
    /// Outputs refreshed from providers.
    Refresh,
}

impl Snapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            stack_hash: String::new(),
            entries: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
            deposed: Vec::new(),
        }
    }

    /// Gets an entry by identity, tombstones included.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&SnapshotEntry> {
        self.entries.get(id)
    }

    /// Gets a live entry by identity; tombstoned entries count as absent.
    #[must_use]
    pub fn live(&self, id: &ResourceId) -> Option<&SnapshotEntry> {
        self.entries.get(id).filter(|entry| entry.is_live())
    }

    /// Iterates live entries in identity order.
    pub fn live_entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values().filter(|entry| entry.is_live())
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_entries().count()
    }

    /// Adds or replaces an entry.
    ///
    /// The creation time of a live entry being replaced is kept.
    pub fn set_entry(&mut self, mut entry: SnapshotEntry) {
        if let Some(existing) = self.live(&entry.id) {
            entry.created_at = existing.created_at;
        }
        self.entries.insert(entry.id.clone(), entry);
        self.last_updated = Utc::now();
    }

    /// Adds or replaces an entry, starting a new creation time.
    pub fn insert_entry(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.id.clone(), entry);
        self.last_updated = Utc::now();
    }

    /// Records a new dependency set for a live entry without touching its properties.
    pub fn set_dependencies(&mut self, id: &ResourceId, dependencies: BTreeSet<ResourceId>) {
        if let Some(entry) = self.entries.get_mut(id).filter(|entry| entry.is_live())
            && entry.dependencies != dependencies
        {
            entry.dependencies = dependencies;
            entry.last_modified = Utc::now();
            self.last_updated = entry.last_modified;
        }
    }

    /// Marks an entry as deleted, keeping it as a tombstone.
    ///
    /// Returns false if there was no live entry to tombstone.
    pub fn tombstone(&mut self, id: &ResourceId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.is_live() => {
                let now = Utc::now();
                entry.tombstoned_at = Some(now);
                entry.last_modified = now;
                self.last_updated = now;
                true
            }
            _ => false,
        }
    }

    /// Keeps the outputs of a live entry that a replacement is about to overwrite.
    pub fn depose(&mut self, entry: &SnapshotEntry) {
        self.deposed.push(DeposedObject {
            id: entry.id.clone(),
            outputs: entry.outputs.clone(),
            dependencies: entry.dependencies.clone(),
            deposed_at: Utc::now(),
        });
        self.last_updated = Utc::now();
    }

    /// Forgets a deposed object once its delete has completed.
    ///
    /// Returns false if no deposed object of `id` had these outputs.
    pub fn remove_deposed(&mut self, id: &ResourceId, outputs: &Outputs) -> bool {
        let Some(position) = self
            .deposed
            .iter()
            .position(|d| d.id == *id && d.outputs == *outputs)
        else {
            return false;
        };
        self.deposed.remove(position);
        self.last_updated = Utc::now();
        true
    }

    /// Drops every tombstoned entry. Returns how many were removed.
    pub fn purge_tombstones(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live());
        before - self.entries.len()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Checks the snapshot for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for an unknown format version and
    /// [`StateError::Corrupt`] if an entry is filed under the wrong identity or
    /// its properties no longer match their digest.
    pub fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            }
            .into());
        }

        for (id, entry) in &self.entries {
            if *id != entry.id {
                return Err(StateError::corrupt(format!(
                    "entry filed under {id} belongs to {}",
                    entry.id
                ))
                .into());
            }
            let hash = ConfigHasher::hash_properties(&entry.properties);
            if !ConfigHasher::hashes_match(&hash, &entry.properties_hash) {
                return Err(StateError::corrupt(format!(
                    "properties of {id} do not match their recorded digest"
                ))
                .into());
            }
        }

        Ok(())
    }
}

impl DeposedObject {
    /// Builds the entry a delete of the old object starts from.
    #[must_use]
    pub fn to_entry(&self) -> SnapshotEntry {
        SnapshotEntry::new(
            self.id.clone(),
            PropertyMap::new(),
            self.outputs.clone(),
            self.dependencies.clone(),
        )
    }
}

impl SnapshotEntry {
    /// Creates a live entry, computing the properties digest.
    #[must_use]
    pub fn new(
        id: ResourceId,
        properties: PropertyMap,
        outputs: Outputs,
        dependencies: BTreeSet<ResourceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            properties_hash: ConfigHasher::hash_properties(&properties),
            id,
            properties,
            outputs,
            dependencies,
            created_at: now,
            last_modified: now,
            tombstoned_at: None,
        }
    }

    /// Returns true unless the entry is a tombstone.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.tombstoned_at.is_none()
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: RunOperation, serial: u64, stack_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            serial,
            stack_hash: stack_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        serial: u64,
        stack_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            error: Some(error.to_string()),
            success: false,
            ..Self::new(operation, serial, stack_hash, resources)
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Value;

    fn entry(name: &str) -> SnapshotEntry {
        let mut properties = PropertyMap::new();
        properties.insert("cidr_block".to_string(), Value::from("10.0.0.0/16"));
        SnapshotEntry::new(
            ResourceId::new("vpc", name),
            properties,
            Outputs::new(),
            BTreeSet::new(),
        )
    }

    #[test]
    fn test_tombstoned_entries_are_not_live() {
        let mut snapshot = Snapshot::new("demo", "dev");
        let e = entry("main");
        let id = e.id.clone();
        snapshot.set_entry(e);

        assert!(snapshot.live(&id).is_some());
        assert!(snapshot.tombstone(&id));
        assert!(!snapshot.tombstone(&id));
        assert!(snapshot.live(&id).is_none());
        assert!(snapshot.get(&id).is_some());
        assert_eq!(snapshot.live_count(), 0);
        assert_eq!(snapshot.purge_tombstones(), 1);
        assert!(snapshot.get(&id).is_none());
    }

    #[test]
    fn test_set_entry_keeps_creation_time() {
        let mut snapshot = Snapshot::new("demo", "dev");
        let first = entry("main");
        let created_at = first.created_at;
        snapshot.set_entry(first);

        std::thread::sleep(std::time::Duration::from_millis(5));
        snapshot.set_entry(entry("main"));

        let stored = snapshot.live(&ResourceId::new("vpc", "main")).expect("entry");
        assert_eq!(stored.created_at, created_at);
        assert!(stored.last_modified >= created_at);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = Snapshot::new("demo", "dev");
        for serial in 0..(MAX_HISTORY as u64 + 5) {
            snapshot.add_history(HistoryEntry::new(RunOperation::Apply, serial, "", Vec::new()));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].serial, 5);
    }

    #[test]
    fn test_validate_detects_tampering() {
        let mut snapshot = Snapshot::new("demo", "dev");
        snapshot.set_entry(entry("main"));
        assert!(snapshot.validate().is_ok());

        if let Some(e) = snapshot.entries.get_mut(&ResourceId::new("vpc", "main")) {
            e.properties.insert("cidr_block".to_string(), Value::from("10.9.0.0/16"));
        }
        assert!(matches!(
            snapshot.validate(),
            Err(crate::error::KeelsonError::State(StateError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mut snapshot = Snapshot::new("demo", "dev");
        snapshot.version = "0.1".to_string();
        assert!(matches!(
            snapshot.validate(),
            Err(crate::error::KeelsonError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snapshot = Snapshot::new("demo", "dev");
        let mut e = entry("main");
        e.outputs.insert("id".to_string(), Value::from("vpc-1234"));
        e.outputs.insert("mtu".to_string(), Value::Float(1500.0));
        e.dependencies.insert(ResourceId::new("gateway", "igw"));
        snapshot.set_entry(e);
        snapshot.set_entry(entry("retired"));
        snapshot.tombstone(&ResourceId::new("vpc", "retired"));

        let json = serde_json::to_string_pretty(&snapshot).expect("serialize");
        assert!(json.contains("\"vpc::main\""));
        assert!(!json.contains("deposed"));
        let back: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, snapshot);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_deposed_objects_are_matched_by_outputs() {
        let mut snapshot = Snapshot::new("demo", "dev");
        let mut old = entry("main");
        old.outputs.insert("id".to_string(), Value::from("vpc-old"));
        snapshot.set_entry(old.clone());
        snapshot.depose(&old);

        let mut other = old.outputs.clone();
        other.insert("id".to_string(), Value::from("vpc-new"));
        assert!(!snapshot.remove_deposed(&old.id, &other));
        assert_eq!(snapshot.deposed.len(), 1);
        assert_eq!(snapshot.deposed[0].to_entry().outputs, old.outputs);

        let json = serde_json::to_string(&snapshot).expect("serialize");
        let back: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.deposed, snapshot.deposed);

        assert!(snapshot.remove_deposed(&old.id, &old.outputs));
        assert!(snapshot.deposed.is_empty());
    }
}
