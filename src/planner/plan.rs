//! Plan types and construction.
//!
//! A [`Plan`] is the ordered change list produced from a diff. Every change
//! records the indices of the changes it must wait for; the list itself is a
//! stable topological linearisation of those edges, so executing it front to
//! back is always a valid order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::graph::{Graph, PropertyMap, ResourceId};
use crate::provider::ProviderRegistry;
use crate::state::{Snapshot, SnapshotEntry};

use super::diff::{DiffEngine, DiffType, PropertyDiff, ResourceDiff};

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Digest of the declared graph this plan is based on.
    pub stack_hash: String,
    /// Changes in execution order.
    pub changes: Vec<Change>,
}

/// A single planned change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    /// Target resource.
    pub resource: ResourceId,
    /// What to do.
    pub action: ChangeAction,
    /// Set when the change is one half of a replacement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<Replacement>,
    /// Property differences behind the change.
    pub diff: Vec<PropertyDiff>,
    /// Desired properties, references unresolved. Empty for deletes.
    pub properties: PropertyMap,
    /// Dependencies to record once the change is applied.
    pub dependencies: BTreeSet<ResourceId>,
    /// Snapshot entry the change starts from.
    #[serde(skip)]
    pub prior: Option<SnapshotEntry>,
    /// Indices of changes that must complete first.
    pub depends_on: Vec<usize>,
    /// Why the change is needed.
    pub reason: String,
}

/// Types of changes in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Create a new remote object.
    Create,
    /// Update an existing object in place.
    Update,
    /// Delete an object.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Replacement {
    /// Delete the old object, then create the new one.
    DeleteBeforeCreate,
    /// Create the new object, repoint dependents, then delete the old one.
    CreateBeforeDelete,
}

/// Builds plans from a graph and a snapshot.
#[derive(Debug)]
pub struct Planner<'a> {
    /// Registry used for type descriptors.
    registry: &'a ProviderRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a new planner.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Plans the changes that bring the snapshot to the declared graph.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownResourceType`] if a resource type has no
    /// provider, or [`PlanError::ConflictingChanges`] if the ordering
    /// constraints between changes cannot all be met.
    pub fn plan(&self, graph: &Graph, snapshot: &Snapshot) -> Result<Plan> {
        let diff = DiffEngine::new(self.registry).compute_diff(graph, snapshot)?;

        let mut drafts: Vec<Change> = Vec::with_capacity(diff.diffs.len() + diff.replaces);
        let mut ensure: HashMap<ResourceId, usize> = HashMap::new();
        let mut deletes: Vec<(ResourceId, usize)> = Vec::new();

        // Orphans first so that ties in the final ordering favour teardown.
        for resource_diff in diff.diffs.iter().rev() {
            if resource_diff.diff_type != DiffType::Delete {
                continue;
            }
            // A deposed object is the unfinished old half of a create-before-delete.
            let (prior, replacement, reason) = match &resource_diff.deposed {
                Some(deposed) => (
                    Some(deposed.to_entry()),
                    Some(Replacement::CreateBeforeDelete),
                    String::from("deposed by an earlier replacement"),
                ),
                None => (
                    snapshot.live(&resource_diff.id).cloned(),
                    None,
                    String::from("no longer declared"),
                ),
            };
            deletes.push((resource_diff.id.clone(), drafts.len()));
            drafts.push(Change {
                resource: resource_diff.id.clone(),
                action: ChangeAction::Delete,
                replacement,
                diff: resource_diff.details.clone(),
                properties: PropertyMap::new(),
                dependencies: BTreeSet::new(),
                prior,
                depends_on: Vec::new(),
                reason,
            });
        }

        for resource_diff in &diff.diffs {
            if resource_diff.diff_type == DiffType::Delete {
                continue;
            }
            let Some(resource) = graph.get(&resource_diff.id) else {
                continue;
            };
            let prior = snapshot.live(&resource.id).cloned();
            let ensure_change = |action: ChangeAction, replacement: Option<Replacement>, reason: String| Change {
                resource: resource.id.clone(),
                action,
                replacement,
                diff: resource_diff.details.clone(),
                properties: resource.properties.clone(),
                dependencies: resource.dependencies(),
                prior: prior.clone(),
                depends_on: Vec::new(),
                reason,
            };

            match resource_diff.diff_type {
                DiffType::NoChange => {
                    ensure.insert(resource.id.clone(), drafts.len());
                    drafts.push(ensure_change(ChangeAction::NoOp, None, String::from("up to date")));
                }
                DiffType::Create => {
                    ensure.insert(resource.id.clone(), drafts.len());
                    drafts.push(ensure_change(ChangeAction::Create, None, String::from("declared, not yet created")));
                }
                DiffType::Update => {
                    ensure.insert(resource.id.clone(), drafts.len());
                    let reason = format!("update in place: {}", changed_keys(resource_diff, false));
                    drafts.push(ensure_change(ChangeAction::Update, None, reason));
                }
                DiffType::Replace => {
                    let descriptor = self.registry.descriptor(&resource.id.type_name)?;
                    let reason = format!("{} forces replacement", changed_keys(resource_diff, true));
                    let retire = Change {
                        resource: resource.id.clone(),
                        action: ChangeAction::Delete,
                        replacement: None,
                        diff: Vec::new(),
                        properties: PropertyMap::new(),
                        dependencies: BTreeSet::new(),
                        prior: prior.clone(),
                        depends_on: Vec::new(),
                        reason: reason.clone(),
                    };

                    if descriptor.create_before_delete {
                        let strategy = Some(Replacement::CreateBeforeDelete);
                        ensure.insert(resource.id.clone(), drafts.len());
                        drafts.push(ensure_change(ChangeAction::Create, strategy, reason));
                        deletes.push((resource.id.clone(), drafts.len()));
                        drafts.push(Change { replacement: strategy, ..retire });
                    } else {
                        let strategy = Some(Replacement::DeleteBeforeCreate);
                        deletes.push((resource.id.clone(), drafts.len()));
                        drafts.push(Change { replacement: strategy, ..retire });
                        ensure.insert(resource.id.clone(), drafts.len());
                        drafts.push(ensure_change(ChangeAction::Create, strategy, reason));
                    }
                }
                DiffType::Delete => {}
            }
        }

        let edges = Self::collect_edges(graph, snapshot, &drafts, &ensure, &deletes);
        let changes = Self::linearize(drafts, &edges)?;

        let plan = Plan {
            created_at: Utc::now(),
            stack_hash: ConfigHasher::hash_graph(graph),
            changes,
        };
        info!(
            "Planned {} changes ({} create, {} update, {} delete, {} unchanged)",
            plan.actionable().len(),
            plan.create_count(),
            plan.update_count(),
            plan.delete_count(),
            plan.noop_count()
        );
        Ok(plan)
    }

    /// Computes, per draft, the set of drafts it must wait for.
    fn collect_edges(
        graph: &Graph,
        snapshot: &Snapshot,
        drafts: &[Change],
        ensure: &HashMap<ResourceId, usize>,
        deletes: &[(ResourceId, usize)],
    ) -> Vec<BTreeSet<usize>> {
        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); drafts.len()];

        // Declared dependencies: wait for every dependency to be ensured.
        for (id, &index) in ensure {
            for dependency in graph.dependencies(id) {
                if let Some(&target) = ensure.get(&dependency) {
                    edges[index].insert(target);
                }
            }
        }

        for (id, index) in deletes {
            let index = *index;
            let strategy = drafts[index].replacement;
            match strategy {
                Some(Replacement::DeleteBeforeCreate) => {
                    if let Some(&create) = ensure.get(id) {
                        edges[create].insert(index);
                    }
                }
                Some(Replacement::CreateBeforeDelete) => {
                    if let Some(&create) = ensure.get(id) {
                        edges[index].insert(create);
                    }
                    for dependent in graph.dependents(id) {
                        if let Some(&target) = ensure.get(&dependent) {
                            edges[index].insert(target);
                        }
                    }
                }
                None => {}
            }

            // Resources that used to depend on this one must be repointed first.
            if strategy != Some(Replacement::DeleteBeforeCreate) {
                for entry in snapshot.live_entries() {
                    if entry.id != *id
                        && entry.dependencies.contains(id)
                        && let Some(&target) = ensure.get(&entry.id)
                    {
                        edges[index].insert(target);
                    }
                }
            }

            // Dependents being deleted go first.
            for (other, other_index) in deletes {
                let other_index = *other_index;
                if other == id {
                    continue;
                }
                let depended = drafts[other_index]
                    .prior
                    .as_ref()
                    .is_some_and(|prior| prior.dependencies.contains(id));
                let blocked = drafts[other_index].replacement == Some(Replacement::CreateBeforeDelete)
                    && strategy == Some(Replacement::DeleteBeforeCreate);
                if depended && !blocked {
                    edges[index].insert(other_index);
                }
            }
        }

        edges
    }

    /// Orders drafts with Kahn's algorithm, lowest draft index first.
    fn linearize(drafts: Vec<Change>, edges: &[BTreeSet<usize>]) -> Result<Vec<Change>> {
        let count = drafts.len();
        let mut in_degree: Vec<usize> = edges.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, waits_for) in edges.iter().enumerate() {
            for &target in waits_for {
                dependents[target].push(index);
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != count {
            let stuck: Vec<String> = (0..count)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| format!("{} {}", drafts[i].action, drafts[i].resource))
                .collect();
            return Err(PlanError::ConflictingChanges {
                message: format!("cannot order {}", stuck.join(", ")),
            }
            .into());
        }

        let mut position = vec![0; count];
        for (new_index, &old_index) in order.iter().enumerate() {
            position[old_index] = new_index;
        }

        let mut slots: Vec<Option<Change>> = drafts.into_iter().map(Some).collect();
        let changes = order
            .iter()
            .filter_map(|&old_index| {
                let mut change = slots[old_index].take()?;
                change.depends_on = edges[old_index].iter().map(|&d| position[d]).collect();
                change.depends_on.sort_unstable();
                debug!("{} {} waits for {:?}", change.action, change.resource, change.depends_on);
                Some(change)
            })
            .collect();
        Ok(changes)
    }
}

fn changed_keys(diff: &ResourceDiff, forcing_only: bool) -> String {
    diff.details
        .iter()
        .filter(|detail| !forcing_only || detail.forces_replacement)
        .map(|detail| detail.key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn empty(stack_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            stack_hash: stack_hash.to_string(),
            changes: Vec::new(),
        }
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == ChangeAction::NoOp)
    }

    /// Returns the changes that do something.
    #[must_use]
    pub fn actionable(&self) -> Vec<&Change> {
        self.changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp)
            .collect()
    }

    fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Returns the number of create changes, replacement halves included.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ChangeAction::Create)
    }

    /// Returns the number of in-place updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ChangeAction::Update)
    }

    /// Returns the number of delete changes, replacement halves included.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ChangeAction::Delete)
    }

    /// Returns the number of unchanged resources.
    #[must_use]
    pub fn noop_count(&self) -> usize {
        self.count(ChangeAction::NoOp)
    }

    /// Returns the number of replaced resources.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Create && c.replacement.is_some())
            .count()
    }

    /// Returns changes that can start immediately.
    #[must_use]
    pub fn ready_changes(&self) -> Vec<(usize, &Change)> {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.depends_on.is_empty())
            .collect()
    }

    /// Returns the changes that wait for change `index`.
    #[must_use]
    pub fn dependent_changes(&self, index: usize) -> Vec<(usize, &Change)> {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.depends_on.contains(&index))
            .collect()
    }

    /// Returns the index of the first change targeting `id` with `action`.
    #[must_use]
    pub fn position(&self, id: &ResourceId, action: ChangeAction) -> Option<usize> {
        self.changes
            .iter()
            .position(|c| c.resource == *id && c.action == action)
    }
}

impl Change {
    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.action, self.replacement) {
            (ChangeAction::Create, Some(_)) => format!("Replace {} (create new)", self.resource),
            (ChangeAction::Delete, Some(_)) => format!("Replace {} (delete old)", self.resource),
            (ChangeAction::Create, None) => format!("Create {}", self.resource),
            (ChangeAction::Update, _) => format!("Update {}", self.resource),
            (ChangeAction::Delete, None) => format!("Delete {}", self.resource),
            (ChangeAction::NoOp, _) => format!("No change for {}", self.resource),
        }
    }

    /// Short symbol used in plan listings.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match (self.action, self.replacement) {
            (ChangeAction::Create, Some(_)) | (ChangeAction::Delete, Some(_)) => "-/+",
            (ChangeAction::Create, None) => "+",
            (ChangeAction::Update, _) => "~",
            (ChangeAction::Delete, None) => "-",
            (ChangeAction::NoOp, _) => " ",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Replacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteBeforeCreate => write!(f, "delete-before-create"),
            Self::CreateBeforeDelete => write!(f, "create-before-delete"),
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actionable = self.actionable();
        if actionable.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} changes):", actionable.len())?;
        for (i, change) in self.changes.iter().enumerate() {
            if change.action == ChangeAction::NoOp {
                continue;
            }
            writeln!(f, "  {i}. {} {change}", change.symbol())?;
            for detail in &change.diff {
                writeln!(f, "       {detail}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelsonError;
    use crate::graph::{Outputs, ResourceDecl, Value};
    use crate::provider::{InMemoryBackend, TypeDescriptor};

    fn registry(cbd: bool) -> ProviderRegistry {
        let backend = InMemoryBackend::new();
        let mut registry = ProviderRegistry::new();
        registry.register(backend.provider(
            TypeDescriptor::new("vpc")
                .with_immutable(["cidr_block"])
                .with_create_before_delete(cbd),
        ));
        registry.register(backend.provider(TypeDescriptor::new("subnet")));
        registry
    }

    fn entry(
        id: &ResourceId,
        properties: &[(&str, Value)],
        id_output: &str,
        dependencies: &[&ResourceId],
    ) -> SnapshotEntry {
        let properties: PropertyMap = properties
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let mut outputs = Outputs::new();
        outputs.insert("id".to_string(), Value::from(id_output));
        SnapshotEntry::new(
            id.clone(),
            properties,
            outputs,
            dependencies.iter().map(|d| (*d).clone()).collect(),
        )
    }

    fn summary(plan: &Plan) -> Vec<(ChangeAction, String)> {
        plan.changes
            .iter()
            .map(|c| (c.action, c.resource.name.clone()))
            .collect()
    }

    /// Snapshot holding `vpc::main` (10.0.0.0/16) and `subnet::a` pointing at it.
    fn applied_pair() -> Snapshot {
        let vpc = ResourceId::new("vpc", "main");
        let subnet = ResourceId::new("subnet", "a");
        let mut snapshot = Snapshot::new("demo", "dev");
        snapshot.set_entry(entry(&vpc, &[("cidr_block", Value::from("10.0.0.0/16"))], "vpc-1", &[]));
        snapshot.set_entry(entry(&subnet, &[("vpc_id", Value::from("vpc-1"))], "subnet-1", &[&vpc]));
        snapshot
    }

    fn declared_pair(cidr: &str) -> Graph {
        let vpc = ResourceId::new("vpc", "main");
        Graph::from_decls([
            ResourceDecl::new("vpc", "main").with_property("cidr_block", cidr),
            ResourceDecl::new("subnet", "a").with_property("vpc_id", vpc.output("id")),
        ])
        .expect("acyclic")
    }

    #[test]
    fn test_fresh_graph_creates_in_dependency_order() {
        let registry = registry(false);
        let plan = Planner::new(&registry)
            .plan(&declared_pair("10.0.0.0/16"), &Snapshot::new("demo", "dev"))
            .expect("plan");

        assert_eq!(
            summary(&plan),
            vec![
                (ChangeAction::Create, "main".to_string()),
                (ChangeAction::Create, "a".to_string()),
            ]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);
        assert_eq!(plan.ready_changes().len(), 1);
        assert_eq!(plan.dependent_changes(0).len(), 1);
    }

    #[test]
    fn test_unchanged_graph_is_all_noops() {
        let registry = registry(false);
        let plan = Planner::new(&registry)
            .plan(&declared_pair("10.0.0.0/16"), &applied_pair())
            .expect("plan");

        assert!(plan.is_empty());
        assert_eq!(plan.noop_count(), 2);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_deposed_object_delete_waits_for_dependents() {
        let registry = registry(true);
        let vpc = ResourceId::new("vpc", "main");
        let mut snapshot = applied_pair();
        snapshot.depose(&entry(&vpc, &[("cidr_block", Value::from("10.9.0.0/16"))], "vpc-0", &[]));

        let plan = Planner::new(&registry)
            .plan(&declared_pair("10.0.0.0/16"), &snapshot)
            .expect("plan");

        assert!(!plan.is_empty());
        assert_eq!(plan.delete_count(), 1);
        let delete = plan.position(&vpc, ChangeAction::Delete).expect("deposed delete");
        let change = &plan.changes[delete];
        assert_eq!(change.replacement, Some(Replacement::CreateBeforeDelete));
        assert_eq!(
            change.prior.as_ref().and_then(|p| p.outputs.get("id")),
            Some(&Value::from("vpc-0"))
        );
        let subnet = plan
            .position(&ResourceId::new("subnet", "a"), ChangeAction::NoOp)
            .expect("subnet");
        assert!(change.depends_on.contains(&subnet));
    }

    #[test]
    fn test_removed_resource_yields_single_delete() {
        let registry = registry(false);
        let graph = Graph::from_decls([
            ResourceDecl::new("vpc", "main").with_property("cidr_block", "10.0.0.0/16"),
        ])
        .expect("acyclic");

        let plan = Planner::new(&registry)
            .plan(&graph, &applied_pair())
            .expect("plan");
        let actionable: Vec<(ChangeAction, String)> = plan
            .actionable()
            .iter()
            .map(|c| (c.action, c.resource.name.clone()))
            .collect();

        assert_eq!(actionable, vec![(ChangeAction::Delete, "a".to_string())]);
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let registry = registry(false);
        let plan = Planner::new(&registry)
            .plan(&Graph::default(), &applied_pair())
            .expect("plan");

        assert_eq!(
            summary(&plan),
            vec![
                (ChangeAction::Delete, "a".to_string()),
                (ChangeAction::Delete, "main".to_string()),
            ]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);
    }

    #[test]
    fn test_delete_before_create_replacement() {
        let registry = registry(false);
        let plan = Planner::new(&registry)
            .plan(&declared_pair("10.1.0.0/16"), &applied_pair())
            .expect("plan");

        assert_eq!(
            summary(&plan),
            vec![
                (ChangeAction::Delete, "main".to_string()),
                (ChangeAction::Create, "main".to_string()),
                (ChangeAction::Update, "a".to_string()),
            ]
        );
        assert_eq!(plan.changes[0].replacement, Some(Replacement::DeleteBeforeCreate));
        assert_eq!(plan.changes[1].depends_on, vec![0]);
        assert_eq!(plan.changes[2].depends_on, vec![1]);
        assert_eq!(plan.replace_count(), 1);
        assert!(plan.changes[1].reason.contains("cidr_block"));
    }

    #[test]
    fn test_create_before_delete_replacement() {
        let registry = registry(true);
        let plan = Planner::new(&registry)
            .plan(&declared_pair("10.1.0.0/16"), &applied_pair())
            .expect("plan");

        let vpc = ResourceId::new("vpc", "main");
        let subnet = ResourceId::new("subnet", "a");
        let create = plan.position(&vpc, ChangeAction::Create).expect("create");
        let delete = plan.position(&vpc, ChangeAction::Delete).expect("delete");
        let repoint = plan.position(&subnet, ChangeAction::Update).expect("update");

        assert!(create < repoint);
        assert!(repoint < delete);
        assert_eq!(plan.changes[delete].replacement, Some(Replacement::CreateBeforeDelete));
        assert!(plan.changes[delete].depends_on.contains(&create));
        assert!(plan.changes[delete].depends_on.contains(&repoint));
    }

    #[test]
    fn test_orphan_delete_waits_for_repointed_dependent() {
        let old_vpc = ResourceId::new("vpc", "old");
        let subnet = ResourceId::new("subnet", "a");
        let mut snapshot = Snapshot::new("demo", "dev");
        snapshot.set_entry(entry(&old_vpc, &[], "vpc-1", &[]));
        snapshot.set_entry(entry(&subnet, &[("vpc_id", Value::from("vpc-1"))], "subnet-1", &[&old_vpc]));

        let new_vpc = ResourceId::new("vpc", "new");
        let graph = Graph::from_decls([
            ResourceDecl::new("vpc", "new"),
            ResourceDecl::new("subnet", "a").with_property("vpc_id", new_vpc.output("id")),
        ])
        .expect("acyclic");

        let registry = registry(false);
        let plan = Planner::new(&registry).plan(&graph, &snapshot).expect("plan");

        let delete = plan.position(&old_vpc, ChangeAction::Delete).expect("delete");
        let repoint = plan.position(&subnet, ChangeAction::Update).expect("update");
        assert!(repoint < delete);
    }

    #[test]
    fn test_unknown_type_rejected_before_any_change() {
        let registry = registry(false);
        let graph = Graph::from_decls([ResourceDecl::new("router", "edge")]).expect("acyclic");

        let err = Planner::new(&registry)
            .plan(&graph, &Snapshot::new("demo", "dev"))
            .unwrap_err();
        assert!(matches!(
            err,
            KeelsonError::Plan(PlanError::UnknownResourceType { ref type_name }) if type_name == "router"
        ));
    }
}
