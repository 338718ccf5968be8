//! Resource graph construction and validation.
//!
//! Dependencies come from two places: references found in a resource's
//! properties (inferred when the resource is added) and explicit hints. Both
//! are unioned. `finalize` computes a topological order with Kahn's algorithm,
//! breaking ties by identity so that the order is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::error::{GraphError, KeelsonError, Result};

use super::types::{property_references, LifecycleState, Resource, ResourceDecl, ResourceId};

/// Incrementally assembles a resource graph.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Resources added so far, keyed by identity.
    resources: BTreeMap<ResourceId, Resource>,
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Resources keyed by identity.
    resources: BTreeMap<ResourceId, Resource>,
    /// Topological order, dependencies first.
    order: Vec<ResourceId>,
    /// Reverse edges: resource -> resources that depend on it.
    dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: BTreeMap::new(),
        }
    }

    /// Adds a resource declaration.
    ///
    /// References in the declared properties become inferred dependencies;
    /// the declaration's `depends_on` hints become explicit ones. Targets are
    /// checked in [`GraphBuilder::finalize`], so declarations may arrive in
    /// any order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateIdentity`] if the identity already exists.
    pub fn add_resource(&mut self, decl: ResourceDecl) -> Result<ResourceId> {
        if self.resources.contains_key(&decl.id) {
            return Err(GraphError::DuplicateIdentity { id: decl.id }.into());
        }

        let inferred_dependencies: BTreeSet<ResourceId> = property_references(&decl.properties)
            .into_iter()
            .map(|reference| reference.resource.clone())
            .collect();
        let explicit_dependencies: BTreeSet<ResourceId> = decl.depends_on.into_iter().collect();

        debug!(
            "Adding {} ({} inferred, {} explicit dependencies)",
            decl.id,
            inferred_dependencies.len(),
            explicit_dependencies.len()
        );

        let id = decl.id.clone();
        self.resources.insert(
            decl.id.clone(),
            Resource {
                id: decl.id,
                properties: decl.properties,
                explicit_dependencies,
                inferred_dependencies,
                state: LifecycleState::Planned,
            },
        );
        Ok(id)
    }

    /// Adds an explicit dependency edge: `from` depends on `to`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownResource`] if either endpoint is absent.
    pub fn add_dependency(&mut self, from: &ResourceId, to: &ResourceId) -> Result<()> {
        if !self.resources.contains_key(to) {
            return Err(GraphError::UnknownResource {
                id: to.clone(),
                referenced_by: Some(from.clone()),
            }
            .into());
        }

        let resource = self.resources.get_mut(from).ok_or_else(|| GraphError::UnknownResource {
            id: from.clone(),
            referenced_by: None,
        })?;
        resource.explicit_dependencies.insert(to.clone());
        Ok(())
    }

    /// Adds every declaration in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError::DuplicateIdentity`] encountered.
    pub fn extend(&mut self, decls: impl IntoIterator<Item = ResourceDecl>) -> Result<()> {
        for decl in decls {
            self.add_resource(decl)?;
        }
        Ok(())
    }

    /// Returns the number of resources added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Validates the graph and computes its topological order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownResource`] if a dependency target is not
    /// declared, or [`GraphError::CycleDetected`] naming one cycle.
    pub fn finalize(self) -> Result<Graph> {
        let resources = self.resources;

        let mut dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>> = resources
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        let mut in_degree: HashMap<&ResourceId, usize> = HashMap::new();

        for (id, resource) in &resources {
            let dependencies = resource.dependencies();
            for dependency in &dependencies {
                let Some(entry) = dependents.get_mut(dependency) else {
                    return Err(GraphError::UnknownResource {
                        id: dependency.clone(),
                        referenced_by: Some(id.clone()),
                    }
                    .into());
                };
                entry.insert(id.clone());
            }
            in_degree.insert(id, dependencies.len());
        }

        // BTreeMap iteration keeps the initial queue sorted.
        let mut queue: VecDeque<&ResourceId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut order = Vec::with_capacity(resources.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.clone());

            let mut next_ready: Vec<&ResourceId> = Vec::new();
            if let Some(children) = dependents.get(current) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_ready.push(child);
                        }
                    }
                }
            }
            next_ready.sort();
            queue.extend(next_ready);
        }

        if order.len() != resources.len() {
            let remaining: BTreeSet<&ResourceId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            let path = find_cycle(&resources, &remaining);
            return Err(KeelsonError::Graph(GraphError::CycleDetected { path }));
        }

        debug!("Graph finalized with {} resources", order.len());

        Ok(Graph {
            resources,
            order,
            dependents,
        })
    }
}

/// Walks unfinished nodes along their unfinished dependencies until a node
/// repeats. Every node left over by Kahn's algorithm has at least one such
/// dependency, so the walk always closes a cycle.
fn find_cycle(
    resources: &BTreeMap<ResourceId, Resource>,
    remaining: &BTreeSet<&ResourceId>,
) -> Vec<ResourceId> {
    let Some(start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<ResourceId> = Vec::new();
    let mut seen: HashMap<ResourceId, usize> = HashMap::new();
    let mut current: ResourceId = (*start).clone();

    loop {
        if let Some(&position) = seen.get(&current) {
            let mut cycle = path.split_off(position);
            cycle.push(current);
            return cycle;
        }
        seen.insert(current.clone(), path.len());
        path.push(current.clone());

        let next = resources.get(&current).and_then(|resource| {
            resource
                .dependencies()
                .into_iter()
                .find(|dependency| remaining.contains(dependency))
        });
        match next {
            Some(dependency) => current = dependency,
            None => return path,
        }
    }
}

impl Graph {
    /// Builds a graph from declarations in one step.
    ///
    /// # Errors
    ///
    /// Returns any error from [`GraphBuilder::add_resource`] or
    /// [`GraphBuilder::finalize`].
    pub fn from_decls(decls: impl IntoIterator<Item = ResourceDecl>) -> Result<Self> {
        let mut builder = GraphBuilder::new();
        builder.extend(decls)?;
        builder.finalize()
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Returns true if the graph declares the identity.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns identities in topological order, dependencies first.
    #[must_use]
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Iterates resources in topological order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.resources.get(id))
    }

    /// Returns the direct dependencies of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.resources
            .get(id)
            .map(Resource::dependencies)
            .unwrap_or_default()
    }

    /// Returns the resources that depend directly on `id`.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Returns every resource that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&ResourceId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if found.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
            }
        }
        found
    }

    /// Returns the position of a resource in the topological order.
    #[must_use]
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == id)
    }
}
