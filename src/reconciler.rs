//! Run driver.
//!
//! The reconciler ties the pieces together for one stack: it takes the state
//! lock, loads the snapshot, builds the graph, plans, applies, saves the new
//! snapshot and releases the lock. It also checks remote objects for drift
//! and refreshes recorded outputs.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::error::Result;
use crate::graph::{Graph, ResourceDecl, ResourceId};
use crate::planner::{
    ApplyResult, CancelSignal, Plan, PlanExecutor, Planner, ResourceStatus, RetryPolicy,
    DEFAULT_WORKERS,
};
use crate::provider::ProviderRegistry;
use crate::state::{generate_holder_id, HistoryEntry, RunOperation, Snapshot, SnapshotStore};

/// Drives plan and apply runs for one stack.
pub struct Reconciler<'a, S: SnapshotStore> {
    /// Project name recorded in new snapshots.
    project: String,
    /// Environment recorded in new snapshots.
    environment: String,
    /// Declared resources.
    declarations: Vec<ResourceDecl>,
    /// Snapshot store.
    store: &'a S,
    /// Providers by resource type.
    registry: ProviderRegistry,
    /// Worker limit for apply.
    workers: usize,
    /// Retry policy for apply.
    retry: RetryPolicy,
    /// Cancellation for apply.
    cancel: Option<CancelSignal>,
    /// Lock holder id.
    holder: String,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// The plan that was executed.
    pub plan: Plan,
    /// What happened.
    pub apply: ApplyResult,
}

/// Result of a drift check.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Number of recorded resources checked.
    pub checked: usize,
    /// Resources whose remote outputs differ from the snapshot.
    pub drifted: Vec<DriftedResource>,
    /// Resources that no longer exist remotely.
    pub missing: Vec<ResourceId>,
    /// Resources that could not be read.
    pub unreadable: Vec<(ResourceId, String)>,
    /// Changes the current declarations would make.
    pub pending_changes: usize,
}

/// A resource whose remote outputs moved.
#[derive(Debug, Serialize)]
pub struct DriftedResource {
    /// The resource.
    pub id: ResourceId,
    /// Output keys that differ.
    pub keys: Vec<String>,
}

/// Result of a refresh.
#[derive(Debug, Default, Serialize)]
pub struct RefreshReport {
    /// Entries whose outputs were updated.
    pub updated: Vec<ResourceId>,
    /// Entries tombstoned because the object is gone.
    pub removed: Vec<ResourceId>,
    /// Entries that matched.
    pub unchanged: usize,
}

impl<'a, S: SnapshotStore> Reconciler<'a, S> {
    /// Creates a reconciler for explicit declarations.
    #[must_use]
    pub fn new(
        project: &str,
        environment: &str,
        declarations: Vec<ResourceDecl>,
        store: &'a S,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            declarations,
            store,
            registry,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            cancel: None,
            holder: generate_holder_id(),
        }
    }

    /// Creates a reconciler for a parsed stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack references undeclared resources.
    pub fn from_stack(stack: &StackConfig, store: &'a S, registry: ProviderRegistry) -> Result<Self> {
        let declarations = stack.to_declarations()?;
        Ok(Self::new(
            &stack.project.name,
            &stack.project.environment,
            declarations,
            store,
            registry,
        )
        .with_workers(stack.engine.workers)
        .with_retry_policy(stack.engine.retry_policy()))
    }

    /// Sets the worker limit.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops apply dispatch once `signal` fires.
    #[must_use]
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Builds the declared graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicates, unknown targets or cycles.
    pub fn graph(&self) -> Result<Graph> {
        Graph::from_decls(self.declarations.iter().cloned())
    }

    /// Loads the snapshot, or starts an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored snapshot is unreadable or corrupt.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let loaded = self.store.load().await?;
        Ok(match loaded {
            Some(snapshot) => {
                if snapshot.project != self.project || snapshot.environment != self.environment {
                    warn!(
                        "Snapshot belongs to {}/{}, running as {}/{}",
                        snapshot.project, snapshot.environment, self.project, self.environment
                    );
                }
                snapshot
            }
            None => {
                debug!("No snapshot found, starting empty");
                Snapshot::new(&self.project, &self.environment)
            }
        })
    }

    /// Plans against the stored snapshot without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or planning fails.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let snapshot = self.snapshot().await?;
        Planner::new(&self.registry).plan(&graph, &snapshot)
    }

    /// Plans the teardown of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or planning fails.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.snapshot().await?;
        Planner::new(&self.registry).plan(&Graph::default(), &snapshot)
    }

    /// Converges the remote objects to the declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held, the snapshot is corrupt, the graph
    /// or plan is invalid, or the new snapshot cannot be saved. Failed changes
    /// are reported in the result, not as an error.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        info!("Applying {}/{}", self.project, self.environment);
        let graph = self.graph()?;
        self.locked_run(graph, RunOperation::Apply).await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Self::apply`].
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        info!("Destroying {}/{}", self.project, self.environment);
        self.locked_run(Graph::default(), RunOperation::Destroy).await
    }

    async fn locked_run(&self, graph: Graph, operation: RunOperation) -> Result<ReconciliationResult> {
        let lock = self
            .store
            .acquire_lock(&self.holder, &operation.to_string())
            .await?;
        debug!("Acquired lock {}", lock.lock_id);

        let outcome = self.run(&graph, operation).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn run(&self, graph: &Graph, operation: RunOperation) -> Result<ReconciliationResult> {
        let snapshot = self.snapshot().await?;
        let plan = Planner::new(&self.registry).plan(graph, &snapshot)?;

        let mut executor = PlanExecutor::new(self.registry.clone())
            .with_workers(self.workers)
            .with_retry_policy(self.retry)
            .with_operation(operation);
        if let Some(signal) = &self.cancel {
            executor = executor.with_cancel_signal(signal.clone());
        }

        let apply = executor.apply(&plan, snapshot).await;
        self.store.save(&apply.snapshot).await?;
        Ok(ReconciliationResult { plan, apply })
    }

    /// Reads every recorded resource and compares it with the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or a resource type
    /// has no provider.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking drift for {}/{}", self.project, self.environment);
        let snapshot = self.snapshot().await?;

        let mut report = DriftReport {
            checked: 0,
            drifted: Vec::new(),
            missing: Vec::new(),
            unreadable: Vec::new(),
            pending_changes: 0,
        };

        for entry in snapshot.live_entries() {
            let provider = self.registry.get(&entry.id.type_name)?;
            report.checked += 1;
            match provider.read(&entry.id, &entry.outputs).await {
                Ok(current) => {
                    let keys: Vec<String> = entry
                        .outputs
                        .keys()
                        .chain(current.keys())
                        .filter(|key| entry.outputs.get(*key) != current.get(*key))
                        .cloned()
                        .collect::<std::collections::BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    if !keys.is_empty() {
                        debug!("{} drifted: {}", entry.id, keys.join(", "));
                        report.drifted.push(DriftedResource {
                            id: entry.id.clone(),
                            keys,
                        });
                    }
                }
                Err(e) if e.is_not_found() => report.missing.push(entry.id.clone()),
                Err(e) => report.unreadable.push((entry.id.clone(), e.to_string())),
            }
        }

        let graph = self.graph()?;
        report.pending_changes = Planner::new(&self.registry)
            .plan(&graph, &snapshot)?
            .actionable()
            .len();
        Ok(report)
    }

    /// Re-reads every recorded resource and updates the snapshot outputs.
    ///
    /// Resources that no longer exist are tombstoned, so the next plan
    /// creates them again.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held, a provider read fails for any
    /// reason other than not-found, or the snapshot cannot be saved.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let lock = self
            .store
            .acquire_lock(&self.holder, &RunOperation::Refresh.to_string())
            .await?;
        let outcome = self.refresh_locked().await;
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn refresh_locked(&self) -> Result<RefreshReport> {
        let mut snapshot = self.snapshot().await?;
        let mut report = RefreshReport::default();

        let entries: Vec<_> = snapshot.live_entries().cloned().collect();
        for entry in entries {
            let provider = self.registry.get(&entry.id.type_name)?;
            match provider.read(&entry.id, &entry.outputs).await {
                Ok(current) if current == entry.outputs => report.unchanged += 1,
                Ok(current) => {
                    info!("{}: outputs refreshed", entry.id);
                    report.updated.push(entry.id.clone());
                    let mut refreshed = entry;
                    refreshed.outputs = current;
                    refreshed.last_modified = Utc::now();
                    snapshot.set_entry(refreshed);
                }
                Err(e) if e.is_not_found() => {
                    warn!("{}: no longer exists, dropping from snapshot", entry.id);
                    snapshot.tombstone(&entry.id);
                    report.removed.push(entry.id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        snapshot.serial += 1;
        let touched = report
            .updated
            .iter()
            .chain(&report.removed)
            .map(ToString::to_string)
            .collect();
        let stack_hash = snapshot.stack_hash.clone();
        snapshot.add_history(HistoryEntry::new(
            RunOperation::Refresh,
            snapshot.serial,
            &stack_hash,
            touched,
        ));
        self.store.save(&snapshot).await?;
        Ok(report)
    }
}

impl ReconciliationResult {
    /// Returns true if every resource converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.apply.is_success()
    }
}

impl DriftReport {
    /// Returns true if remote objects match the snapshot and nothing is pending.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty()
            && self.missing.is_empty()
            && self.unreadable.is_empty()
            && self.pending_changes == 0
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - {} resources converged", self.checked);
        }

        writeln!(f, "Drift detected:")?;
        for drifted in &self.drifted {
            writeln!(f, "  ~ {} ({})", drifted.id, drifted.keys.join(", "))?;
        }
        for id in &self.missing {
            writeln!(f, "  - {id} (missing)")?;
        }
        for (id, message) in &self.unreadable {
            writeln!(f, "  ? {id}: {message}")?;
        }
        if self.pending_changes > 0 {
            writeln!(f, "  {} pending changes", self.pending_changes)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "complete" } else { "incomplete" };
        writeln!(f, "Run {status}:")?;
        for status in [
            ResourceStatus::Created,
            ResourceStatus::Updated,
            ResourceStatus::Replaced,
            ResourceStatus::Deleted,
            ResourceStatus::Unchanged,
            ResourceStatus::Failed,
            ResourceStatus::Skipped,
            ResourceStatus::Cancelled,
        ] {
            let count = self.apply.count(status);
            if count > 0 {
                writeln!(f, "  {status}: {count}")?;
            }
        }
        for failure in self.apply.failures() {
            if let Some(error) = &failure.error {
                writeln!(f, "  error: {error}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{KeelsonError, StateError};
    use crate::graph::Value;
    use crate::provider::{InMemoryBackend, TypeDescriptor};
    use crate::state::MemorySnapshotStore;

    const STACK: &str = r"
project:
  name: egress-hub
resources:
  egress-vpc:
    type: vpc
    properties:
      cidr_block: 10.0.0.0/16
  public-subnet:
    type: subnet
    properties:
      vpc_id: { ref: egress-vpc }
      cidr_block: 10.0.1.0/24
";

    fn setup(backend: &InMemoryBackend) -> (StackConfig, ProviderRegistry) {
        let stack = ConfigParser::new().parse_yaml(STACK, None).expect("stack");
        let mut registry = ProviderRegistry::new();
        registry.register(backend.provider(TypeDescriptor::new("vpc").with_immutable(["cidr_block"])));
        registry.register(backend.provider(TypeDescriptor::new("subnet")));
        (stack, registry)
    }

    #[tokio::test]
    async fn test_apply_persists_snapshot_and_releases_lock() {
        let backend = InMemoryBackend::new();
        let (stack, registry) = setup(&backend);
        let store = MemorySnapshotStore::new();
        let reconciler = Reconciler::from_stack(&stack, &store, registry).expect("reconciler");

        let result = reconciler.apply().await.expect("apply");
        assert!(result.is_success());
        assert_eq!(result.apply.count(ResourceStatus::Created), 2);

        let saved = store.load().await.expect("load").expect("saved");
        assert_eq!(saved.serial, 1);
        assert_eq!(saved.live_count(), 2);
        assert_eq!(saved.project, "egress-hub");
        assert!(!store.is_locked().await.expect("lock state"));

        assert!(reconciler.plan().await.expect("replan").is_empty());
        let drift = reconciler.check_drift().await.expect("drift");
        assert!(drift.is_converged());
        assert_eq!(drift.checked, 2);
    }

    #[tokio::test]
    async fn test_held_lock_blocks_apply() {
        let backend = InMemoryBackend::new();
        let (stack, registry) = setup(&backend);
        let store = MemorySnapshotStore::new();
        store.acquire_lock("someone-else", "apply").await.expect("lock");

        let reconciler = Reconciler::from_stack(&stack, &store, registry).expect("reconciler");
        let err = reconciler.apply().await.unwrap_err();

        assert!(matches!(err, KeelsonError::State(StateError::LockedByOther { .. })));
        assert!(err.is_retryable());
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let backend = InMemoryBackend::new();
        let (stack, registry) = setup(&backend);
        let store = MemorySnapshotStore::new();
        let reconciler = Reconciler::from_stack(&stack, &store, registry).expect("reconciler");

        reconciler.apply().await.expect("apply");
        assert_eq!(reconciler.plan_destroy().await.expect("plan").delete_count(), 2);

        let result = reconciler.destroy().await.expect("destroy");
        assert!(result.is_success());
        assert_eq!(result.apply.count(ResourceStatus::Deleted), 2);
        assert_eq!(backend.object_count(), 0);

        let saved = store.load().await.expect("load").expect("saved");
        assert_eq!(saved.live_count(), 0);
        let last = saved.history.last().expect("history");
        assert_eq!(last.operation, RunOperation::Destroy);
    }

    #[tokio::test]
    async fn test_drift_and_refresh() {
        let backend = InMemoryBackend::new();
        let (stack, registry) = setup(&backend);
        let store = MemorySnapshotStore::new();
        let reconciler = Reconciler::from_stack(&stack, &store, registry).expect("reconciler");
        reconciler.apply().await.expect("apply");

        let vpc = ResourceId::new("vpc", "egress-vpc");
        let subnet = ResourceId::new("subnet", "public-subnet");
        let mut moved = backend.object(&vpc).expect("vpc");
        moved.insert("tag".to_string(), Value::from("edited"));
        backend.insert_object(vpc.clone(), moved);
        backend.remove_object(&subnet);

        let drift = reconciler.check_drift().await.expect("drift");
        assert!(!drift.is_converged());
        assert_eq!(drift.drifted[0].id, vpc);
        assert_eq!(drift.drifted[0].keys, vec!["tag".to_string()]);
        assert_eq!(drift.missing, vec![subnet.clone()]);

        let refreshed = reconciler.refresh().await.expect("refresh");
        assert_eq!(refreshed.updated, vec![vpc.clone()]);
        assert_eq!(refreshed.removed, vec![subnet.clone()]);

        let plan = reconciler.plan().await.expect("plan");
        let actionable: Vec<&ResourceId> = plan.actionable().iter().map(|c| &c.resource).collect();
        assert_eq!(actionable, vec![&subnet]);

        let saved = store.load().await.expect("load").expect("saved");
        assert_eq!(saved.serial, 2);
        assert_eq!(
            saved.history.last().map(|h| h.operation),
            Some(RunOperation::Refresh)
        );
    }
}
