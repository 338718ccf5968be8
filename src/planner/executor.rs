//! Plan executor.
//!
//! The executor drains the plan's ready changes into a bounded pool of tokio
//! tasks. Only the coordinator loop touches the snapshot: workers call the
//! provider, retry transient failures and hand their outcome back.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ProviderError, Result};
use crate::graph::{LifecycleState, Outputs, PropertyMap, Reference, ResourceId, Value};
use crate::provider::{Provider, ProviderRegistry};
use crate::state::{HistoryEntry, RunOperation, Snapshot, SnapshotEntry};

use super::cancel::CancelSignal;
use super::plan::{Change, ChangeAction, Plan, Replacement};
use super::retry::RetryPolicy;

/// Default number of changes in flight at once.
pub const DEFAULT_WORKERS: usize = 4;

/// Executes plans against the registered providers.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    /// Providers by resource type.
    registry: ProviderRegistry,
    /// Maximum changes in flight.
    workers: usize,
    /// Retry policy for transient failures.
    retry: RetryPolicy,
    /// Stops dispatch when triggered.
    cancel: Option<CancelSignal>,
    /// Operation recorded in the run history.
    operation: RunOperation,
}

/// Terminal status of a resource, or of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Newly created.
    Created,
    /// Updated in place.
    Updated,
    /// Deleted and created again.
    Replaced,
    /// Deleted.
    Deleted,
    /// Nothing needed doing.
    Unchanged,
    /// The change failed.
    Failed,
    /// A dependency failed, so the change never ran.
    Skipped,
    /// The run was cancelled before the change started.
    Cancelled,
}

/// Report for one change of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    /// Index of the change in the plan.
    pub index: usize,
    /// Target resource.
    pub resource: ResourceId,
    /// Planned action.
    pub action: ChangeAction,
    /// Action actually sent to the provider, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performed: Option<ChangeAction>,
    /// Replacement half, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<Replacement>,
    /// Outcome of the change.
    pub status: ResourceStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// One terminal status per resource touched by the plan.
    pub statuses: BTreeMap<ResourceId, ResourceStatus>,
    /// Per-change reports, in plan order.
    pub reports: Vec<ChangeReport>,
    /// Final lifecycle state of every planned resource that was not deleted.
    pub lifecycle: BTreeMap<ResourceId, LifecycleState>,
    /// The updated snapshot.
    #[serde(skip)]
    pub snapshot: Snapshot,
    /// Whether cancellation stopped the run.
    pub cancelled: bool,
}

/// Work handed to a pool task.
struct Job {
    index: usize,
    resource: ResourceId,
    action: ChangeAction,
    provider: Arc<dyn Provider>,
    properties: PropertyMap,
    prior_outputs: Outputs,
    retry: RetryPolicy,
}

/// What a pool task hands back.
struct Outcome {
    index: usize,
    attempts: u32,
    result: std::result::Result<Completion, ApplyError>,
}

struct Completion {
    performed: ChangeAction,
    properties: PropertyMap,
    outputs: Option<Outputs>,
}

enum Event {
    Cancelled,
    Joined(Option<std::result::Result<(tokio::task::Id, Outcome), JoinError>>),
}

/// Coordinator state for one run.
struct Run<'p> {
    plan: &'p Plan,
    snapshot: Snapshot,
    /// Unfinished dependencies per change.
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: VecDeque<usize>,
    reports: Vec<Option<ChangeReport>>,
    /// Outputs of resources settled during this run.
    outputs: HashMap<ResourceId, Outputs>,
    /// Resources with a create, update or no-op change in the plan.
    ensured: HashSet<ResourceId>,
    in_flight: HashSet<ResourceId>,
    /// Change index of every spawned pool task.
    tasks: HashMap<tokio::task::Id, usize>,
    lifecycle: BTreeMap<ResourceId, LifecycleState>,
}

impl PlanExecutor {
    /// Creates an executor with default workers and retry policy.
    #[must_use]
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            cancel: None,
            operation: RunOperation::Apply,
        }
    }

    /// Sets the worker limit (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops dispatching new changes once `signal` fires.
    #[must_use]
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Sets the operation recorded in the run history.
    #[must_use]
    pub const fn with_operation(mut self, operation: RunOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Applies `plan`, starting from `snapshot`.
    ///
    /// Never fails as a whole: every change ends with a status in the result,
    /// and the returned snapshot reflects exactly the changes that completed.
    pub async fn apply(&self, plan: &Plan, snapshot: Snapshot) -> ApplyResult {
        info!(
            "Applying {} changes with {} workers",
            plan.actionable().len(),
            self.workers
        );

        let mut run = Run::new(plan, snapshot);
        let mut joins: JoinSet<Outcome> = JoinSet::new();
        let mut signal = self.cancel.clone();
        let mut cancelled = false;

        loop {
            if !cancelled && signal.as_ref().is_some_and(CancelSignal::is_cancelled) {
                warn!("Cancellation requested, no further changes will start");
                cancelled = true;
            }
            if !cancelled {
                self.dispatch(&mut run, &mut joins);
            }
            if joins.is_empty() {
                break;
            }

            let event = match signal.as_mut() {
                Some(signal) if !cancelled => tokio::select! {
                    biased;
                    () = signal.cancelled() => Event::Cancelled,
                    joined = joins.join_next_with_id() => Event::Joined(joined),
                },
                _ => Event::Joined(joins.join_next_with_id().await),
            };

            match event {
                Event::Cancelled => {}
                Event::Joined(Some(Ok((task, outcome)))) => {
                    run.tasks.remove(&task);
                    run.complete(outcome);
                }
                Event::Joined(Some(Err(e))) => run.abort(&e),
                Event::Joined(None) => break,
            }
        }

        run.finish(self.operation, cancelled)
    }

    /// Starts ready changes until the pool is full or nothing is ready.
    fn dispatch(&self, run: &mut Run<'_>, joins: &mut JoinSet<Outcome>) {
        let plan = run.plan;
        let mut deferred = Vec::new();

        while joins.len() < self.workers {
            let Some(index) = run.ready.pop_front() else {
                break;
            };
            let change = &plan.changes[index];
            if run.in_flight.contains(&change.resource) {
                debug!("{} already in flight, deferring change {index}", change.resource);
                deferred.push(index);
                continue;
            }

            match self.prepare(run, index, change) {
                Ok(Some(job)) => {
                    run.launch(&job);
                    let task = joins.spawn(job.run_contained());
                    run.tasks.insert(task.id(), index);
                }
                Ok(None) => {}
                Err(e) => run.fail(index, None, 0, &e),
            }
        }

        for index in deferred.into_iter().rev() {
            run.ready.push_front(index);
        }
    }

    /// Resolves a change into a job, or completes it inline when nothing is needed.
    fn prepare(
        &self,
        run: &mut Run<'_>,
        index: usize,
        change: &Change,
    ) -> std::result::Result<Option<Job>, ApplyError> {
        let provider = self
            .registry
            .get(&change.resource.type_name)
            .map_err(|_| ApplyError::UnknownResourceType {
                resource: change.resource.clone(),
            })?;
        let prior_outputs = change
            .prior
            .as_ref()
            .map(|prior| prior.outputs.clone())
            .unwrap_or_default();

        let (action, properties) = if change.action == ChangeAction::Delete {
            (ChangeAction::Delete, PropertyMap::new())
        } else {
            let properties = run.resolve(change)?;
            let action = match (change.action, &change.prior) {
                (ChangeAction::NoOp, Some(prior)) if prior.properties == properties => {
                    run.unchanged(index, prior);
                    return Ok(None);
                }
                (ChangeAction::NoOp, Some(_)) => {
                    info!("{}: dependency outputs moved, updating", change.resource);
                    ChangeAction::Update
                }
                (ChangeAction::NoOp, None) => ChangeAction::Create,
                (action, _) => action,
            };
            (action, properties)
        };

        Ok(Some(Job {
            index,
            resource: change.resource.clone(),
            action,
            provider,
            properties,
            prior_outputs,
            retry: self.retry,
        }))
    }
}

impl Job {
    /// Runs the job on its own task so that a provider panic stays contained.
    async fn run_contained(self) -> Outcome {
        let index = self.index;
        let resource = self.resource.clone();
        match tokio::spawn(self.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{resource}: provider task failed: {e}");
                Outcome {
                    index,
                    attempts: 1,
                    result: Err(ApplyError::TaskPanicked { resource }),
                }
            }
        }
    }

    async fn run(self) -> Outcome {
        let mut action = self.action;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self.call(action).await;

            let error = match result {
                Ok(outputs) => {
                    let invalid = outputs.as_ref().and_then(non_finite_output);
                    let result = match invalid {
                        Some(key) => Err(ApplyError::Permanent {
                            resource: self.resource.clone(),
                            message: format!("output '{key}' is not a finite number"),
                        }),
                        None => Ok(outputs),
                    };
                    break self.outcome(attempts, action, result);
                }
                Err(e) => e,
            };

            if error.is_not_found() {
                match action {
                    ChangeAction::Delete => {
                        debug!("{}: already gone", self.resource);
                        break self.outcome(attempts, action, Ok(None));
                    }
                    ChangeAction::Update => {
                        warn!("{}: vanished remotely, creating it again", self.resource);
                        action = ChangeAction::Create;
                        continue;
                    }
                    ChangeAction::Create | ChangeAction::NoOp => {}
                }
            }

            if self.retry.should_retry(attempts, &error) {
                let delay = self.retry.delay_for(attempts);
                warn!(
                    "{} {} failed (attempt {attempts}/{}), retrying in {delay:?}: {error}",
                    action, self.resource, self.retry.max_attempts
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let failure = if error.is_transient() {
                ApplyError::RetriesExhausted {
                    resource: self.resource.clone(),
                    attempts,
                    message: error.message().to_string(),
                }
            } else {
                ApplyError::Permanent {
                    resource: self.resource.clone(),
                    message: error.message().to_string(),
                }
            };
            break self.outcome(attempts, action, Err(failure));
        }
    }

    async fn call(&self, action: ChangeAction) -> std::result::Result<Option<Outputs>, ProviderError> {
        match action {
            ChangeAction::Create => self.provider.create(&self.resource, &self.properties).await.map(Some),
            ChangeAction::Update => self
                .provider
                .update(&self.resource, &self.prior_outputs, &self.properties)
                .await
                .map(Some),
            ChangeAction::Delete => self
                .provider
                .delete(&self.resource, &self.prior_outputs)
                .await
                .map(|()| None),
            ChangeAction::NoOp => Ok(None),
        }
    }

    fn outcome(
        &self,
        attempts: u32,
        performed: ChangeAction,
        result: std::result::Result<Option<Outputs>, ApplyError>,
    ) -> Outcome {
        Outcome {
            index: self.index,
            attempts,
            result: result.map(|outputs| Completion {
                performed,
                properties: self.properties.clone(),
                outputs,
            }),
        }
    }
}

impl<'p> Run<'p> {
    fn new(plan: &'p Plan, snapshot: Snapshot) -> Self {
        let count = plan.changes.len();
        let mut remaining = vec![0; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, change) in plan.changes.iter().enumerate() {
            for &dependency in &change.depends_on {
                if let Some(list) = dependents.get_mut(dependency)
                    && dependency != index
                {
                    list.push(index);
                    remaining[index] += 1;
                }
            }
        }

        let ready = (0..count).filter(|&i| remaining[i] == 0).collect();
        let ensured = plan
            .changes
            .iter()
            .filter(|c| c.action != ChangeAction::Delete)
            .map(|c| c.resource.clone())
            .collect();
        let lifecycle = plan
            .changes
            .iter()
            .map(|c| {
                let state = if snapshot.live(&c.resource).is_some() {
                    LifecycleState::Created
                } else {
                    LifecycleState::Planned
                };
                (c.resource.clone(), state)
            })
            .collect();

        Self {
            plan,
            snapshot,
            remaining,
            dependents,
            ready,
            reports: vec![None; count],
            outputs: HashMap::new(),
            ensured,
            in_flight: HashSet::new(),
            tasks: HashMap::new(),
            lifecycle,
        }
    }

    fn lookup(&self, reference: &Reference) -> Option<Value> {
        if let Some(outputs) = self.outputs.get(&reference.resource) {
            return outputs.get(&reference.output).cloned();
        }
        if self.ensured.contains(&reference.resource) {
            return None;
        }
        self.snapshot
            .live(&reference.resource)
            .and_then(|entry| entry.outputs.get(&reference.output))
            .cloned()
    }

    /// Substitutes every reference in the change's properties.
    fn resolve(&self, change: &Change) -> std::result::Result<PropertyMap, ApplyError> {
        let lookup = |reference: &Reference| self.lookup(reference);
        let mut resolved = PropertyMap::new();
        for (key, value) in &change.properties {
            let (value, missing) = value.resolve_with(&lookup);
            if let Some(reference) = missing {
                return Err(ApplyError::UnresolvedReference {
                    resource: change.resource.clone(),
                    target: reference.resource,
                    output: reference.output,
                });
            }
            if !value.is_finite() {
                return Err(ApplyError::Permanent {
                    resource: change.resource.clone(),
                    message: format!("property '{key}' is not a finite number"),
                });
            }
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }

    fn launch(&mut self, job: &Job) {
        let state = match job.action {
            ChangeAction::Create => LifecycleState::Creating,
            ChangeAction::Update => LifecycleState::Updating,
            ChangeAction::Delete => LifecycleState::Deleting,
            ChangeAction::NoOp => LifecycleState::Created,
        };
        info!("{} {}", job.action, job.resource);
        self.in_flight.insert(job.resource.clone());
        self.lifecycle.insert(job.resource.clone(), state);
    }

    fn complete(&mut self, outcome: Outcome) {
        let plan = self.plan;
        let change = &plan.changes[outcome.index];
        self.in_flight.remove(&change.resource);
        match outcome.result {
            Ok(completion) => self.succeed(outcome.index, outcome.attempts, completion),
            Err(e) => self.fail(outcome.index, Some(change.action), outcome.attempts, &e),
        }
    }

    /// Fails the change whose pool task died before handing back an outcome.
    fn abort(&mut self, e: &JoinError) {
        let Some(index) = self.tasks.remove(&e.id()) else {
            error!("Executor task aborted: {e}");
            return;
        };
        let plan = self.plan;
        let change = &plan.changes[index];
        self.in_flight.remove(&change.resource);
        let error = ApplyError::TaskPanicked {
            resource: change.resource.clone(),
        };
        self.fail(index, Some(change.action), 1, &error);
    }

    fn unchanged(&mut self, index: usize, prior: &SnapshotEntry) {
        let plan = self.plan;
        let change = &plan.changes[index];
        debug!("{} unchanged", change.resource);
        self.outputs.insert(change.resource.clone(), prior.outputs.clone());
        self.snapshot
            .set_dependencies(&change.resource, change.dependencies.clone());
        self.lifecycle
            .insert(change.resource.clone(), LifecycleState::Created);
        self.record(index, None, ResourceStatus::Unchanged, 0, None);
        self.release(index);
    }

    fn succeed(&mut self, index: usize, attempts: u32, completion: Completion) {
        let plan = self.plan;
        let change = &plan.changes[index];
        let id = &change.resource;

        let status = match completion.performed {
            ChangeAction::Create | ChangeAction::Update | ChangeAction::NoOp => {
                let outputs = completion.outputs.unwrap_or_default();
                let entry = SnapshotEntry::new(
                    id.clone(),
                    completion.properties,
                    outputs.clone(),
                    change.dependencies.clone(),
                );
                self.outputs.insert(id.clone(), outputs);
                self.lifecycle.insert(id.clone(), LifecycleState::Created);
                if change.replacement == Some(Replacement::CreateBeforeDelete)
                    && let Some(old) = self.snapshot.live(id).cloned()
                {
                    debug!("{id}: deposing the object being replaced");
                    self.snapshot.depose(&old);
                }
                if completion.performed == ChangeAction::Update {
                    self.snapshot.set_entry(entry);
                    ResourceStatus::Updated
                } else {
                    self.snapshot.insert_entry(entry);
                    ResourceStatus::Created
                }
            }
            ChangeAction::Delete => {
                match change.replacement {
                    // The replacement already owns the snapshot entry.
                    Some(Replacement::CreateBeforeDelete) => {
                        if let Some(prior) = &change.prior {
                            self.snapshot.remove_deposed(id, &prior.outputs);
                        }
                    }
                    Some(Replacement::DeleteBeforeCreate) => {
                        self.snapshot.tombstone(id);
                        self.lifecycle.insert(id.clone(), LifecycleState::Planned);
                    }
                    None => {
                        self.snapshot.tombstone(id);
                        self.lifecycle.remove(id);
                    }
                }
                ResourceStatus::Deleted
            }
        };

        info!("{id}: {status} after {attempts} attempt(s)");
        self.record(index, Some(completion.performed), status, attempts, None);
        self.release(index);
    }

    /// Marks a change failed and skips everything downstream of it.
    fn fail(&mut self, index: usize, performed: Option<ChangeAction>, attempts: u32, error: &ApplyError) {
        let resource = self.plan.changes[index].resource.clone();
        error!("{error}");
        self.lifecycle.insert(resource.clone(), LifecycleState::Failed);
        self.record(
            index,
            performed,
            ResourceStatus::Failed,
            attempts,
            Some(error.to_string()),
        );

        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(dependent) = queue.pop_front() {
            if self.reports[dependent].is_some() {
                continue;
            }
            let skipped = &self.plan.changes[dependent];
            warn!("Skipping {} ({}): {resource} failed", skipped.description(), skipped.resource);
            self.record(
                dependent,
                None,
                ResourceStatus::Skipped,
                0,
                Some(format!("dependency {resource} failed")),
            );
            queue.extend(self.dependents[dependent].iter().copied());
        }
    }

    fn release(&mut self, index: usize) {
        for &dependent in &self.dependents[index] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.reports[dependent].is_none() {
                self.ready.push_back(dependent);
            }
        }
    }

    fn record(
        &mut self,
        index: usize,
        performed: Option<ChangeAction>,
        status: ResourceStatus,
        attempts: u32,
        error: Option<String>,
    ) {
        let change = &self.plan.changes[index];
        self.reports[index] = Some(ChangeReport {
            index,
            resource: change.resource.clone(),
            action: change.action,
            performed,
            replacement: change.replacement,
            status,
            attempts,
            error,
        });
    }

    fn finish(mut self, operation: RunOperation, cancelled: bool) -> ApplyResult {
        for index in 0..self.reports.len() {
            if self.reports[index].is_none() {
                self.record(
                    index,
                    None,
                    ResourceStatus::Cancelled,
                    0,
                    Some(String::from("not started")),
                );
            }
        }
        let reports: Vec<ChangeReport> = self.reports.into_iter().flatten().collect();
        let statuses = aggregate(&reports);

        let touched: Vec<String> = self
            .plan
            .changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp)
            .map(|c| c.resource.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut snapshot = self.snapshot;
        snapshot.serial += 1;
        let result_counts = |status: ResourceStatus| statuses.values().filter(|s| **s == status).count();
        let (failed, skipped, halted) = (
            result_counts(ResourceStatus::Failed),
            result_counts(ResourceStatus::Skipped),
            result_counts(ResourceStatus::Cancelled),
        );

        if failed + skipped + halted == 0 {
            snapshot.stack_hash.clone_from(&self.plan.stack_hash);
            snapshot.add_history(HistoryEntry::new(
                operation,
                snapshot.serial,
                &self.plan.stack_hash,
                touched,
            ));
            info!("Apply complete: {} resources", statuses.len());
        } else {
            let error = ApplyError::Incomplete {
                failed,
                skipped,
                cancelled: halted,
            }
            .to_string();
            snapshot.add_history(HistoryEntry::failed(
                operation,
                snapshot.serial,
                &self.plan.stack_hash,
                touched,
                &error,
            ));
            warn!("Apply incomplete: {error}");
        }

        ApplyResult {
            statuses,
            reports,
            lifecycle: self.lifecycle,
            snapshot,
            cancelled,
        }
    }
}

/// Names the first output that could not be persisted.
fn non_finite_output(outputs: &Outputs) -> Option<String> {
    outputs
        .iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(key, _)| key.clone())
}

/// Folds per-change statuses into one status per resource.
fn aggregate(reports: &[ChangeReport]) -> BTreeMap<ResourceId, ResourceStatus> {
    let severity = |status: ResourceStatus| match status {
        ResourceStatus::Failed => 3,
        ResourceStatus::Skipped => 2,
        ResourceStatus::Cancelled => 1,
        _ => 0,
    };

    let mut statuses = BTreeMap::new();
    for report in reports {
        let status = match statuses.get(&report.resource) {
            None => report.status,
            Some(&previous) if severity(previous) == 0 && severity(report.status) == 0 => {
                match (previous, report.status) {
                    // Clearing a deposed object leaves the live resource as it was.
                    (ResourceStatus::Deleted, kept @ (ResourceStatus::Unchanged | ResourceStatus::Updated))
                    | (kept @ (ResourceStatus::Unchanged | ResourceStatus::Updated), ResourceStatus::Deleted) => kept,
                    (ResourceStatus::Deleted, ResourceStatus::Deleted) => ResourceStatus::Deleted,
                    _ => ResourceStatus::Replaced,
                }
            }
            Some(&previous) if severity(previous) >= severity(report.status) => previous,
            Some(_) => report.status,
        };
        statuses.insert(report.resource.clone(), status);
    }
    statuses
}

impl ResourceStatus {
    /// Returns true for statuses that leave the resource converged.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted | Self::Unchanged
        )
    }
}

impl ApplyResult {
    /// Returns true if every resource converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.statuses.values().all(|s| s.is_success())
    }

    /// Counts resources with `status`.
    #[must_use]
    pub fn count(&self, status: ResourceStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Returns the status of one resource.
    #[must_use]
    pub fn status(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.statuses.get(id).copied()
    }

    /// Returns the reports of failed changes.
    #[must_use]
    pub fn failures(&self) -> Vec<&ChangeReport> {
        self.reports
            .iter()
            .filter(|r| r.status == ResourceStatus::Failed)
            .collect()
    }

    /// Turns a partial result into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Incomplete`] unless every resource converged.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(ApplyError::Incomplete {
            failed: self.count(ResourceStatus::Failed),
            skipped: self.count(ResourceStatus::Skipped),
            cancelled: self.count(ResourceStatus::Cancelled),
        }
        .into())
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KeelsonError, ProviderResult};
    use crate::graph::{Graph, ResourceDecl};
    use crate::planner::{cancel_pair, Planner};
    use crate::provider::{InMemoryBackend, Operation, TypeDescriptor};
    use chrono::Utc;
    use std::time::Duration;

    fn vpc() -> ResourceId {
        ResourceId::new("vpc", "main")
    }

    fn subnet() -> ResourceId {
        ResourceId::new("subnet", "a")
    }

    fn route() -> ResourceId {
        ResourceId::new("route", "default")
    }

    fn registry(backend: &InMemoryBackend, create_before_delete: bool) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(backend.provider(
            TypeDescriptor::new("vpc")
                .with_immutable(["cidr_block"])
                .with_create_before_delete(create_before_delete),
        ));
        registry.register(backend.provider(TypeDescriptor::new("subnet")));
        registry.register(backend.provider(TypeDescriptor::new("route")));
        registry
    }

    fn network_decls(cidr: &str, subnet_tag: &str) -> Vec<ResourceDecl> {
        vec![
            ResourceDecl::new("vpc", "main").with_property("cidr_block", cidr),
            ResourceDecl::new("subnet", "a")
                .with_property("vpc_id", vpc().output("id"))
                .with_property("tag", subnet_tag),
            ResourceDecl::new("route", "default").with_property("subnet_id", subnet().output("id")),
        ]
    }

    fn network(cidr: &str, subnet_tag: &str) -> Graph {
        Graph::from_decls(network_decls(cidr, subnet_tag)).expect("acyclic")
    }

    fn executor(registry: &ProviderRegistry) -> PlanExecutor {
        PlanExecutor::new(registry.clone()).with_retry_policy(RetryPolicy::immediate(3))
    }

    async fn converge(registry: &ProviderRegistry, graph: &Graph, snapshot: Snapshot) -> ApplyResult {
        let plan = Planner::new(registry).plan(graph, &snapshot).expect("plan");
        executor(registry).apply(&plan, snapshot).await
    }

    #[tokio::test]
    async fn test_apply_creates_and_replan_is_idempotent() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let graph = network("10.0.0.0/16", "blue");

        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;
        assert!(result.is_success());
        assert_eq!(result.count(ResourceStatus::Created), 3);
        assert_eq!(result.snapshot.serial, 1);
        assert_eq!(result.snapshot.stack_hash, crate::config::ConfigHasher::hash_graph(&graph));

        let vpc_outputs = backend.object(&vpc()).expect("vpc exists");
        let subnet_entry = result.snapshot.live(&subnet()).expect("subnet recorded");
        assert_eq!(subnet_entry.properties.get("vpc_id"), vpc_outputs.get("id"));
        assert_eq!(subnet_entry.dependencies, BTreeSet::from([vpc()]));
        assert_eq!(result.lifecycle.get(&route()), Some(&LifecycleState::Created));

        let replan = Planner::new(&registry)
            .plan(&graph, &result.snapshot)
            .expect("replan");
        assert!(replan.is_empty());

        let again = executor(&registry).apply(&replan, result.snapshot).await;
        assert_eq!(again.count(ResourceStatus::Unchanged), 3);
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_removed_resource_is_deleted_and_tombstoned() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);

        let first = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;
        let trimmed = Graph::from_decls([
            ResourceDecl::new("vpc", "main").with_property("cidr_block", "10.0.0.0/16"),
        ])
        .expect("acyclic");

        let result = converge(&registry, &trimmed, first.snapshot).await;
        assert!(result.is_success());
        assert_eq!(result.status(&route()), Some(ResourceStatus::Deleted));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Deleted));
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Unchanged));
        assert!(result.snapshot.live(&subnet()).is_none());
        assert!(result.snapshot.get(&subnet()).is_some_and(|e| !e.is_live()));
        assert!(!result.lifecycle.contains_key(&subnet()));
        assert_eq!(backend.object_count(), 1);

        let calls = backend.calls();
        let route_delete = calls
            .iter()
            .position(|c| c.operation == Operation::Delete && c.resource == route());
        let subnet_delete = calls
            .iter()
            .position(|c| c.operation == Operation::Delete && c.resource == subnet());
        assert!(route_delete < subnet_delete);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_dependents() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let mut decls = network_decls("10.0.0.0/16", "blue");
        decls.push(ResourceDecl::new("vpc", "other"));
        let graph = Graph::from_decls(decls).expect("acyclic");

        backend.fail_next(&vpc(), ProviderError::permanent("cidr overlaps"));
        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;

        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Failed));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Skipped));
        assert_eq!(result.status(&route()), Some(ResourceStatus::Skipped));
        assert_eq!(
            result.status(&ResourceId::new("vpc", "other")),
            Some(ResourceStatus::Created)
        );
        assert_eq!(result.snapshot.live_count(), 1);
        assert_eq!(result.lifecycle.get(&vpc()), Some(&LifecycleState::Failed));
        assert_eq!(result.lifecycle.get(&subnet()), Some(&LifecycleState::Planned));
        assert_eq!(backend.call_count(Operation::Create, &subnet()), 0);

        let failure = result.failures()[0];
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.as_deref().is_some_and(|e| e.contains("cidr overlaps")));

        let history = result.snapshot.history.last().expect("history");
        assert!(!history.success);
        assert!(result.snapshot.stack_hash.is_empty());
        assert!(matches!(
            result.ensure_complete().unwrap_err(),
            KeelsonError::Apply(ApplyError::Incomplete { failed: 1, skipped: 2, cancelled: 0 })
        ));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_dependent_entries_untouched() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let first = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;
        let before = first.snapshot.clone();

        let graph = Graph::from_decls([
            ResourceDecl::new("vpc", "main")
                .with_property("cidr_block", "10.0.0.0/16")
                .with_property("tag", "prod"),
            ResourceDecl::new("subnet", "a")
                .with_property("vpc_id", vpc().output("id"))
                .with_property("tag", "green"),
            ResourceDecl::new("route", "default").with_property("subnet_id", subnet().output("id")),
        ])
        .expect("acyclic");

        backend.fail_next(&vpc(), ProviderError::permanent("forbidden"));
        let result = converge(&registry, &graph, first.snapshot).await;

        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Failed));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Skipped));
        assert_eq!(result.status(&route()), Some(ResourceStatus::Skipped));
        for id in [vpc(), subnet(), route()] {
            assert_eq!(result.snapshot.get(&id), before.get(&id));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let graph = Graph::from_decls([ResourceDecl::new("vpc", "main")]).expect("acyclic");

        backend.fail_times(&vpc(), 2, &ProviderError::transient("throttled"));
        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Created));
        assert_eq!(result.reports[0].attempts, 3);

        let flaky = ResourceId::new("vpc", "flaky");
        let graph = Graph::from_decls([ResourceDecl::new("vpc", "flaky")]).expect("acyclic");
        backend.fail_times(&flaky, 3, &ProviderError::transient("throttled"));
        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;

        assert_eq!(result.status(&flaky), Some(ResourceStatus::Failed));
        assert_eq!(result.reports[0].attempts, 3);
        assert!(result.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("gave up after 3 attempts")));
    }

    #[tokio::test]
    async fn test_worker_limit_is_respected() {
        let backend = InMemoryBackend::new().with_latency(Duration::from_millis(20));
        let registry = registry(&backend, false);
        let graph = Graph::from_decls(
            (0..6).map(|i| ResourceDecl::new("subnet", format!("s{i}"))),
        )
        .expect("acyclic");

        let plan = Planner::new(&registry)
            .plan(&graph, &Snapshot::new("demo", "dev"))
            .expect("plan");
        let result = executor(&registry)
            .with_workers(2)
            .apply(&plan, Snapshot::new("demo", "dev"))
            .await;

        assert!(result.is_success());
        assert_eq!(backend.max_concurrency(), 2);
    }

    fn manual_change(action: ChangeAction, prior: Option<SnapshotEntry>) -> Change {
        Change {
            resource: vpc(),
            action,
            replacement: None,
            diff: Vec::new(),
            properties: PropertyMap::new(),
            dependencies: BTreeSet::new(),
            prior,
            depends_on: Vec::new(),
            reason: String::new(),
        }
    }

    #[tokio::test]
    async fn test_same_identity_changes_never_overlap() {
        let backend = InMemoryBackend::new().with_latency(Duration::from_millis(20));
        let registry = registry(&backend, false);
        let plan = Plan {
            created_at: Utc::now(),
            stack_hash: String::new(),
            changes: vec![
                manual_change(ChangeAction::Create, None),
                manual_change(ChangeAction::Update, None),
            ],
        };

        let result = executor(&registry)
            .with_workers(4)
            .apply(&plan, Snapshot::new("demo", "dev"))
            .await;

        assert!(backend.overlapping().is_empty());
        assert_eq!(result.reports[0].status, ResourceStatus::Created);
        assert_eq!(result.reports[1].status, ResourceStatus::Updated);
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let graph = network("10.0.0.0/16", "blue");
        let plan = Planner::new(&registry)
            .plan(&graph, &Snapshot::new("demo", "dev"))
            .expect("plan");

        let (handle, signal) = cancel_pair();
        handle.cancel();
        let result = executor(&registry)
            .with_cancel_signal(signal)
            .apply(&plan, Snapshot::new("demo", "dev"))
            .await;

        assert!(result.cancelled);
        assert_eq!(result.count(ResourceStatus::Cancelled), 3);
        assert_eq!(result.snapshot.live_count(), 0);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_changes_finish() {
        let backend = InMemoryBackend::new().with_latency(Duration::from_millis(60));
        let registry = registry(&backend, false);
        let graph = network("10.0.0.0/16", "blue");
        let plan = Planner::new(&registry)
            .plan(&graph, &Snapshot::new("demo", "dev"))
            .expect("plan");

        let (handle, signal) = cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let result = executor(&registry)
            .with_cancel_signal(signal)
            .apply(&plan, Snapshot::new("demo", "dev"))
            .await;
        canceller.await.expect("canceller");

        assert!(result.cancelled);
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Created));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Cancelled));
        assert_eq!(result.status(&route()), Some(ResourceStatus::Cancelled));
        assert!(result.snapshot.live(&vpc()).is_some());
        assert!(result.snapshot.live(&subnet()).is_none());
    }

    #[tokio::test]
    async fn test_provider_panic_is_contained() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        backend.panic_next(&vpc());

        let result = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;

        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Failed));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Skipped));
        assert!(result.failures()[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("panicked")));
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let first = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;

        let result = converge(&registry, &network("10.1.0.0/16", "blue"), first.snapshot).await;
        assert!(result.is_success());
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Replaced));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Updated));

        let calls: Vec<Operation> = backend
            .calls()
            .into_iter()
            .filter(|c| c.resource == vpc())
            .map(|c| c.operation)
            .collect();
        assert_eq!(calls, vec![Operation::Create, Operation::Delete, Operation::Create]);

        let new_vpc = backend.object(&vpc()).expect("new vpc");
        let subnet_entry = result.snapshot.live(&subnet()).expect("subnet");
        assert_eq!(subnet_entry.properties.get("vpc_id"), new_vpc.get("id"));
        assert_eq!(result.snapshot.live(&vpc()).map(|e| &e.outputs), Some(&new_vpc));
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, true);
        let first = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;
        let old_vpc = backend.object(&vpc()).expect("old vpc");

        let result = converge(&registry, &network("10.1.0.0/16", "blue"), first.snapshot).await;
        assert!(result.is_success());
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Replaced));

        let calls = backend.calls();
        let position = |operation: Operation, id: &ResourceId| {
            calls
                .iter()
                .rposition(|c| c.operation == operation && c.resource == *id)
        };
        assert!(position(Operation::Create, &vpc()) < position(Operation::Update, &subnet()));
        assert!(position(Operation::Update, &subnet()) < position(Operation::Delete, &vpc()));

        let new_vpc = backend.object(&vpc()).expect("new vpc survives");
        assert_ne!(new_vpc.get("id"), old_vpc.get("id"));
        assert_eq!(backend.object_count(), 3);
        assert_eq!(
            result.snapshot.live(&vpc()).and_then(|e| e.outputs.get("id")),
            new_vpc.get("id")
        );
    }

    #[tokio::test]
    async fn test_vanished_object_is_recreated_on_update() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let graph = Graph::from_decls([ResourceDecl::new("subnet", "a").with_property("tag", "blue")])
            .expect("acyclic");
        let first = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;
        backend.remove_object(&subnet());

        let graph = Graph::from_decls([ResourceDecl::new("subnet", "a").with_property("tag", "green")])
            .expect("acyclic");
        let result = converge(&registry, &graph, first.snapshot).await;

        assert!(result.is_success());
        assert_eq!(result.reports[0].performed, Some(ChangeAction::Create));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Created));
        assert!(backend.object(&subnet()).is_some());
    }

    #[tokio::test]
    async fn test_failed_replacement_delete_is_retried_next_run() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, true);
        let first = converge(&registry, &network("10.0.0.0/16", "blue"), Snapshot::new("demo", "dev")).await;
        let Some(Value::String(old_id)) = backend.object(&vpc()).and_then(|o| o.get("id").cloned()) else {
            panic!("old vpc has no physical id");
        };

        backend.fail_next_on(Operation::Delete, &vpc(), ProviderError::permanent("still attached"));
        let graph = network("10.1.0.0/16", "blue");
        let second = converge(&registry, &graph, first.snapshot).await;

        assert_eq!(second.status(&vpc()), Some(ResourceStatus::Failed));
        assert!(backend.holds(&old_id));
        assert_eq!(backend.object_count(), 4);
        assert_eq!(second.snapshot.deposed.len(), 1);
        assert_eq!(
            second.snapshot.deposed[0].outputs.get("id"),
            Some(&Value::String(old_id.clone()))
        );

        let plan = Planner::new(&registry)
            .plan(&graph, &second.snapshot)
            .expect("replan");
        assert_eq!(plan.actionable().len(), 1);
        let delete = plan.position(&vpc(), ChangeAction::Delete).expect("deposed delete");
        assert_eq!(
            plan.changes[delete].prior.as_ref().and_then(|p| p.outputs.get("id")),
            Some(&Value::String(old_id.clone()))
        );

        let third = executor(&registry).apply(&plan, second.snapshot).await;
        assert!(third.is_success());
        assert_eq!(third.status(&vpc()), Some(ResourceStatus::Unchanged));
        assert!(third.snapshot.deposed.is_empty());
        assert!(!backend.holds(&old_id));
        assert_eq!(backend.object_count(), 3);
        assert!(backend.object(&vpc()).is_some());

        let settled = Planner::new(&registry)
            .plan(&graph, &third.snapshot)
            .expect("settled plan");
        assert!(settled.is_empty());
    }

    /// Reports outputs that cannot be encoded as JSON.
    #[derive(Debug)]
    struct GaugeProvider {
        descriptor: TypeDescriptor,
    }

    #[async_trait::async_trait]
    impl Provider for GaugeProvider {
        fn descriptor(&self) -> &TypeDescriptor {
            &self.descriptor
        }

        async fn create(&self, _id: &ResourceId, _properties: &PropertyMap) -> ProviderResult<Outputs> {
            let mut outputs = Outputs::new();
            outputs.insert("id".to_string(), Value::from("gauge-1"));
            outputs.insert("ratio".to_string(), Value::Float(f64::NAN));
            Ok(outputs)
        }

        async fn read(&self, _id: &ResourceId, outputs: &Outputs) -> ProviderResult<Outputs> {
            Ok(outputs.clone())
        }

        async fn update(
            &self,
            id: &ResourceId,
            _prior: &Outputs,
            properties: &PropertyMap,
        ) -> ProviderResult<Outputs> {
            self.create(id, properties).await
        }

        async fn delete(&self, _id: &ResourceId, _outputs: &Outputs) -> ProviderResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_non_finite_outputs_fail_the_change() {
        let mut registry = ProviderRegistry::new();
        registry.register(GaugeProvider {
            descriptor: TypeDescriptor::new("gauge"),
        });
        let gauge = ResourceId::new("gauge", "load");
        let graph = Graph::from_decls([ResourceDecl::new("gauge", "load")]).expect("acyclic");

        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;

        assert_eq!(result.status(&gauge), Some(ResourceStatus::Failed));
        assert_eq!(result.reports[0].attempts, 1);
        assert!(result.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("output 'ratio' is not a finite number")));
        assert!(result.snapshot.live(&gauge).is_none());
        let json = serde_json::to_string(&result.snapshot).expect("serialize");
        let back: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert!(back.validate().is_ok());
    }

    #[tokio::test]
    async fn test_non_finite_property_never_reaches_provider() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let graph = Graph::from_decls([
            ResourceDecl::new("subnet", "a").with_property("weight", Value::Float(f64::INFINITY)),
        ])
        .expect("acyclic");

        let result = converge(&registry, &graph, Snapshot::new("demo", "dev")).await;

        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Failed));
        assert!(result.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("property 'weight' is not a finite number")));
        assert!(backend.calls().is_empty());
    }

    async fn lost_worker() {
        panic!("worker lost");
    }

    #[tokio::test]
    async fn test_lost_task_fails_its_change() {
        let backend = InMemoryBackend::new();
        let registry = registry(&backend, false);
        let plan = Planner::new(&registry)
            .plan(&network("10.0.0.0/16", "blue"), &Snapshot::new("demo", "dev"))
            .expect("plan");
        let vpc_change = plan.position(&vpc(), ChangeAction::Create).expect("vpc create");

        let mut run = Run::new(&plan, Snapshot::new("demo", "dev"));
        let mut joins: JoinSet<()> = JoinSet::new();
        let task = joins.spawn(lost_worker());
        run.tasks.insert(task.id(), vpc_change);
        run.in_flight.insert(vpc());
        let Some(Err(e)) = joins.join_next().await else {
            panic!("task should have panicked");
        };

        run.abort(&e);
        assert!(run.in_flight.is_empty());
        assert!(run.tasks.is_empty());

        let result = run.finish(RunOperation::Apply, false);
        assert_eq!(result.status(&vpc()), Some(ResourceStatus::Failed));
        assert_eq!(result.status(&subnet()), Some(ResourceStatus::Skipped));
        assert_eq!(result.status(&route()), Some(ResourceStatus::Skipped));
        assert_eq!(result.reports[vpc_change].performed, Some(ChangeAction::Create));
        assert!(result.reports[vpc_change]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("panicked")));
    }
}
