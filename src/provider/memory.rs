//! In-memory provider for simulation and tests.
//!
//! Several [`InMemoryProvider`]s (one per resource type) share one
//! [`InMemoryBackend`], which holds the simulated remote objects together with
//! scripted failures, artificial latency and concurrency accounting.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{Outputs, PropertyMap, ResourceId, Value};

use super::{Provider, TypeDescriptor};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Object creation.
    Create,
    /// Output read.
    Read,
    /// In-place update.
    Update,
    /// Object deletion.
    Delete,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// What was called.
    pub operation: Operation,
    /// Resource the call targeted.
    pub resource: ResourceId,
}

/// Scripted outcome for the next mutating call on a resource.
#[derive(Debug)]
enum Scripted {
    Fail(ProviderError),
    Panic,
}

#[derive(Debug, Default)]
struct BackendState {
    objects: BTreeMap<ResourceId, Outputs>,
    /// Physical ids of objects superseded by a newer create on the same identity.
    retired: BTreeMap<String, ResourceId>,
    /// Scripted outcomes, each optionally limited to one kind of call.
    scripts: HashMap<ResourceId, VecDeque<(Option<Operation>, Scripted)>>,
    latency: Duration,
    calls: Vec<ProviderCall>,
    active: usize,
    max_active: usize,
    active_ids: HashMap<ResourceId, usize>,
    overlapping: Vec<ResourceId>,
}

/// Shared simulated remote system.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

/// Provider for one resource type backed by an [`InMemoryBackend`].
#[derive(Clone)]
pub struct InMemoryProvider {
    descriptor: TypeDescriptor,
    backend: InMemoryBackend,
}

/// Decrements the in-flight counters when a call ends, even by panic.
struct ActiveGuard<'a> {
    backend: &'a InMemoryBackend,
    id: ResourceId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.backend.lock();
        state.active = state.active.saturating_sub(1);
        if let Some(count) = state.active_ids.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                state.active_ids.remove(&self.id);
            }
        }
    }
}

impl InMemoryBackend {
    /// Creates an empty backend with no latency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latency applied to every call.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Creates a provider for `descriptor` sharing this backend.
    #[must_use]
    pub fn provider(&self, descriptor: TypeDescriptor) -> InMemoryProvider {
        InMemoryProvider {
            descriptor,
            backend: self.clone(),
        }
    }

    /// Makes the next mutating call on `id` fail with `error`.
    pub fn fail_next(&self, id: &ResourceId, error: ProviderError) {
        self.script(id, None, Scripted::Fail(error));
    }

    /// Makes the next `operation` call on `id` fail with `error`.
    ///
    /// Calls of other kinds pass through until that one arrives.
    pub fn fail_next_on(&self, operation: Operation, id: &ResourceId, error: ProviderError) {
        self.script(id, Some(operation), Scripted::Fail(error));
    }

    /// Makes the next `times` mutating calls on `id` fail with `error`.
    pub fn fail_times(&self, id: &ResourceId, times: usize, error: &ProviderError) {
        for _ in 0..times {
            self.fail_next(id, error.clone());
        }
    }

    /// Makes the next mutating call on `id` panic.
    pub fn panic_next(&self, id: &ResourceId) {
        self.script(id, None, Scripted::Panic);
    }

    fn script(&self, id: &ResourceId, operation: Option<Operation>, scripted: Scripted) {
        self.lock()
            .scripts
            .entry(id.clone())
            .or_default()
            .push_back((operation, scripted));
    }

    /// Returns the stored outputs of a simulated object.
    #[must_use]
    pub fn object(&self, id: &ResourceId) -> Option<Outputs> {
        self.lock().objects.get(id).cloned()
    }

    /// Returns the number of simulated objects, superseded ones included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let state = self.lock();
        state.objects.len() + state.retired.len()
    }

    /// Returns true while an object with this physical id exists, superseded or not.
    #[must_use]
    pub fn holds(&self, physical_id: &str) -> bool {
        let state = self.lock();
        state.retired.contains_key(physical_id)
            || state
                .objects
                .values()
                .any(|object| matches!(object.get("id"), Some(Value::String(id)) if id == physical_id))
    }

    /// Stores or overwrites an object behind the engine's back.
    pub fn insert_object(&self, id: ResourceId, outputs: Outputs) {
        self.lock().objects.insert(id, outputs);
    }

    /// Removes an object behind the engine's back.
    pub fn remove_object(&self, id: &ResourceId) -> Option<Outputs> {
        self.lock().objects.remove(id)
    }

    /// Returns every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Counts calls of one kind against one resource.
    #[must_use]
    pub fn call_count(&self, operation: Operation, id: &ResourceId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation && call.resource == *id)
            .count()
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_active
    }

    /// Resources that saw two calls in flight at the same time.
    #[must_use]
    pub fn overlapping(&self) -> Vec<ResourceId> {
        self.lock().overlapping.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call, applies latency and plays any scripted outcome.
    #[allow(clippy::panic)]
    async fn enter(&self, operation: Operation, id: &ResourceId) -> ProviderResult<ActiveGuard<'_>> {
        let (latency, scripted) = {
            let mut state = self.lock();
            state.calls.push(ProviderCall {
                operation,
                resource: id.clone(),
            });
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            let count = state.active_ids.entry(id.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                state.overlapping.push(id.clone());
            }
            let scripted = if operation == Operation::Read {
                None
            } else {
                state.scripts.get_mut(id).and_then(|queue| {
                    let applies = queue
                        .front()
                        .is_some_and(|(only, _)| only.is_none_or(|only| only == operation));
                    if applies { queue.pop_front().map(|(_, scripted)| scripted) } else { None }
                })
            };
            (state.latency, scripted)
        };
        let guard = ActiveGuard {
            backend: self,
            id: id.clone(),
        };

        trace!("{operation} {id}");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match scripted {
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Panic) => panic!("scripted provider panic for {id}"),
            None => Ok(guard),
        }
    }
}

impl InMemoryProvider {
    /// Returns the backend this provider writes to.
    #[must_use]
    pub const fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }
}

impl fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("type", &self.descriptor.type_name)
            .finish_non_exhaustive()
    }
}

fn echo_outputs(properties: &PropertyMap, physical_id: Value) -> Outputs {
    let mut outputs = properties.clone();
    outputs.insert("id".to_string(), physical_id);
    outputs
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    async fn create(&self, id: &ResourceId, properties: &PropertyMap) -> ProviderResult<Outputs> {
        let _guard = self.backend.enter(Operation::Create, id).await?;
        let uuid = Uuid::new_v4().simple().to_string();
        let physical_id = format!("{}-{}", id.type_name, &uuid[..12]);
        let outputs = echo_outputs(properties, Value::String(physical_id));
        let mut state = self.backend.lock();
        if let Some(Value::String(previous)) = state
            .objects
            .insert(id.clone(), outputs.clone())
            .and_then(|mut previous| previous.remove("id"))
        {
            state.retired.insert(previous, id.clone());
        }
        Ok(outputs)
    }

    async fn read(&self, id: &ResourceId, _outputs: &Outputs) -> ProviderResult<Outputs> {
        let _guard = self.backend.enter(Operation::Read, id).await?;
        self.backend
            .object(id)
            .ok_or_else(|| ProviderError::not_found(format!("{id} does not exist")))
    }

    async fn update(
        &self,
        id: &ResourceId,
        _prior: &Outputs,
        properties: &PropertyMap,
    ) -> ProviderResult<Outputs> {
        let _guard = self.backend.enter(Operation::Update, id).await?;
        let mut state = self.backend.lock();
        let Some(existing) = state.objects.get_mut(id) else {
            return Err(ProviderError::not_found(format!("{id} does not exist")));
        };
        let physical_id = existing.get("id").cloned().unwrap_or(Value::Null);
        *existing = echo_outputs(properties, physical_id);
        Ok(existing.clone())
    }

    async fn delete(&self, id: &ResourceId, outputs: &Outputs) -> ProviderResult<()> {
        let _guard = self.backend.enter(Operation::Delete, id).await?;
        let mut state = self.backend.lock();
        let physical_id = outputs.get("id");

        if let Some(Value::String(physical)) = physical_id
            && state.retired.remove(physical).is_some()
        {
            return Ok(());
        }

        let current = state.objects.get(id).map(|object| object.get("id") == physical_id);
        match current {
            Some(true) => {
                state.objects.remove(id);
                Ok(())
            }
            Some(false) if physical_id.is_none() => {
                state.objects.remove(id);
                Ok(())
            }
            _ => Err(ProviderError::not_found(format!("{id} does not exist"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{op}")
    }
}
