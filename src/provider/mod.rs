//! Provider boundary.
//!
//! A provider performs the actual create, read, update and delete calls for one
//! resource type. The engine only talks to providers through the [`Provider`]
//! trait and looks them up by type name in a [`ProviderRegistry`].

mod local;
mod memory;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ProviderResult;
use crate::graph::{Outputs, PropertyMap, ResourceId};

pub use local::LocalProvider;
pub use memory::{InMemoryBackend, InMemoryProvider, Operation, ProviderCall};
pub use registry::ProviderRegistry;

/// Static description of a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Resource type name.
    pub type_name: String,
    /// Properties that cannot be changed in place.
    #[serde(default)]
    pub immutable: BTreeSet<String>,
    /// Whether a replacement may create the new object before deleting the old one.
    #[serde(default)]
    pub create_before_delete: bool,
}

impl TypeDescriptor {
    /// Creates a descriptor with every property mutable and delete-before-create replacement.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            immutable: BTreeSet::new(),
            create_before_delete: false,
        }
    }

    /// Marks properties as immutable.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Allows create-before-delete replacement.
    #[must_use]
    pub const fn with_create_before_delete(mut self, allowed: bool) -> Self {
        self.create_before_delete = allowed;
        self
    }

    /// Returns true if changing `key` forces a replacement.
    #[must_use]
    pub fn requires_replacement(&self, key: &str) -> bool {
        self.immutable.contains(key)
    }
}

/// Capability to manage remote objects of one resource type.
///
/// Every call returns outputs or a [`crate::error::ProviderError`] classified
/// as transient, permanent or not-found. Retrying is the executor's job.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Describes the resource type this provider manages.
    fn descriptor(&self) -> &TypeDescriptor;

    /// Creates the remote object and returns its outputs.
    async fn create(&self, id: &ResourceId, properties: &PropertyMap) -> ProviderResult<Outputs>;

    /// Reads the current outputs of an existing object.
    async fn read(&self, id: &ResourceId, outputs: &Outputs) -> ProviderResult<Outputs>;

    /// Updates an existing object in place.
    async fn update(
        &self,
        id: &ResourceId,
        prior: &Outputs,
        properties: &PropertyMap,
    ) -> ProviderResult<Outputs>;

    /// Deletes an existing object.
    async fn delete(&self, id: &ResourceId, outputs: &Outputs) -> ProviderResult<()>;
}
