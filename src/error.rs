//! Error types for the Keelson orchestration engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, graph building, planning, provider calls, apply and
//! snapshot management.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::ResourceId;

/// The main error type for the Keelson engine.
#[derive(Debug, Error)]
pub enum KeelsonError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Snapshot and state management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of an apply run.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    Validation {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing or malformed.
    #[error("Missing or invalid environment variable: {name}")]
    MissingEnvVar {
        /// Name of the variable.
        name: String,
    },

    /// A reference or `depends_on` entry names an undeclared resource.
    #[error("Resource '{resource}' refers to undeclared resource '{target}'")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// Name that could not be found.
        target: String,
    },
}

/// Errors raised while assembling the resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A resource with the same type and name was already added.
    #[error("Duplicate resource identity: {id}")]
    DuplicateIdentity {
        /// The duplicated identity.
        id: ResourceId,
    },

    /// A dependency endpoint does not exist in the graph.
    #[error("Unknown resource: {id}{}", referenced_by_suffix(.referenced_by.as_ref()))]
    UnknownResource {
        /// The missing identity.
        id: ResourceId,
        /// The resource that referenced it, if known.
        referenced_by: Option<ResourceId>,
    },

    /// The dependency relation contains a cycle.
    #[error("Dependency cycle detected: {}", join_path(.path))]
    CycleDetected {
        /// The cycle as a path of identities; the first and last entries match.
        path: Vec<ResourceId>,
    },
}

/// Failure classification returned by providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// A failure worth retrying (throttling, timeouts, eventual consistency).
    #[error("transient provider failure: {message}")]
    Transient {
        /// Provider message.
        message: String,
    },

    /// A failure that will not go away by retrying.
    #[error("permanent provider failure: {message}")]
    Permanent {
        /// Provider message.
        message: String,
    },

    /// The remote object does not exist.
    #[error("remote object not found: {message}")]
    NotFound {
        /// Provider message.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// The snapshot is unreadable or internally inconsistent.
    #[error("Snapshot is corrupt: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend IO failure.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// Snapshot format version mismatch.
    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected snapshot version.
        expected: String,
        /// Found snapshot version.
        found: String,
    },
}

/// Planning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{type_name}'")]
    UnknownResourceType {
        /// The unregistered type.
        type_name: String,
    },

    /// Two changes in the plan contradict each other.
    #[error("Conflicting changes in plan: {message}")]
    ConflictingChanges {
        /// Description of the conflict.
        message: String,
    },
}

/// Reasons a single change failed during apply, plus run-level apply failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The provider classified the failure as permanent.
    #[error("{resource}: {message}")]
    Permanent {
        /// Resource whose change failed.
        resource: ResourceId,
        /// Provider message.
        message: String,
    },

    /// Transient failures persisted past the attempt limit.
    #[error("{resource}: gave up after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Resource whose change failed.
        resource: ResourceId,
        /// Number of attempts made.
        attempts: u32,
        /// Last provider message.
        message: String,
    },

    /// A reference could not be resolved when the change became ready.
    #[error("{resource}: output '{output}' of {target} is not available")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: ResourceId,
        /// Referenced resource.
        target: ResourceId,
        /// Referenced output key.
        output: String,
    },

    /// No provider is registered for the change's resource type.
    #[error("{resource}: no provider registered for type '{}'", .resource.type_name)]
    UnknownResourceType {
        /// Resource whose change failed.
        resource: ResourceId,
    },

    /// The provider task panicked.
    #[error("{resource}: provider task panicked")]
    TaskPanicked {
        /// Resource whose change failed.
        resource: ResourceId,
    },

    /// The run finished without converging every resource.
    #[error("{failed} failed, {skipped} skipped, {cancelled} cancelled")]
    Incomplete {
        /// Number of failed resources.
        failed: usize,
        /// Number of skipped resources.
        skipped: usize,
        /// Number of cancelled resources.
        cancelled: usize,
    },
}

/// Result type alias for Keelson operations.
pub type Result<T> = std::result::Result<T, KeelsonError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

fn join_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn referenced_by_suffix(referenced_by: Option<&ResourceId>) -> String {
    referenced_by.map_or_else(String::new, |from| format!(" (referenced by {from})"))
}

impl KeelsonError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. })
                | Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates a lock failure with the given message.
    #[must_use]
    pub fn lock_failed(message: impl Into<String>) -> Self {
        Self::LockFailed {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Creates a not-found failure.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Returns true if the failure should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the remote object is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the provider message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } | Self::NotFound { message } => {
                message
            }
        }
    }
}

impl ApplyError {
    /// Returns the resource the failure belongs to, if it is change-scoped.
    #[must_use]
    pub const fn resource(&self) -> Option<&ResourceId> {
        match self {
            Self::Permanent { resource, .. }
            | Self::RetriesExhausted { resource, .. }
            | Self::UnresolvedReference { resource, .. }
            | Self::UnknownResourceType { resource }
            | Self::TaskPanicked { resource } => Some(resource),
            Self::Incomplete { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = GraphError::CycleDetected {
            path: vec![
                ResourceId::new("vpc", "a"),
                ResourceId::new("subnet", "b"),
                ResourceId::new("vpc", "a"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: vpc::a -> subnet::b -> vpc::a"
        );
    }

    #[test]
    fn test_unknown_resource_display() {
        let err = GraphError::UnknownResource {
            id: ResourceId::new("vpc", "missing"),
            referenced_by: Some(ResourceId::new("subnet", "s1")),
        };
        assert_eq!(
            err.to_string(),
            "Unknown resource: vpc::missing (referenced by subnet::s1)"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(KeelsonError::from(ProviderError::transient("throttled")).is_retryable());
        assert!(!KeelsonError::from(ProviderError::permanent("bad request")).is_retryable());
        assert!(!KeelsonError::internal("boom").is_retryable());
        let locked = StateError::LockedByOther {
            holder: "ci-runner".to_string(),
            since: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(KeelsonError::from(locked).is_retryable());
    }
}
