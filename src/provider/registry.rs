//! Provider lookup by resource type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PlanError, Result};

use super::{Provider, TypeDescriptor};

/// Maps resource type names to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Registered providers keyed by type name.
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its descriptor's type name, replacing any previous one.
    pub fn register(&mut self, provider: impl Provider + 'static) {
        self.register_arc(Arc::new(provider));
    }

    /// Registers a shared provider.
    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) {
        let type_name = provider.descriptor().type_name.clone();
        self.providers.insert(type_name, provider);
    }

    /// Gets the provider for a type.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownResourceType`] if nothing is registered.
    pub fn get(&self, type_name: &str) -> Result<Arc<dyn Provider>> {
        self.providers.get(type_name).cloned().ok_or_else(|| {
            PlanError::UnknownResourceType {
                type_name: type_name.to_string(),
            }
            .into()
        })
    }

    /// Gets the descriptor for a type.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownResourceType`] if nothing is registered.
    pub fn descriptor(&self, type_name: &str) -> Result<&TypeDescriptor> {
        self.providers
            .get(type_name)
            .map(|provider| provider.descriptor())
            .ok_or_else(|| {
                PlanError::UnknownResourceType {
                    type_name: type_name.to_string(),
                }
                .into()
            })
    }

    /// Returns true if a provider is registered for the type.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.providers.contains_key(type_name)
    }

    /// Returns registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelsonError;
    use crate::provider::InMemoryBackend;

    #[test]
    fn test_lookup() {
        let backend = InMemoryBackend::new();
        let mut registry = ProviderRegistry::new();
        registry.register(backend.provider(TypeDescriptor::new("vpc")));
        registry.register(backend.provider(TypeDescriptor::new("subnet")));

        assert!(registry.contains("vpc"));
        assert_eq!(registry.type_names(), vec!["subnet", "vpc"]);
        assert!(registry.get("vpc").is_ok());
        assert!(matches!(
            registry.descriptor("nat-gateway"),
            Err(KeelsonError::Plan(PlanError::UnknownResourceType { .. }))
        ));
    }
}
