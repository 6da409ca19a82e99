//! Provider dispatch: capability trait and per-type lookup table.
//!
//! Providers are the only components that perform external I/O. The
//! scheduler resolves a resource's provider through [`ProviderRegistry`];
//! adding a resource type means registering one more entry.

use crate::core::error::{GraphError, ProviderError};
use crate::core::types::{Resource, ResourceStatus, ResourceType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Create, destroy and probe one kind of resource.
///
/// Calls must be safe to retry: `create` on an object that already exists
/// either succeeds or returns [`ProviderError::AlreadyExists`], `destroy` on
/// a missing object either succeeds or returns [`ProviderError::NotFound`].
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create(&self, resource: &Resource) -> Result<(), ProviderError>;

    async fn destroy(&self, resource: &Resource) -> Result<(), ProviderError>;

    /// Observe the external object's current status.
    async fn probe(&self, resource: &Resource) -> Result<ResourceStatus, ProviderError>;
}

/// Lookup table from resource type to provider.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceType, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider for a type.
    pub fn register(&mut self, resource_type: ResourceType, provider: Arc<dyn Provider>) {
        self.providers.insert(resource_type, provider);
    }

    pub fn with(mut self, resource_type: ResourceType, provider: Arc<dyn Provider>) -> Self {
        self.register(resource_type, provider);
        self
    }

    pub fn supports(&self, resource_type: ResourceType) -> bool {
        self.providers.contains_key(&resource_type)
    }

    /// Provider for `resource`, or `UnsupportedType`.
    pub fn get(&self, resource: &Resource) -> Result<Arc<dyn Provider>, GraphError> {
        self.providers
            .get(&resource.resource_type)
            .cloned()
            .ok_or_else(|| GraphError::UnsupportedType {
                resource: resource.reference().to_string(),
                resource_type: resource.resource_type,
            })
    }

    /// Registered types, in enum order.
    pub fn types(&self) -> Vec<ResourceType> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingProvider;
    use super::*;
    use indexmap::IndexMap;

    fn network(name: &str) -> Resource {
        Resource {
            name: name.to_string(),
            resource_type: ResourceType::Network,
            status: ResourceStatus::PendingCreation,
            disabled: false,
            depends_on: vec![],
            attributes: IndexMap::new(),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let provider = RecordingProvider::new();
        let registry = ProviderRegistry::new().with(ResourceType::Network, provider);
        assert!(registry.supports(ResourceType::Network));
        assert!(!registry.supports(ResourceType::Container));
        assert!(registry.get(&network("onprem")).is_ok());
        assert_eq!(registry.types(), vec![ResourceType::Network]);
    }

    #[test]
    fn test_registry_unknown_type_fails_fast() {
        let registry = ProviderRegistry::new();
        let err = registry.get(&network("onprem")).err().unwrap();
        assert_eq!(
            err,
            GraphError::UnsupportedType {
                resource: "network.onprem".to_string(),
                resource_type: ResourceType::Network,
            }
        );
    }

    #[tokio::test]
    async fn test_recording_provider_idempotence_signals() {
        let provider = RecordingProvider::new();
        let r = network("onprem");
        provider.create(&r).await.unwrap();
        assert!(matches!(
            provider.create(&r).await,
            Err(ProviderError::AlreadyExists(_))
        ));
        assert_eq!(provider.probe(&r).await.unwrap(), ResourceStatus::Created);
        provider.destroy(&r).await.unwrap();
        assert!(matches!(
            provider.destroy(&r).await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(
            provider.calls(),
            vec![
                "create:network.onprem",
                "create:network.onprem",
                "destroy:network.onprem",
                "destroy:network.onprem",
            ]
        );
    }
}
