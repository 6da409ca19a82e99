//! Drift detection: compare recorded state to what providers observe.

use crate::core::error::ProviderError;
use crate::core::state::StateStore;
use crate::core::types::{ResourceRef, ResourceStatus};
use crate::providers::ProviderRegistry;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub reference: ResourceRef,
    pub handle: String,
    pub expected: ResourceStatus,
    /// None when the probe itself failed
    pub observed: Option<ResourceStatus>,
    pub detail: String,
}

/// Probe every recorded `Created` resource and report those whose provider
/// sees something else. Probe failures are findings too.
pub async fn detect_drift(store: &StateStore, registry: &ProviderRegistry) -> Vec<DriftFinding> {
    let mut findings = Vec::new();
    let graph = store.graph();

    for resource in graph.resources() {
        if resource.disabled || resource.status != ResourceStatus::Created {
            continue;
        }
        let reference = resource.reference();
        let handle = resource.handle();

        let probed = match registry.get(resource) {
            Ok(provider) => provider.probe(resource).await,
            Err(e) => Err(ProviderError::Failed(e.to_string())),
        };

        let finding = match probed {
            Ok(ResourceStatus::Created) => None,
            Ok(observed) => Some(DriftFinding {
                detail: format!("{} is {}, expected CREATED", handle, observed),
                reference: reference.clone(),
                handle,
                expected: ResourceStatus::Created,
                observed: Some(observed),
            }),
            Err(e) => Some(DriftFinding {
                detail: format!("cannot probe {}: {}", handle, e),
                reference: reference.clone(),
                handle,
                expected: ResourceStatus::Created,
                observed: None,
            }),
        };

        if let Some(finding) = finding {
            tracing::warn!(resource = %reference, detail = %finding.detail, "drift detected");
            findings.push(finding);
        }
    }

    findings
}
