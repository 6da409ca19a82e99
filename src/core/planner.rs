//! Diff a desired graph against the persisted snapshot.

use super::state::{snapshot_graph, StateSnapshot};
use super::types::*;
use crate::tripwire::hasher;
use rustc_hash::FxHashMap;

/// Partition of every reference touched by a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// Desired topological order
    pub to_create: Vec<ResourceRef>,
    /// Destroy-then-recreate, desired topological order
    pub to_update: Vec<ResourceRef>,
    /// Reverse topological order of the previous graph
    pub to_destroy: Vec<ResourceRef>,
    pub unchanged: Vec<ResourceRef>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_destroy.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Create,
    Update,
    Unchanged,
}

/// Content fingerprint of a resource: type, name, explicit dependencies and
/// attributes. The disabled flag and status do not contribute.
pub fn fingerprint(resource: &Resource) -> String {
    use serde_json::Value;

    let mut doc = serde_json::Map::new();
    doc.insert(
        "type".to_string(),
        Value::String(resource.resource_type.as_str().to_string()),
    );
    doc.insert("name".to_string(), Value::String(resource.name.clone()));
    doc.insert(
        "depends_on".to_string(),
        Value::Array(
            resource
                .depends_on
                .iter()
                .map(|d| Value::String(d.to_string()))
                .collect(),
        ),
    );
    doc.insert(
        "attributes".to_string(),
        Value::Object(
            resource
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    );
    hasher::hash_json(&Value::Object(doc))
}

/// Compute what an apply of `desired` over `previous` has to do.
pub fn diff(desired: &ResourceGraph, previous: &StateSnapshot) -> StateDiff {
    let previous_graph = snapshot_graph(previous);
    let mut classes: FxHashMap<ResourceRef, Class> = FxHashMap::default();
    let mut newly_disabled: Vec<ResourceRef> = Vec::new();

    for resource in desired.resources() {
        let id = resource.reference();
        let record = previous.resources.get(&id.to_string());
        let class = if resource.disabled {
            match record {
                // Previously enabled: torn down below.
                Some(r) if !r.disabled => {
                    newly_disabled.push(id);
                    continue;
                }
                _ => Class::Unchanged,
            }
        } else {
            match record {
                None => Class::Create,
                Some(r) if r.disabled => Class::Create,
                Some(r) if r.fingerprint != fingerprint(resource) => Class::Update,
                Some(r) if r.status == ResourceStatus::Created => Class::Unchanged,
                Some(_) => Class::Create,
            }
        };
        classes.insert(id, class);
    }

    // An updated or newly disabled resource is torn down, so everything built
    // on top of it in the previous graph has to come down first and be
    // recreated afterwards.
    let mut torn_down: Vec<ResourceRef> = classes
        .iter()
        .filter(|(_, c)| **c == Class::Update)
        .map(|(id, _)| id.clone())
        .collect();
    torn_down.extend(newly_disabled);
    for id in &torn_down {
        for dependent in previous_graph.transitive_dependents(id) {
            let previously_enabled = previous_graph
                .get(&dependent)
                .is_some_and(|r| !r.disabled);
            let still_enabled = desired.get(&dependent).is_some_and(|r| !r.disabled);
            if previously_enabled && still_enabled {
                classes.insert(dependent, Class::Update);
            }
        }
    }

    let mut result = StateDiff::default();
    for id in desired.order() {
        match classes.get(&id) {
            Some(Class::Create) => result.to_create.push(id),
            Some(Class::Update) => result.to_update.push(id),
            Some(Class::Unchanged) => result.unchanged.push(id),
            None => {}
        }
    }

    for id in previous_graph.order().into_iter().rev() {
        let gone = match desired.get(&id) {
            None => true,
            Some(r) => r.disabled && previous_graph.get(&id).is_some_and(|p| !p.disabled),
        };
        if gone {
            result.to_destroy.push(id);
        }
    }

    result
}

/// Dry-run plan: teardowns in reverse previous order, then every desired
/// resource in level order. No side effects.
pub fn plan(desired: &ResourceGraph, previous: &StateSnapshot) -> ExecutionPlan {
    let diff = diff(desired, previous);
    let mut changes = Vec::new();

    for id in &diff.to_destroy {
        changes.push(PlannedChange {
            reference: id.clone(),
            action: PlanAction::Destroy,
            description: format!("{}: destroy {}", id, id.handle()),
        });
    }

    let actions: FxHashMap<&ResourceRef, PlanAction> = diff
        .to_create
        .iter()
        .map(|id| (id, PlanAction::Create))
        .chain(diff.to_update.iter().map(|id| (id, PlanAction::Update)))
        .chain(diff.unchanged.iter().map(|id| (id, PlanAction::NoOp)))
        .collect();

    for id in desired.order() {
        let (Some(action), Some(resource)) = (actions.get(&id).copied(), desired.get(&id)) else {
            continue;
        };
        let description = describe_action(resource, action);
        changes.push(PlannedChange {
            reference: id,
            action,
            description,
        });
    }

    ExecutionPlan {
        changes,
        levels: desired.levels().to_vec(),
        to_create: count(&diff.to_create),
        to_update: count(&diff.to_update),
        to_destroy: count(&diff.to_destroy),
        unchanged: count(&diff.unchanged),
    }
}

fn count(ids: &[ResourceRef]) -> u32 {
    u32::try_from(ids.len()).unwrap_or(u32::MAX)
}

fn describe_action(resource: &Resource, action: PlanAction) -> String {
    let id = resource.reference();
    match action {
        PlanAction::Create if resource.resource_type.is_clustered() => format!(
            "{}: create {} with {} client node(s)",
            id,
            resource.handle(),
            resource.client_nodes()
        ),
        PlanAction::Create => format!("{}: create {}", id, resource.handle()),
        PlanAction::Update => format!("{}: recreate (definition changed)", id),
        PlanAction::Destroy => format!("{}: destroy {}", id, resource.handle()),
        PlanAction::NoOp if resource.disabled => format!("{}: disabled", id),
        PlanAction::NoOp => format!("{}: no changes", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::build_graph;
    use crate::core::state::ResourceRecord;
    use crate::providers::testing::{registry_with, RecordingProvider};

    fn r(s: &str) -> ResourceRef {
        ResourceRef::parse(s).unwrap()
    }

    fn graph(decls: &[Declaration]) -> ResourceGraph {
        build_graph(decls, &registry_with(RecordingProvider::new())).unwrap()
    }

    fn stack() -> Vec<Declaration> {
        vec![
            Declaration::new("network", "onprem"),
            Declaration::new("container", "consul")
                .with_dependency("network.onprem")
                .with_attribute("image", "consul:1.16"),
            Declaration::new("sidecar", "envoy")
                .with_dependency("container.consul")
                .with_attribute("image", "envoy:1.27"),
        ]
    }

    /// Snapshot as an apply of `graph` would have left it.
    fn snapshot_of(graph: &ResourceGraph, status: ResourceStatus) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for resource in graph.resources() {
            let id = resource.reference();
            snapshot.resources.insert(
                id.to_string(),
                ResourceRecord {
                    name: resource.name.clone(),
                    resource_type: resource.resource_type,
                    handle: resource.handle(),
                    status: if resource.disabled {
                        ResourceStatus::Disabled
                    } else {
                        status
                    },
                    disabled: resource.disabled,
                    depends_on: graph.dependencies(&id).to_vec(),
                    attributes: resource.attributes.clone(),
                    fingerprint: fingerprint(resource),
                    applied_at: None,
                },
            );
        }
        snapshot
    }

    #[test]
    fn test_fingerprint_deterministic_and_sensitive() {
        let g = graph(&stack());
        let consul = g.get(&r("container.consul")).unwrap();
        assert_eq!(fingerprint(consul), fingerprint(consul));

        let mut changed = consul.clone();
        changed
            .attributes
            .insert("image".to_string(), serde_json::json!("consul:1.17"));
        assert_ne!(fingerprint(consul), fingerprint(&changed));

        let mut disabled = consul.clone();
        disabled.disabled = true;
        disabled.status = ResourceStatus::Disabled;
        assert_eq!(fingerprint(consul), fingerprint(&disabled));
    }

    #[test]
    fn test_fingerprint_ignores_attribute_order() {
        let a = graph(&[Declaration::new("container", "c")
            .with_attribute("image", "x")
            .with_attribute("cmd", "y")]);
        let b = graph(&[Declaration::new("container", "c")
            .with_attribute("cmd", "y")
            .with_attribute("image", "x")]);
        let id = r("container.c");
        assert_eq!(
            fingerprint(a.get(&id).unwrap()),
            fingerprint(b.get(&id).unwrap())
        );
    }

    #[test]
    fn test_diff_empty_state_creates_everything() {
        let g = graph(&stack());
        let d = diff(&g, &StateSnapshot::default());
        assert_eq!(
            d.to_create,
            vec![r("network.onprem"), r("container.consul"), r("sidecar.envoy")]
        );
        assert!(d.to_update.is_empty());
        assert!(d.to_destroy.is_empty());
        assert!(d.unchanged.is_empty());
    }

    #[test]
    fn test_diff_converged_is_unchanged() {
        let g = graph(&stack());
        let d = diff(&g, &snapshot_of(&g, ResourceStatus::Created));
        assert!(d.is_empty());
        assert_eq!(d.unchanged.len(), 3);
    }

    #[test]
    fn test_diff_removed_resource_destroyed() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let after = graph(&stack()[..2]);
        let d = diff(&after, &snapshot);
        assert_eq!(d.to_destroy, vec![r("sidecar.envoy")]);
        assert!(d.to_create.is_empty());
        assert!(d.to_update.is_empty());
    }

    #[test]
    fn test_diff_destroy_order_is_reverse_dependency_order() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let d = diff(&graph(&[]), &snapshot);
        assert_eq!(
            d.to_destroy,
            vec![r("sidecar.envoy"), r("container.consul"), r("network.onprem")]
        );
    }

    #[test]
    fn test_diff_update_cascades_to_dependents() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let mut decls = stack();
        decls[1] = Declaration::new("container", "consul")
            .with_dependency("network.onprem")
            .with_attribute("image", "consul:1.17");
        let d = diff(&graph(&decls), &snapshot);
        assert_eq!(d.to_update, vec![r("container.consul"), r("sidecar.envoy")]);
        assert_eq!(d.unchanged, vec![r("network.onprem")]);
    }

    #[test]
    fn test_diff_failed_resource_is_retried() {
        let g = graph(&stack());
        let mut snapshot = snapshot_of(&g, ResourceStatus::Created);
        if let Some(record) = snapshot.resources.get_mut("container.consul") {
            record.status = ResourceStatus::Failed;
        }
        let d = diff(&g, &snapshot);
        assert_eq!(d.to_create, vec![r("container.consul")]);
        assert!(d.to_update.is_empty());
    }

    #[test]
    fn test_diff_newly_disabled_is_destroyed() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let mut decls = stack();
        decls[2] = decls[2].clone().disable();
        let after = graph(&decls);
        let d = diff(&after, &snapshot);
        assert_eq!(d.to_destroy, vec![r("sidecar.envoy")]);
        assert!(!d.unchanged.contains(&r("sidecar.envoy")));

        // Once recorded as disabled it stays unchanged.
        let d = diff(&after, &snapshot_of(&after, ResourceStatus::Created));
        assert!(d.is_empty());
        assert!(d.unchanged.contains(&r("sidecar.envoy")));
    }

    #[test]
    fn test_diff_disabling_dependency_recreates_dependents() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let mut decls = stack();
        decls[0] = decls[0].clone().disable();
        let d = diff(&graph(&decls), &snapshot);
        assert_eq!(d.to_destroy, vec![r("network.onprem")]);
        assert_eq!(d.to_update, vec![r("container.consul"), r("sidecar.envoy")]);
        assert!(d.unchanged.is_empty());
    }

    #[test]
    fn test_diff_interrupted_records_are_retried() {
        let g = graph(&stack());
        let mut snapshot = snapshot_of(&g, ResourceStatus::Created);
        if let Some(record) = snapshot.resources.get_mut("container.consul") {
            record.status = ResourceStatus::PendingCreation;
        }
        if let Some(record) = snapshot.resources.get_mut("sidecar.envoy") {
            record.status = ResourceStatus::PendingDestroy;
        }
        let d = diff(&g, &snapshot);
        assert_eq!(d.to_create, vec![r("container.consul"), r("sidecar.envoy")]);
        assert!(d.to_update.is_empty());
        assert!(d.to_destroy.is_empty());
        assert_eq!(d.unchanged, vec![r("network.onprem")]);
    }

    #[test]
    fn test_diff_reenabled_is_created() {
        let mut decls = stack();
        decls[2] = decls[2].clone().disable();
        let before = graph(&decls);
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let d = diff(&graph(&stack()), &snapshot);
        assert_eq!(d.to_create, vec![r("sidecar.envoy")]);
    }

    #[test]
    fn test_diff_new_disabled_resource_unchanged() {
        let g = graph(&[Declaration::new("container", "off").disable()]);
        let d = diff(&g, &StateSnapshot::default());
        assert!(d.is_empty());
        assert_eq!(d.unchanged, vec![r("container.off")]);
    }

    #[test]
    fn test_plan_preview() {
        let before = graph(&stack());
        let snapshot = snapshot_of(&before, ResourceStatus::Created);
        let mut decls = stack();
        decls.remove(2);
        decls.push(
            Declaration::new("nomad_cluster", "dev")
                .with_dependency("network.onprem")
                .with_attribute("client_nodes", 3),
        );
        let p = plan(&graph(&decls), &snapshot);
        assert_eq!(p.to_destroy, 1);
        assert_eq!(p.to_create, 1);
        assert_eq!(p.unchanged, 2);
        assert_eq!(p.to_update, 0);
        assert_eq!(p.changes[0].action, PlanAction::Destroy);
        assert_eq!(p.changes[0].reference, r("sidecar.envoy"));
        let nomad = p
            .changes
            .iter()
            .find(|c| c.reference == r("nomad_cluster.dev"))
            .unwrap();
        assert_eq!(nomad.action, PlanAction::Create);
        assert!(nomad.description.contains("3 client node(s)"));
        assert_eq!(p.levels.len(), 2);
    }

    #[test]
    fn test_describe_disabled_noop() {
        let g = graph(&[Declaration::new("container", "off").disable()]);
        let p = plan(&g, &StateSnapshot::default());
        assert_eq!(p.changes.len(), 1);
        assert_eq!(p.changes[0].action, PlanAction::NoOp);
        assert_eq!(p.changes[0].description, "container.off: disabled");
    }
}
