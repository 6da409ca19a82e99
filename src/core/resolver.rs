//! Dependency graph construction.
//!
//! Validates declarations, resolves explicit `depends_on` references and
//! implicit references found in attribute values, rejects cycles (reporting
//! the full path) and partitions the DAG into levels. Level k holds every
//! resource whose dependencies all sit in levels below k; the scheduler runs
//! each level concurrently.

use super::error::{GraphError, InvalidResourceError};
use super::naming;
use super::types::*;
use crate::providers::ProviderRegistry;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};

/// Validate one declaration and turn it into a resource. Dependencies are
/// only checked for shape here; existence is checked by [`build_graph`].
pub fn validate_declaration(decl: &Declaration) -> Result<Resource, InvalidResourceError> {
    naming::validate_name(&decl.name).map_err(|source| InvalidResourceError::InvalidName {
        resource: decl.name.clone(),
        source,
    })?;

    let resource_type =
        ResourceType::parse(&decl.kind).ok_or_else(|| InvalidResourceError::UnknownType {
            name: decl.name.clone(),
            kind: decl.kind.clone(),
        })?;
    let id = format!("{}.{}", resource_type, decl.name);

    if let Some(nodes) = decl.attributes.get("client_nodes") {
        let valid = nodes.as_u64().is_some_and(|n| u32::try_from(n).is_ok());
        if !valid {
            return Err(InvalidResourceError::InvalidClientNodes(id));
        }
    }

    let mut depends_on = Vec::with_capacity(decl.depends_on.len());
    for reference in &decl.depends_on {
        let dep = ResourceRef::parse(reference).ok_or_else(|| {
            InvalidResourceError::MalformedReference {
                resource: id.clone(),
                reference: reference.clone(),
            }
        })?;
        if !depends_on.contains(&dep) {
            depends_on.push(dep);
        }
    }

    Ok(Resource {
        name: decl.name.clone(),
        resource_type,
        status: if decl.disabled {
            ResourceStatus::Disabled
        } else {
            ResourceStatus::PendingCreation
        },
        disabled: decl.disabled,
        depends_on,
        attributes: decl.attributes.clone(),
    })
}

/// Fail with `UnsupportedType` if an enabled resource has no provider.
pub fn ensure_supported<'a>(
    resources: impl IntoIterator<Item = &'a Resource>,
    registry: &ProviderRegistry,
) -> Result<(), GraphError> {
    for resource in resources {
        if !resource.disabled && !registry.supports(resource.resource_type) {
            return Err(GraphError::UnsupportedType {
                resource: resource.reference().to_string(),
                resource_type: resource.resource_type,
            });
        }
    }
    Ok(())
}

/// Build the resource graph from declarations.
///
/// Fails closed: any invalid declaration, unsupported type, unknown
/// reference or cycle rejects the whole set and returns no partial graph.
pub fn build_graph(
    declarations: &[Declaration],
    registry: &ProviderRegistry,
) -> Result<ResourceGraph, GraphError> {
    let mut resources: IndexMap<ResourceRef, Resource> = IndexMap::new();
    let mut handles: FxHashMap<String, ResourceRef> = FxHashMap::default();

    for decl in declarations {
        let resource = validate_declaration(decl)?;
        let id = resource.reference();
        if resources.contains_key(&id) {
            return Err(InvalidResourceError::Duplicate(id.to_string()).into());
        }
        let handle = resource.handle();
        if let Some(existing) = handles.get(&handle) {
            return Err(InvalidResourceError::HandleCollision {
                first: existing.to_string(),
                second: id.to_string(),
                handle,
            }
            .into());
        }
        handles.insert(handle, id.clone());
        resources.insert(id, resource);
    }

    ensure_supported(resources.values(), registry)?;

    let mut dependencies: IndexMap<ResourceRef, Vec<ResourceRef>> = IndexMap::new();
    for (id, resource) in &resources {
        let mut deps = Vec::new();
        for dep in &resource.depends_on {
            if !resources.contains_key(dep) {
                return Err(InvalidResourceError::UnknownDependency {
                    resource: id.to_string(),
                    dependency: dep.to_string(),
                }
                .into());
            }
            deps.push(dep.clone());
        }
        for dep in infer_implicit_references(resource, resources.keys()) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        dependencies.insert(id.clone(), deps);
    }

    if let Some(cycle) = find_cycle(&dependencies) {
        return Err(GraphError::CyclicDependency {
            cycle: cycle.iter().map(ToString::to_string).collect(),
        });
    }

    let levels = partition_levels(&dependencies);
    tracing::debug!(
        resources = resources.len(),
        levels = levels.len(),
        "resource graph built"
    );
    Ok(ResourceGraph::from_parts(resources, dependencies, levels))
}

// ============================================================================
// Implicit references
// ============================================================================

/// Scan a resource's attribute values for references to other resources.
///
/// A string value refers to a candidate when it equals the candidate's
/// `type.name` reference, or contains the candidate's handle at a label
/// boundary (so `1.client.db.nomad_cluster.drydock.run` refers to
/// `nomad_cluster.db`). Self references are ignored. Best-effort by nature.
pub fn infer_implicit_references<'a>(
    resource: &Resource,
    candidates: impl IntoIterator<Item = &'a ResourceRef>,
) -> Vec<ResourceRef> {
    let own = resource.reference();
    let mut strings = Vec::new();
    for value in resource.attributes.values() {
        collect_strings(value, &mut strings);
    }
    if strings.is_empty() {
        return Vec::new();
    }

    let mut found = Vec::new();
    for candidate in candidates {
        if *candidate == own {
            continue;
        }
        let reference = candidate.to_string();
        let handle = candidate.handle();
        let hit = strings
            .iter()
            .any(|s| *s == reference || contains_at_boundary(s, &handle));
        if hit {
            found.push(candidate.clone());
        }
    }
    found
}

fn collect_strings<'v>(value: &'v serde_json::Value, out: &mut Vec<&'v str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// True when `needle` occurs in `haystack` not glued to other label characters.
fn contains_at_boundary(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_label_char(c));
        let after_ok = haystack[start + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !is_label_char(c));
        before_ok && after_ok
    })
}

// ============================================================================
// Cycles and levels
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Depth-first search with recursion-stack tracking. Returns the first cycle
/// found as a closed path (`a, b, a`), or None for a DAG.
pub fn find_cycle(dependencies: &IndexMap<ResourceRef, Vec<ResourceRef>>) -> Option<Vec<ResourceRef>> {
    fn visit<'g>(
        node: &'g ResourceRef,
        dependencies: &'g IndexMap<ResourceRef, Vec<ResourceRef>>,
        marks: &mut FxHashMap<&'g ResourceRef, Mark>,
        stack: &mut Vec<&'g ResourceRef>,
    ) -> Option<Vec<ResourceRef>> {
        marks.insert(node, Mark::OnStack);
        stack.push(node);
        for dep in dependencies.get(node).into_iter().flatten() {
            match marks.get(dep) {
                Some(Mark::OnStack) => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<ResourceRef> =
                        stack[start..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(dep, dependencies, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks: FxHashMap<&ResourceRef, Mark> = FxHashMap::default();
    let mut stack = Vec::new();
    for node in dependencies.keys() {
        if marks.contains_key(node) {
            continue;
        }
        if let Some(cycle) = visit(node, dependencies, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Partition nodes into levels with Kahn's algorithm, one frontier at a
/// time. Each level is sorted for stable output. Edges to nodes outside the
/// map are ignored. Nodes left over by a cycle form one final level so that
/// a damaged state file can still be torn down.
pub fn partition_levels(
    dependencies: &IndexMap<ResourceRef, Vec<ResourceRef>>,
) -> Vec<Vec<ResourceRef>> {
    let mut in_degree: FxHashMap<&ResourceRef, usize> = FxHashMap::default();
    let mut dependents: FxHashMap<&ResourceRef, Vec<&ResourceRef>> = FxHashMap::default();

    for (id, deps) in dependencies {
        in_degree.entry(id).or_insert(0);
        for dep in deps {
            if dep == id || !dependencies.contains_key(dep) {
                continue;
            }
            *in_degree.entry(id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut frontier: Vec<&ResourceRef> = dependencies
        .keys()
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut placed: FxHashSet<&ResourceRef> = FxHashSet::default();
    let mut levels = Vec::new();

    while !frontier.is_empty() {
        frontier.sort();
        let mut next = Vec::new();
        for id in &frontier {
            placed.insert(*id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        levels.push(frontier.into_iter().cloned().collect());
        frontier = next;
    }

    let mut leftover: Vec<ResourceRef> = dependencies
        .keys()
        .filter(|id| !placed.contains(id))
        .cloned()
        .collect();
    if !leftover.is_empty() {
        leftover.sort();
        levels.push(leftover);
    }

    levels
}
