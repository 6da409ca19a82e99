//! Resource model: declarations, typed resources, graph, plan and run records.
//!
//! Declarations arrive from the parser collaborator with their type as text.
//! The resolver turns them into [`Resource`] records keyed by [`ResourceRef`]
//! and assembles a [`ResourceGraph`]. Everything that crosses a run boundary
//! derives Serialize/Deserialize.

use super::error::{FailureCause, RunFailure};
use super::naming;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Resource types
// ============================================================================

/// Closed set of resource kinds the engine knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Network,
    Container,
    Sidecar,
    ContainerIngress,
    Ingress,
    K8sCluster,
    K8sConfig,
    K8sIngress,
    Helm,
    NomadCluster,
    NomadJob,
    NomadIngress,
    ExecLocal,
    ExecRemote,
    ImageCache,
    Docs,
}

impl ResourceType {
    /// Every variant, in declaration order.
    pub const ALL: [ResourceType; 16] = [
        Self::Network,
        Self::Container,
        Self::Sidecar,
        Self::ContainerIngress,
        Self::Ingress,
        Self::K8sCluster,
        Self::K8sConfig,
        Self::K8sIngress,
        Self::Helm,
        Self::NomadCluster,
        Self::NomadJob,
        Self::NomadIngress,
        Self::ExecLocal,
        Self::ExecRemote,
        Self::ImageCache,
        Self::Docs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Container => "container",
            Self::Sidecar => "sidecar",
            Self::ContainerIngress => "container_ingress",
            Self::Ingress => "ingress",
            Self::K8sCluster => "k8s_cluster",
            Self::K8sConfig => "k8s_config",
            Self::K8sIngress => "k8s_ingress",
            Self::Helm => "helm",
            Self::NomadCluster => "nomad_cluster",
            Self::NomadJob => "nomad_job",
            Self::NomadIngress => "nomad_ingress",
            Self::ExecLocal => "exec_local",
            Self::ExecRemote => "exec_remote",
            Self::ImageCache => "image_cache",
            Self::Docs => "docs",
        }
    }

    /// Parse the textual type carried by a declaration.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Clustered types expand into a server unit plus indexed client units.
    pub fn is_clustered(self) -> bool {
        matches!(self, Self::K8sCluster | Self::NomadCluster)
    }

    /// Types that run a process whose output can be tailed.
    pub fn is_loggable(self) -> bool {
        matches!(
            self,
            Self::Container
                | Self::Sidecar
                | Self::ContainerIngress
                | Self::Ingress
                | Self::K8sCluster
                | Self::K8sIngress
                | Self::NomadCluster
                | Self::NomadIngress
                | Self::ImageCache
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Per-resource lifecycle status, driven only by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    PendingCreation,
    Created,
    Disabled,
    Failed,
    PendingDestroy,
    Destroyed,
}

impl ResourceStatus {
    /// A dependency in this status lets its dependents start.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Created | Self::Disabled)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingCreation => write!(f, "PENDING_CREATION"),
            Self::Created => write!(f, "CREATED"),
            Self::Disabled => write!(f, "DISABLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::PendingDestroy => write!(f, "PENDING_DESTROY"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Identity of a resource: its `(type, name)` pair, written `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub name: String,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
        }
    }

    /// Parse `type.name`. Returns None for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(ResourceType::parse(kind)?, name))
    }

    /// The deterministic external handle of this resource.
    pub fn handle(&self) -> String {
        naming::address(&self.name, self.resource_type)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl Serialize for ResourceRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid resource reference: {}", s)))
    }
}

// ============================================================================
// Declarations (parser boundary)
// ============================================================================

/// A resource declaration as handed over by the parser: syntactically
/// well-formed, not yet semantically validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Resource name
    pub name: String,

    /// Resource type as written in the source
    #[serde(rename = "type")]
    pub kind: String,

    /// Recorded but never provisioned
    #[serde(default)]
    pub disabled: bool,

    /// Explicit dependencies, `type.name`
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Type-specific attributes
    #[serde(default)]
    pub attributes: IndexMap<String, serde_json::Value>,
}

impl Declaration {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            disabled: false,
            depends_on: Vec::new(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_dependency(mut self, reference: &str) -> Self {
        self.depends_on.push(reference.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn disable(mut self) -> Self {
        self.disabled = true;
        self
    }
}

// ============================================================================
// Resources
// ============================================================================

/// A validated resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,
    pub resource_type: ResourceType,
    pub status: ResourceStatus,
    pub disabled: bool,

    /// Explicitly declared dependencies
    pub depends_on: Vec<ResourceRef>,

    pub attributes: IndexMap<String, serde_json::Value>,
}

impl Resource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type, self.name.clone())
    }

    pub fn handle(&self) -> String {
        naming::address(&self.name, self.resource_type)
    }

    /// Number of client nodes of a clustered resource (0 when absent).
    pub fn client_nodes(&self) -> u32 {
        self.attributes
            .get("client_nodes")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }
}

// ============================================================================
// Graph
// ============================================================================

/// The validated resources, their resolved dependency edges and the level
/// partition used for scheduling.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: IndexMap<ResourceRef, Resource>,
    dependencies: IndexMap<ResourceRef, Vec<ResourceRef>>,
    levels: Vec<Vec<ResourceRef>>,
}

impl ResourceGraph {
    /// Assemble a graph. Callers guarantee every edge endpoint is a key of
    /// `resources` and that `levels` partitions the keys.
    pub(crate) fn from_parts(
        resources: IndexMap<ResourceRef, Resource>,
        dependencies: IndexMap<ResourceRef, Vec<ResourceRef>>,
        levels: Vec<Vec<ResourceRef>>,
    ) -> Self {
        Self {
            resources,
            dependencies,
            levels,
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.resources.contains_key(reference)
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&Resource> {
        self.resources.get(reference)
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Explicit and implicit dependencies of a resource.
    pub fn dependencies(&self, reference: &ResourceRef) -> &[ResourceRef] {
        self.dependencies
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resources that depend directly on `reference`.
    pub fn dependents(&self, reference: &ResourceRef) -> Vec<ResourceRef> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(reference))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every resource that depends on `reference`, directly or not.
    pub fn transitive_dependents(&self, reference: &ResourceRef) -> FxHashSet<ResourceRef> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![reference.clone()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(&current) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Level partition: every resource's dependencies sit in lower levels.
    pub fn levels(&self) -> &[Vec<ResourceRef>] {
        &self.levels
    }

    /// Topological order, levels flattened.
    pub fn order(&self) -> Vec<ResourceRef> {
        self.levels.iter().flatten().cloned().collect()
    }

    pub fn set_status(&mut self, reference: &ResourceRef, status: ResourceStatus) {
        if let Some(resource) = self.resources.get_mut(reference) {
            resource.status = status;
        }
    }

    /// Handles of every addressable unit, disabled resources excluded.
    pub fn addressable(&self) -> Vec<String> {
        naming::list_addressable(self.resources.values())
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub reference: ResourceRef,
    pub action: PlanAction,
    /// Human-readable description
    pub description: String,
}

/// Full execution plan: teardowns first, then the desired graph in order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub changes: Vec<PlannedChange>,

    /// Level partition of the desired graph
    pub levels: Vec<Vec<ResourceRef>>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

// ============================================================================
// Run journal events
// ============================================================================

/// Event appended to the JSONL run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        operation: Operation,
        drydock_version: String,
    },
    ResourceStarted {
        resource: String,
        operation: Operation,
    },
    ResourceCreated {
        resource: String,
        handle: String,
        duration_seconds: f64,
    },
    ResourceDestroyed {
        resource: String,
        duration_seconds: f64,
    },
    ResourceFailed {
        resource: String,
        operation: Operation,
        error: String,
    },
    ResourceSkipped {
        resource: String,
        dependency: String,
    },
    RunCompleted {
        run_id: String,
        created: u32,
        destroyed: u32,
        failed: u32,
        interrupted: bool,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

// ============================================================================
// Run results
// ============================================================================

/// Provider operation a scheduler step performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Create,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Create => write!(f, "create"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// What happened to one resource during a run.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub reference: ResourceRef,
    pub operation: Operation,
    /// Terminal status for this step: Created, Destroyed or Failed
    pub status: ResourceStatus,
    pub failure: Option<FailureCause>,
}

/// Result of one apply or destroy run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub outcomes: Vec<ResourceOutcome>,
    /// Resources left untouched because they already matched
    pub unchanged: u32,
    /// The run stopped early on an interrupt
    pub interrupted: bool,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            outcomes: Vec::new(),
            unchanged: 0,
            interrupted: false,
            total_duration: Duration::ZERO,
        }
    }

    fn count(&self, operation: Operation, status: ResourceStatus) -> u32 {
        let n = self
            .outcomes
            .iter()
            .filter(|o| o.operation == operation && o.status == status)
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    pub fn created(&self) -> u32 {
        self.count(Operation::Create, ResourceStatus::Created)
    }

    pub fn destroyed(&self) -> u32 {
        self.count(Operation::Destroy, ResourceStatus::Destroyed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.failure.is_some())
    }

    pub fn failed(&self) -> u32 {
        u32::try_from(self.failures().count()).unwrap_or(u32::MAX)
    }

    /// Success only with zero failures and an uninterrupted run.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.interrupted
    }

    pub fn into_result(self) -> Result<RunReport, RunFailure> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RunFailure { report: self })
        }
    }
}
