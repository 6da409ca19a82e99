//! Persisted state: load, save (atomic), incremental record/forget.
//!
//! The state file is a JSON snapshot of the last reconciled graph keyed by
//! `type.name`. Unknown fields are ignored on load so newer writers do not
//! break older readers.

use super::config::EngineConfig;
use super::error::StateError;
use super::naming;
use super::planner;
use super::resolver;
use super::types::*;
use crate::tripwire::eventlog;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current state schema version.
pub const STATE_SCHEMA: &str = "1.0";

/// Snapshot of the last reconciled graph.
///
/// Records naming a resource type this build does not know are skipped on
/// load, and dependencies on such types are dropped, both with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawSnapshot")]
pub struct StateSnapshot {
    pub schema: String,

    /// Writer that produced the file
    #[serde(default)]
    pub generator: String,

    /// When the snapshot was last written
    #[serde(default)]
    pub generated_at: String,

    /// Per-resource records, keyed by `type.name`
    #[serde(default)]
    pub resources: IndexMap<String, ResourceRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            schema: STATE_SCHEMA.to_string(),
            generator: format!("drydock {}", env!("CARGO_PKG_VERSION")),
            generated_at: String::new(),
            resources: IndexMap::new(),
        }
    }
}

/// On-disk shape of a snapshot before records are decoded one by one.
#[derive(Deserialize)]
struct RawSnapshot {
    schema: String,
    #[serde(default)]
    generator: String,
    #[serde(default)]
    generated_at: String,
    #[serde(default)]
    resources: IndexMap<String, serde_json::Value>,
}

impl From<RawSnapshot> for StateSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let resources = raw
            .resources
            .into_iter()
            .filter_map(|(key, value)| decode_record(&key, value).map(|record| (key, record)))
            .collect();
        Self {
            schema: raw.schema,
            generator: raw.generator,
            generated_at: raw.generated_at,
            resources,
        }
    }
}

fn decode_record(key: &str, mut value: serde_json::Value) -> Option<ResourceRecord> {
    if let Some(deps) = value
        .get_mut("depends_on")
        .and_then(serde_json::Value::as_array_mut)
    {
        deps.retain(|dep| {
            let known = dep.as_str().and_then(ResourceRef::parse).is_some();
            if !known {
                tracing::warn!(record = key, dependency = %dep, "dropping unknown dependency from state");
            }
            known
        });
    }
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(record = key, error = %e, "skipping unreadable state record");
            None
        }
    }
}

/// One persisted resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,

    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// External handle
    pub handle: String,

    pub status: ResourceStatus,

    #[serde(default)]
    pub disabled: bool,

    /// Resolved dependencies (explicit and implicit), `type.name`
    #[serde(default)]
    pub depends_on: Vec<ResourceRef>,

    #[serde(default)]
    pub attributes: IndexMap<String, serde_json::Value>,

    /// Fingerprint of the declaration that produced this record
    #[serde(default)]
    pub fingerprint: String,

    #[serde(default)]
    pub applied_at: Option<String>,
}

impl ResourceRecord {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type, self.name.clone())
    }

    fn to_resource(&self) -> Resource {
        Resource {
            name: self.name.clone(),
            resource_type: self.resource_type,
            status: self.status,
            disabled: self.disabled,
            depends_on: self.depends_on.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Load a snapshot. Returns None if the file doesn't exist.
pub fn load_snapshot(path: &Path) -> Result<Option<StateSnapshot>, StateError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot = serde_json::from_str(&content).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(snapshot))
}

/// Save a snapshot atomically (write to temp, then rename).
pub fn save_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let json = serde_json::to_string_pretty(snapshot)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|source| StateError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Rebuild the graph a snapshot describes. Dependencies on records that are
/// no longer present are dropped.
pub fn snapshot_graph(snapshot: &StateSnapshot) -> ResourceGraph {
    let mut resources = IndexMap::new();
    for record in snapshot.resources.values() {
        resources.insert(record.reference(), record.to_resource());
    }

    let mut dependencies = IndexMap::new();
    for (id, resource) in &resources {
        let deps: Vec<ResourceRef> = resource
            .depends_on
            .iter()
            .filter(|d| resources.contains_key(*d))
            .cloned()
            .collect();
        dependencies.insert(id.clone(), deps);
    }

    let levels = resolver::partition_levels(&dependencies);
    ResourceGraph::from_parts(resources, dependencies, levels)
}

/// The durable record of what exists between runs.
///
/// Mutated only by the scheduler's coordinating task; every transition is
/// followed by [`StateStore::save`].
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    snapshot: StateSnapshot,
}

impl StateStore {
    /// Open the store for a configuration, loading existing state if any.
    pub fn open(config: &EngineConfig) -> Result<Self, StateError> {
        Self::at(config.state_file())
    }

    /// Open the store at an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let snapshot = load_snapshot(&path)?.unwrap_or_default();
        tracing::debug!(
            path = %path.display(),
            resources = snapshot.resources.len(),
            "state loaded"
        );
        Ok(Self { path, snapshot })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.resources.is_empty()
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&ResourceRecord> {
        self.snapshot.resources.get(&reference.to_string())
    }

    /// The previously reconciled graph.
    pub fn graph(&self) -> ResourceGraph {
        snapshot_graph(&self.snapshot)
    }

    /// Insert or replace the record for `resource` with its current status.
    pub fn record(&mut self, resource: &Resource, dependencies: &[ResourceRef]) {
        let record = ResourceRecord {
            name: resource.name.clone(),
            resource_type: resource.resource_type,
            handle: resource.handle(),
            status: resource.status,
            disabled: resource.disabled,
            depends_on: dependencies.to_vec(),
            attributes: resource.attributes.clone(),
            fingerprint: planner::fingerprint(resource),
            applied_at: Some(eventlog::now_rfc3339()),
        };
        self.snapshot
            .resources
            .insert(resource.reference().to_string(), record);
    }

    /// Update only the status of an existing record.
    pub fn set_status(&mut self, reference: &ResourceRef, status: ResourceStatus) {
        if let Some(record) = self.snapshot.resources.get_mut(&reference.to_string()) {
            record.status = status;
        }
    }

    /// Drop a record after a successful destroy.
    pub fn forget(&mut self, reference: &ResourceRef) -> Option<ResourceRecord> {
        self.snapshot.resources.shift_remove(&reference.to_string())
    }

    /// Write the snapshot to disk atomically.
    pub fn save(&mut self) -> Result<(), StateError> {
        self.snapshot.generated_at = eventlog::now_rfc3339();
        save_snapshot(&self.path, &self.snapshot)
    }

    /// Loggable handles of everything recorded, disabled excluded, clusters
    /// expanded server first.
    pub fn list_addressable(&self) -> Vec<String> {
        let resources: Vec<Resource> = self
            .snapshot
            .resources
            .values()
            .map(ResourceRecord::to_resource)
            .collect();
        naming::list_addressable(&resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(kind: ResourceType, name: &str, status: ResourceStatus) -> Resource {
        Resource {
            name: name.to_string(),
            resource_type: kind,
            status,
            disabled: status == ResourceStatus::Disabled,
            depends_on: vec![],
            attributes: IndexMap::new(),
        }
    }

    fn r(s: &str) -> ResourceRef {
        ResourceRef::parse(s).unwrap()
    }

    #[test]
    fn test_open_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        assert!(store.is_empty());
        assert!(store.graph().is_empty());
        assert_eq!(store.snapshot().schema, STATE_SCHEMA);
    }

    #[test]
    fn test_record_save_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(dir.path());
        let mut store = StateStore::open(&config).unwrap();
        store.record(
            &resource(ResourceType::Network, "onprem", ResourceStatus::Created),
            &[],
        );
        store.record(
            &resource(ResourceType::Container, "consul", ResourceStatus::Created),
            &[r("network.onprem")],
        );
        store.save().unwrap();

        let reloaded = StateStore::open(&config).unwrap();
        let record = reloaded.get(&r("container.consul")).unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert_eq!(record.handle, "consul.container.drydock.run");
        assert_eq!(record.depends_on, vec![r("network.onprem")]);
        assert!(record.fingerprint.starts_with("blake3:"));
        assert!(!reloaded.snapshot().generated_at.is_empty());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        store.save().unwrap();
        assert!(dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_forget_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        store.record(
            &resource(ResourceType::Network, "n", ResourceStatus::Created),
            &[],
        );
        assert!(store.forget(&r("network.n")).is_some());
        assert!(store.forget(&r("network.n")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        store.record(
            &resource(ResourceType::Network, "n", ResourceStatus::Created),
            &[],
        );
        store.set_status(&r("network.n"), ResourceStatus::Failed);
        assert_eq!(
            store.get(&r("network.n")).unwrap().status,
            ResourceStatus::Failed
        );
    }

    #[test]
    fn test_graph_from_snapshot_levels() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        store.record(
            &resource(ResourceType::Sidecar, "envoy", ResourceStatus::Created),
            &[r("container.consul")],
        );
        store.record(
            &resource(ResourceType::Container, "consul", ResourceStatus::Created),
            &[r("network.onprem"), r("network.gone")],
        );
        store.record(
            &resource(ResourceType::Network, "onprem", ResourceStatus::Created),
            &[],
        );
        let graph = store.graph();
        assert_eq!(
            graph.order(),
            vec![r("network.onprem"), r("container.consul"), r("sidecar.envoy")]
        );
        assert_eq!(graph.dependencies(&r("container.consul")), &[r("network.onprem")]);
    }

    #[test]
    fn test_unknown_fields_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let json = r#"{
  "schema": "1.0",
  "generator": "drydock 9.9.9",
  "generated_at": "2030-01-01T00:00:00Z",
  "future_top_level": {"a": 1},
  "resources": {
    "container.web": {
      "name": "web",
      "type": "container",
      "handle": "web.container.drydock.run",
      "status": "created",
      "labels": ["x"],
      "fingerprint": "blake3:00"
    }
  }
}"#;
        std::fs::write(&path, json).unwrap();
        let store = StateStore::at(&path).unwrap();
        let record = store.get(&r("container.web")).unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert!(!record.disabled);
        assert!(record.depends_on.is_empty());
    }

    #[test]
    fn test_records_of_unknown_types_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let json = r#"{
  "schema": "1.0",
  "resources": {
    "vm.builder": {
      "name": "builder",
      "type": "vm",
      "handle": "builder.vm.drydock.run",
      "status": "created"
    },
    "network.onprem": {
      "name": "onprem",
      "type": "network",
      "handle": "onprem.network.drydock.run",
      "status": "created"
    },
    "container.web": {
      "name": "web",
      "type": "container",
      "handle": "web.container.drydock.run",
      "status": "created",
      "depends_on": ["vm.builder", "network.onprem"]
    }
  }
}"#;
        std::fs::write(&path, json).unwrap();
        let store = StateStore::at(&path).unwrap();
        assert_eq!(store.snapshot().resources.len(), 2);
        assert!(!store.snapshot().resources.contains_key("vm.builder"));
        let web = store.get(&r("container.web")).unwrap();
        assert_eq!(web.depends_on, vec![r("network.onprem")]);
        assert_eq!(
            store.graph().order(),
            vec![r("network.onprem"), r("container.web")]
        );
    }

    #[test]
    fn test_corrupt_state_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StateStore::at(&path), Err(StateError::Parse { .. })));
    }

    #[test]
    fn test_list_addressable_from_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(&EngineConfig::new(dir.path())).unwrap();
        store.record(
            &resource(ResourceType::Network, "onprem", ResourceStatus::Created),
            &[],
        );
        let mut nomad = resource(ResourceType::NomadCluster, "dev", ResourceStatus::Created);
        nomad
            .attributes
            .insert("client_nodes".to_string(), serde_json::json!(2));
        store.record(&nomad, &[]);
        store.record(
            &resource(ResourceType::Container, "off", ResourceStatus::Disabled),
            &[],
        );
        assert_eq!(
            store.list_addressable(),
            vec![
                "server.dev.nomad_cluster.drydock.run",
                "1.client.dev.nomad_cluster.drydock.run",
                "2.client.dev.nomad_cluster.drydock.run",
            ]
        );
    }
}
