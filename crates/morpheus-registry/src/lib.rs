//! Durable registry of forests and their nodes.
//!
//! A single JSON file holds the whole registry. State lives in memory behind
//! an RW lock; every mutation rewrites the file atomically (serialise to a
//! sibling temp file, then rename) while the write lock is held.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use morpheus_proto::{Forest, ForestStatus, Node};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Current registry file schema version.
pub const REGISTRY_VERSION: u32 = 1;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("forest '{0}' is already registered")]
    DuplicateForest(String),

    #[error("forest '{0}' not found")]
    ForestNotFound(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// The registry file exists but does not parse. Treated as an invariant
    /// violation rather than an empty registry so that state is never
    /// silently discarded.
    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

// ─── Persisted shape ─────────────────────────────────────────────────────────

/// Root of the persisted document. Every key in `nodes` has a matching key in
/// `forests`; the reverse is not required (empty forests are legal).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryData {
    version: u32,
    forests: HashMap<String, Forest>,
    nodes: HashMap<String, Vec<Node>>,
    updated_at: DateTime<Utc>,
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            forests: HashMap::new(),
            nodes: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Process-local forest registry. A single RW lock guards the state; the
/// design does not support multiple processes mutating one registry file.
pub struct ForestRegistry {
    path: Option<PathBuf>,
    state: RwLock<RegistryData>,
}

impl ForestRegistry {
    /// Open the registry at `path`, loading existing state if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                RegistryError::Corrupt { path: path.clone(), source }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened forest registry");
        Ok(Self { path: Some(path), state: RwLock::new(data) })
    }

    /// A registry that never touches disk. Used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self { path: None, state: RwLock::new(RegistryData::default()) }
    }

    /// Register a new forest. The creation timestamp is assigned here.
    pub fn register_forest(&self, mut forest: Forest) -> RegistryResult<Forest> {
        let mut state = self.state.write();
        if state.forests.contains_key(&forest.id) {
            return Err(RegistryError::DuplicateForest(forest.id));
        }
        forest.created_at = Utc::now();
        state.forests.insert(forest.id.clone(), forest.clone());
        self.persist(&mut state)?;
        info!(forest_id = %forest.id, provider = %forest.provider, "registered forest");
        Ok(forest)
    }

    /// Register a node under its forest. The forest must already exist; node
    /// order within a forest is insertion order.
    pub fn register_node(&self, mut node: Node) -> RegistryResult<Node> {
        let mut state = self.state.write();
        if !state.forests.contains_key(&node.forest_id) {
            return Err(RegistryError::ForestNotFound(node.forest_id));
        }
        node.created_at = Utc::now();
        state
            .nodes
            .entry(node.forest_id.clone())
            .or_default()
            .push(node.clone());
        self.persist(&mut state)?;
        info!(node_id = %node.id, forest_id = %node.forest_id, "registered node");
        Ok(node)
    }

    pub fn get_forest(&self, forest_id: &str) -> RegistryResult<Forest> {
        self.state
            .read()
            .forests
            .get(forest_id)
            .cloned()
            .ok_or_else(|| RegistryError::ForestNotFound(forest_id.to_string()))
    }

    /// Nodes of a forest in insertion order. Empty for a forest without nodes.
    pub fn get_nodes(&self, forest_id: &str) -> RegistryResult<Vec<Node>> {
        let state = self.state.read();
        if !state.forests.contains_key(forest_id) {
            return Err(RegistryError::ForestNotFound(forest_id.to_string()));
        }
        Ok(state.nodes.get(forest_id).cloned().unwrap_or_default())
    }

    /// Replace a forest's metadata, preserving its original creation time.
    pub fn update_forest(&self, mut forest: Forest) -> RegistryResult<()> {
        let mut state = self.state.write();
        let existing = state
            .forests
            .get(&forest.id)
            .ok_or_else(|| RegistryError::ForestNotFound(forest.id.clone()))?;
        forest.created_at = existing.created_at;
        state.forests.insert(forest.id.clone(), forest);
        self.persist(&mut state)
    }

    pub fn update_forest_status(
        &self,
        forest_id: &str,
        status: ForestStatus,
    ) -> RegistryResult<()> {
        let mut state = self.state.write();
        let forest = state
            .forests
            .get_mut(forest_id)
            .ok_or_else(|| RegistryError::ForestNotFound(forest_id.to_string()))?;
        forest.status = status;
        self.persist(&mut state)
    }

    pub fn update_node_status(&self, node_id: &str, status: &str) -> RegistryResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .values_mut()
            .flat_map(|nodes| nodes.iter_mut())
            .find(|n| n.id == node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
        node.status = status.to_string();
        self.persist(&mut state)
    }

    /// Remove a forest and all of its nodes in one mutation.
    pub fn delete_forest(&self, forest_id: &str) -> RegistryResult<()> {
        let mut state = self.state.write();
        if state.forests.remove(forest_id).is_none() {
            return Err(RegistryError::ForestNotFound(forest_id.to_string()));
        }
        state.nodes.remove(forest_id);
        self.persist(&mut state)?;
        info!(forest_id, "deleted forest from registry");
        Ok(())
    }

    pub fn list_forests(&self) -> Vec<Forest> {
        self.state.read().forests.values().cloned().collect()
    }

    /// Serialise and atomically replace the registry file. Called with the
    /// write lock held so concurrent readers always observe a state that has
    /// reached disk.
    fn persist(&self, state: &mut RegistryData) -> RegistryResult<()> {
        state.updated_at = Utc::now();
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morpheus_proto::ForestStatus;

    fn forest(id: &str) -> Forest {
        Forest {
            id: id.to_string(),
            size: "small".to_string(),
            location: "nbg1".to_string(),
            provider: "hetzner".to_string(),
            status: ForestStatus::Provisioning,
            created_at: Utc::now(),
        }
    }

    fn node(id: &str, forest_id: &str) -> Node {
        Node {
            id: id.to_string(),
            forest_id: forest_id.to_string(),
            role: "worker".to_string(),
            ip: Some("10.0.0.2".parse().unwrap()),
            location: "nbg1".to_string(),
            status: "running".to_string(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_get() {
        let reg = ForestRegistry::in_memory();
        reg.register_forest(forest("f1")).expect("register");
        let f = reg.get_forest("f1").expect("get");
        assert_eq!(f.status, ForestStatus::Provisioning);
        assert!(reg.get_nodes("f1").expect("nodes").is_empty());
    }

    #[test]
    fn test_duplicate_forest_rejected() {
        let reg = ForestRegistry::in_memory();
        reg.register_forest(forest("f1")).expect("register");
        assert!(matches!(
            reg.register_forest(forest("f1")),
            Err(RegistryError::DuplicateForest(_))
        ));
    }

    #[test]
    fn test_node_requires_forest() {
        let reg = ForestRegistry::in_memory();
        assert!(matches!(
            reg.register_node(node("n1", "missing")),
            Err(RegistryError::ForestNotFound(_))
        ));
    }

    #[test]
    fn test_node_timestamp_not_before_forest() {
        let reg = ForestRegistry::in_memory();
        let f = reg.register_forest(forest("f1")).expect("register");
        let n = reg.register_node(node("n1", "f1")).expect("node");
        assert!(n.created_at >= f.created_at);
    }

    #[test]
    fn test_update_forest_preserves_created_at() {
        let reg = ForestRegistry::in_memory();
        let original = reg.register_forest(forest("f1")).expect("register");
        let mut updated = forest("f1");
        updated.location = "hel1".to_string();
        reg.update_forest(updated).expect("update");
        let f = reg.get_forest("f1").expect("get");
        assert_eq!(f.location, "hel1");
        assert_eq!(f.created_at, original.created_at);
    }

    #[test]
    fn test_update_forest_status() {
        let reg = ForestRegistry::in_memory();
        reg.register_forest(forest("f1")).expect("register");
        reg.update_forest_status("f1", ForestStatus::Active).expect("update");
        assert_eq!(reg.get_forest("f1").unwrap().status, ForestStatus::Active);
        assert!(matches!(
            reg.update_forest_status("ghost", ForestStatus::Failed),
            Err(RegistryError::ForestNotFound(_))
        ));
    }

    #[test]
    fn test_update_node_status_sentinel() {
        let reg = ForestRegistry::in_memory();
        reg.register_forest(forest("f1")).expect("register");
        assert!(matches!(
            reg.update_node_status("ghost", "stopped"),
            Err(RegistryError::NodeNotFound(_))
        ));
        reg.register_node(node("n1", "f1")).expect("node");
        reg.update_node_status("n1", "stopped").expect("update");
        assert_eq!(reg.get_nodes("f1").unwrap()[0].status, "stopped");
    }

    #[test]
    fn test_delete_forest_removes_nodes() {
        let reg = ForestRegistry::in_memory();
        reg.register_forest(forest("f1")).expect("register");
        reg.register_node(node("n1", "f1")).expect("node");
        reg.delete_forest("f1").expect("delete");
        assert!(matches!(
            reg.get_forest("f1"),
            Err(RegistryError::ForestNotFound(_))
        ));
        assert!(matches!(
            reg.get_nodes("f1"),
            Err(RegistryError::ForestNotFound(_))
        ));
    }

    #[test]
    fn test_reload_round_trip_preserves_state_and_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        {
            let reg = ForestRegistry::open(&path).expect("open");
            reg.register_forest(forest("f1")).expect("register");
            for i in 0..5 {
                reg.register_node(node(&format!("n{i}"), "f1")).expect("node");
            }
            reg.register_forest(forest("empty")).expect("register empty");
        }
        {
            let reg = ForestRegistry::open(&path).expect("reopen");
            let nodes = reg.get_nodes("f1").expect("nodes");
            let ids: Vec<_> = nodes.iter().map(|n| n.id.as_str()).collect();
            assert_eq!(ids, vec!["n0", "n1", "n2", "n3", "n4"]);
            assert!(reg.get_nodes("empty").expect("empty").is_empty());
            assert_eq!(reg.list_forests().len(), 2);
        }
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "not json at all").expect("write");
        assert!(matches!(
            ForestRegistry::open(&path),
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_persisted_shape_snake_case() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        let reg = ForestRegistry::open(&path).expect("open");
        reg.register_forest(forest("f1")).expect("register");
        let raw = std::fs::read_to_string(&path).expect("read");
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(doc["version"], 1);
        assert!(doc["forests"]["f1"]["created_at"].is_string());
        assert!(doc["updated_at"].is_string());
    }
}
