//! Forest status reporting.
//!
//! Joins the registry's view of a forest with the backend's live state so a
//! caller can spot drift: nodes that died, disappeared, or changed address.
//! Presentation is left to the consumer.

use crate::ProvisionResult;
use morpheus_machine::{MachineProvider, ProviderError};
use morpheus_proto::{Forest, Node, ServerState};
use morpheus_registry::ForestRegistry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One node joined with its backend state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: Node,
    /// Live state; `Unknown` when the backend no longer knows the server.
    pub backend_state: ServerState,
    /// The server is gone from the backend entirely.
    pub missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestReport {
    pub forest: Forest,
    pub nodes: Vec<NodeReport>,
    /// Any node missing or not running.
    pub degraded: bool,
}

/// Build a report for one forest by asking the backend about every
/// registered node.
pub async fn forest_report(
    provider: &dyn MachineProvider,
    registry: &ForestRegistry,
    forest_id: &str,
) -> ProvisionResult<ForestReport> {
    let forest = registry.get_forest(forest_id)?;
    let nodes = registry.get_nodes(forest_id)?;

    let mut reports = Vec::with_capacity(nodes.len());
    for node in nodes {
        let (backend_state, missing) = match provider.get_server(&node.id).await {
            Ok(server) => (server.state, false),
            Err(ProviderError::NotFound(_)) => (ServerState::Unknown, true),
            Err(e) => return Err(e.into()),
        };
        debug!(node_id = %node.id, state = %backend_state, missing, "node state");
        reports.push(NodeReport { node, backend_state, missing });
    }

    let degraded = reports
        .iter()
        .any(|r| r.missing || r.backend_state != ServerState::Running);
    Ok(ForestReport { forest, nodes: reports, degraded })
}

/// Reports for every registered forest, in no particular order.
pub async fn all_forest_reports(
    provider: &dyn MachineProvider,
    registry: &ForestRegistry,
) -> ProvisionResult<Vec<ForestReport>> {
    let mut reports = Vec::new();
    for forest in registry.list_forests() {
        reports.push(forest_report(provider, registry, &forest.id).await?);
    }
    Ok(reports)
}
