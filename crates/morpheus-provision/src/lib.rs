//! Transactional forest provisioning.
//!
//! [`Provisioner::provision`] creates the requested number of servers one by
//! one, waits for each to run and accept SSH, and records them in the
//! registry. Any failure inside the loop rolls back every server created in
//! the call and removes the forest; the caller receives the original cause.

#![forbid(unsafe_code)]

pub mod readiness;
pub mod report;

pub use readiness::{classify, wait_for_ready, ProbePhase};
pub use report::{all_forest_reports, forest_report, ForestReport, NodeReport};

use morpheus_dns::{DnsProvider, RecordType};
use morpheus_machine::{MachineProvider, ProviderError};
use morpheus_proto::{
    node_count_for_size, CreateServerRequest, Forest, ForestStatus, Node, Server, ServerState,
    LABEL_FOREST_ID, LABEL_MANAGED_BY, LABEL_ROLE, MANAGED_BY,
};
use morpheus_registry::{ForestRegistry, RegistryError};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Image used when neither the request nor the configuration names one.
pub const DEFAULT_IMAGE: &str = "ubuntu-24.04";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("missing configuration: no {0} given and no default configured")]
    ConfigMissing(&'static str),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("server '{id}' reached running state without an ip address")]
    NoAddress { id: String },

    #[error("server at {addr} did not become reachable within {waited:?}")]
    ReadinessTimeout { addr: SocketAddr, waited: Duration },

    #[error("render user data: {0}")]
    UserData(#[source] anyhow::Error),

    #[error("provisioning cancelled")]
    Cancelled,
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub ssh_port: u16,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// Per-attempt TCP connect budget inside the readiness loop.
    pub connect_timeout: Duration,
    pub default_server_type: Option<String>,
    pub default_image: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            readiness_timeout: Duration::from_secs(300),
            readiness_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            default_server_type: None,
            default_image: None,
        }
    }
}

/// External collaborator producing per-node user data from a role-tagged
/// template. The default source yields none.
pub trait UserDataSource: Send + Sync {
    fn render(&self, forest_id: &str, role: &str, index: usize) -> anyhow::Result<Option<String>>;
}

pub struct NoUserData;

impl UserDataSource for NoUserData {
    fn render(&self, _: &str, _: &str, _: usize) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

// ─── Request ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub forest_id: String,
    /// Free-form size tag; small/medium/large hint 1/3/5 nodes.
    pub size: String,
    pub location: Option<String>,
    pub role: String,
    pub server_type: Option<String>,
    pub image: Option<String>,
}

// ─── Provisioner ─────────────────────────────────────────────────────────────

/// Optional DNS presence for provisioned nodes: every ready node gets an
/// address record `{server-name}` under `domain`.
struct DnsBinding {
    provider: Arc<dyn DnsProvider>,
    domain: String,
}

pub struct Provisioner {
    provider: Arc<dyn MachineProvider>,
    registry: Arc<ForestRegistry>,
    user_data: Arc<dyn UserDataSource>,
    dns: Option<DnsBinding>,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn MachineProvider>,
        registry: Arc<ForestRegistry>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            user_data: Arc::new(NoUserData),
            dns: None,
            config,
        }
    }

    pub fn with_user_data(mut self, user_data: Arc<dyn UserDataSource>) -> Self {
        self.user_data = user_data;
        self
    }

    /// Publish node address records under `domain` as nodes become ready.
    pub fn with_dns(mut self, provider: Arc<dyn DnsProvider>, domain: impl Into<String>) -> Self {
        self.dns = Some(DnsBinding { provider, domain: domain.into() });
        self
    }

    /// Single resolver for server type: request value, then the configured
    /// default, then failure.
    fn resolve_server_type(&self, req: &ProvisionRequest) -> ProvisionResult<String> {
        req.server_type
            .clone()
            .or_else(|| self.config.default_server_type.clone())
            .ok_or(ProvisionError::ConfigMissing("server_type"))
    }

    /// Single resolver for image: request value, configured default, then the
    /// hard default.
    fn resolve_image(&self, req: &ProvisionRequest) -> String {
        req.image
            .clone()
            .or_else(|| self.config.default_image.clone())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    /// Create a forest of N nodes. On failure every server created in this
    /// call is deleted (best-effort) and the forest is removed from the
    /// registry; the original cause is returned.
    pub async fn provision(
        &self,
        cancel: &CancellationToken,
        req: &ProvisionRequest,
    ) -> ProvisionResult<Forest> {
        let forest = self.registry.register_forest(Forest {
            id: req.forest_id.clone(),
            size: req.size.clone(),
            location: req.location.clone().unwrap_or_default(),
            provider: self.provider.name().to_string(),
            status: ForestStatus::Provisioning,
            created_at: chrono::Utc::now(),
        })?;

        let count = node_count_for_size(&req.size);
        info!(forest_id = %req.forest_id, size = %req.size, count, "provisioning forest");

        let mut created: Vec<Server> = Vec::with_capacity(count);
        match self.grow(cancel, req, count, &mut created).await {
            Ok(observed_location) => {
                let mut forest = forest;
                forest.status = ForestStatus::Active;
                if let Some(location) = observed_location {
                    forest.location = location;
                }
                if let Err(e) = self.registry.update_forest(forest.clone()) {
                    warn!(forest_id = %forest.id, error = %e, "forest provisioned but status update failed");
                }
                info!(forest_id = %forest.id, nodes = created.len(), "forest active");
                Ok(forest)
            }
            Err(cause) => {
                warn!(forest_id = %req.forest_id, error = %cause, "provisioning failed, rolling back");
                self.rollback(&req.forest_id, &created).await;
                Err(cause)
            }
        }
    }

    /// The per-node loop. Pushes each accepted server onto `created` before
    /// anything can fail for it, so rollback always sees the full set.
    async fn grow(
        &self,
        cancel: &CancellationToken,
        req: &ProvisionRequest,
        count: usize,
        created: &mut Vec<Server>,
    ) -> ProvisionResult<Option<String>> {
        let server_type = self.resolve_server_type(req)?;
        let image = self.resolve_image(req);
        let mut observed_location = None;

        for index in 0..count {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }

            let user_data = self
                .user_data
                .render(&req.forest_id, &req.role, index)
                .map_err(ProvisionError::UserData)?;

            let mut labels = HashMap::new();
            labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
            labels.insert(LABEL_FOREST_ID.to_string(), req.forest_id.clone());
            labels.insert(LABEL_ROLE.to_string(), req.role.clone());

            let create = CreateServerRequest {
                name: format!("{}-{}-{}", req.forest_id, req.role, index),
                server_type: server_type.clone(),
                image: image.clone(),
                location: req.location.clone(),
                ssh_keys: Vec::new(),
                user_data,
                labels,
                enable_ipv4: true,
            };

            info!(forest_id = %req.forest_id, name = %create.name, index, "creating node");
            let server = self.provider.create_server(&create).await?;
            created.push(server.clone());

            self.provider
                .wait_for_server(cancel, &server.id, ServerState::Running)
                .await?;

            // Re-read: addresses often only materialise once running.
            let server = self.provider.get_server(&server.id).await?;
            let ip = server
                .preferred_ip()
                .ok_or_else(|| ProvisionError::NoAddress { id: server.id.clone() })?;

            wait_for_ready(
                cancel,
                ip,
                self.config.ssh_port,
                self.config.readiness_timeout,
                self.config.readiness_interval,
                self.config.connect_timeout,
            )
            .await?;

            if observed_location.is_none() && !server.location.is_empty() {
                observed_location = Some(server.location.clone());
            }

            let mut metadata = HashMap::new();
            if let Some(dns) = &self.dns {
                metadata.insert("dns_name".to_string(), create.name.clone());
                self.publish_node_record(dns, &create.name, ip).await;
            }

            // The server exists and must not leak: a registry hiccup here is
            // a warning, not a rollback trigger.
            let node = Node {
                id: server.id.clone(),
                forest_id: req.forest_id.clone(),
                role: req.role.clone(),
                ip: Some(ip),
                location: server.location.clone(),
                status: "ready".to_string(),
                metadata,
                created_at: chrono::Utc::now(),
            };
            if let Err(e) = self.registry.register_node(node) {
                warn!(forest_id = %req.forest_id, server_id = %server.id, error = %e,
                    "node registration failed");
            }
        }
        Ok(observed_location)
    }

    /// Best-effort: a DNS failure never rolls a working server back.
    async fn publish_node_record(&self, dns: &DnsBinding, name: &str, ip: IpAddr) {
        let rtype = match ip {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::AAAA,
        };
        match dns
            .provider
            .create_record(&dns.domain, name, rtype, &ip.to_string(), None)
            .await
        {
            Ok(_) => info!(name, domain = %dns.domain, %ip, "published node record"),
            Err(e) => warn!(name, error = %e, "node record creation failed"),
        }
    }

    /// Best-effort removal of both address RRSets for a node name.
    async fn retract_node_record(&self, dns: &DnsBinding, name: &str) {
        for rtype in [RecordType::A, RecordType::AAAA] {
            if let Err(e) = dns.provider.delete_record(&dns.domain, name, rtype).await {
                warn!(name, %rtype, error = %e, "node record removal failed");
            }
        }
    }

    /// Best-effort: delete every server created in this call, then drop the
    /// forest from the registry.
    async fn rollback(&self, forest_id: &str, created: &[Server]) {
        for server in created {
            if let Err(e) = self.provider.delete_server(&server.id).await {
                warn!(server_id = %server.id, error = %e, "rollback delete failed");
            }
            if let Some(dns) = &self.dns {
                self.retract_node_record(dns, &server.name).await;
            }
        }
        match self.registry.delete_forest(forest_id) {
            Ok(()) | Err(RegistryError::ForestNotFound(_)) => {}
            Err(e) => warn!(forest_id, error = %e, "rollback registry cleanup failed"),
        }
        info!(forest_id, deleted = created.len(), "rollback complete");
    }

    /// Delete every node of a forest, continuing past individual failures,
    /// then the forest itself. Idempotent at the forest level.
    pub async fn teardown(&self, forest_id: &str) -> ProvisionResult<()> {
        let nodes = match self.registry.get_nodes(forest_id) {
            Ok(nodes) => nodes,
            Err(RegistryError::ForestNotFound(_)) => {
                info!(forest_id, "teardown of unknown forest, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        info!(forest_id, nodes = nodes.len(), "tearing down forest");
        for node in &nodes {
            if let Err(e) = self.provider.delete_server(&node.id).await {
                warn!(node_id = %node.id, error = %e, "node delete failed, continuing");
            }
            if let (Some(dns), Some(name)) = (&self.dns, node.metadata.get("dns_name")) {
                self.retract_node_record(dns, name).await;
            }
        }
        match self.registry.delete_forest(forest_id) {
            Ok(()) | Err(RegistryError::ForestNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morpheus_machine::NoopProvider;

    fn provisioner(config: ProvisionerConfig) -> Provisioner {
        Provisioner::new(
            Arc::new(NoopProvider),
            Arc::new(ForestRegistry::in_memory()),
            config,
        )
    }

    fn request(server_type: Option<&str>, image: Option<&str>) -> ProvisionRequest {
        ProvisionRequest {
            forest_id: "f1".to_string(),
            size: "small".to_string(),
            location: None,
            role: "worker".to_string(),
            server_type: server_type.map(str::to_string),
            image: image.map(str::to_string),
        }
    }

    #[test]
    fn test_server_type_resolution_order() {
        let p = provisioner(ProvisionerConfig {
            default_server_type: Some("cx22".to_string()),
            ..ProvisionerConfig::default()
        });
        assert_eq!(p.resolve_server_type(&request(Some("cx32"), None)).unwrap(), "cx32");
        assert_eq!(p.resolve_server_type(&request(None, None)).unwrap(), "cx22");

        let bare = provisioner(ProvisionerConfig::default());
        assert!(matches!(
            bare.resolve_server_type(&request(None, None)),
            Err(ProvisionError::ConfigMissing("server_type"))
        ));
    }

    #[test]
    fn test_image_resolution_has_hard_default() {
        let p = provisioner(ProvisionerConfig {
            default_image: Some("debian-12".to_string()),
            ..ProvisionerConfig::default()
        });
        assert_eq!(p.resolve_image(&request(None, Some("alpine"))), "alpine");
        assert_eq!(p.resolve_image(&request(None, None)), "debian-12");

        let bare = provisioner(ProvisionerConfig::default());
        assert_eq!(bare.resolve_image(&request(None, None)), DEFAULT_IMAGE);
    }

    #[tokio::test]
    async fn test_teardown_unknown_forest_is_ok() {
        let p = provisioner(ProvisionerConfig::default());
        p.teardown("never-existed").await.expect("idempotent teardown");
    }
}
