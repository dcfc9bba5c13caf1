//! Guard provisioning: a self-contained isolated network with a WireGuard
//! gateway VM, plus peering of remote networks through it.
//!
//! The [`CloudNetwork`] trait is the seam to the cloud backend; the Azure ARM
//! implementation lives in [`azure`]. All created resources carry discovery
//! tags so a guard can be found and torn down later.

#![forbid(unsafe_code)]

pub mod azure;

pub use azure::{AzureNetwork, AzureNetworkConfig};

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

pub const TAG_MANAGED_BY: &str = "managed_by";
pub const TAG_GUARD_ID: &str = "guard_id";
pub const TAG_MESH_CIDRS: &str = "mesh_cidrs";
pub const TAG_WG_PORT: &str = "wg_port";

const DEFAULT_WG_PORT: u16 = 51820;
const DEFAULT_VNET_CIDR: &str = "10.250.0.0/24";

// ─── Cloud seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    pub name: String,
    /// "Tcp" or "Udp".
    pub protocol: String,
    pub port: u16,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub address_prefix: String,
    pub next_hop_ip: String,
}

/// Network-capable cloud operations the guard provisioner consumes.
/// Creation calls are idempotent PUT-style upserts on the backend.
#[async_trait]
pub trait CloudNetwork: Send + Sync {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn create_virtual_network(
        &self,
        group: &str,
        name: &str,
        location: &str,
        cidr: &str,
        subnet_name: &str,
        subnet_cidr: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    async fn create_security_group(
        &self,
        group: &str,
        name: &str,
        location: &str,
        rules: &[SecurityRule],
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    /// Returns the allocated static address.
    async fn create_public_ip(
        &self,
        group: &str,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    /// Returns the private address of the interface.
    #[allow(clippy::too_many_arguments)]
    async fn create_network_interface(
        &self,
        group: &str,
        name: &str,
        location: &str,
        vnet: &str,
        subnet: &str,
        security_group: &str,
        public_ip: &str,
        ip_forwarding: bool,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    #[allow(clippy::too_many_arguments)]
    async fn create_vm(
        &self,
        group: &str,
        name: &str,
        location: &str,
        nic: &str,
        vm_size: &str,
        admin_username: &str,
        ssh_public_key: &str,
        custom_data_b64: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    /// Cascades to every resource in the group.
    async fn delete_resource_group(&self, name: &str) -> Result<()>;

    async fn create_peering(
        &self,
        group: &str,
        vnet: &str,
        peering_name: &str,
        remote_vnet_id: &str,
    ) -> Result<()>;

    async fn create_route_table(
        &self,
        group: &str,
        name: &str,
        location: &str,
        routes: &[Route],
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    async fn associate_route_table(
        &self,
        group: &str,
        vnet: &str,
        subnet: &str,
        route_table: &str,
    ) -> Result<()>;

    /// Resource groups where `tag_key` equals `tag_value`, with their tags.
    /// Backs guard discovery.
    async fn list_resource_groups(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>>;

    /// Full backend id of a virtual network, for peering across groups.
    fn vnet_id(&self, group: &str, vnet: &str) -> String;
}

// ─── Guard model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GuardSpec {
    pub guard_id: String,
    pub location: String,
    /// CIDRs routed through the guard once peered.
    pub mesh_cidrs: Vec<String>,
    pub wg_port: u16,
    pub vnet_cidr: String,
    pub vm_size: String,
    pub admin_username: String,
    pub ssh_public_key: String,
    /// Raw provisioning script; base64-encoded before it reaches the backend.
    pub user_data: String,
}

impl GuardSpec {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            guard_id: uuid::Uuid::new_v4().to_string(),
            location: location.into(),
            mesh_cidrs: Vec::new(),
            wg_port: DEFAULT_WG_PORT,
            vnet_cidr: DEFAULT_VNET_CIDR.to_string(),
            vm_size: "Standard_B1s".to_string(),
            admin_username: "morpheus".to_string(),
            ssh_public_key: String::new(),
            user_data: String::new(),
        }
    }
}

/// Names of the resources backing one guard, all derived from its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardHandle {
    pub guard_id: String,
    pub resource_group: String,
    pub vnet: String,
    pub subnet: String,
    pub public_ip: String,
    pub private_ip: String,
}

/// A discovered guard, reconstructed from resource tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSummary {
    pub guard_id: String,
    pub resource_group: String,
    pub mesh_cidrs: Vec<String>,
    pub wg_port: u16,
}

pub fn resource_group_name(guard_id: &str) -> String {
    format!("morpheus-guard-{guard_id}")
}

/// Rebuild a guard summary from a tagged resource group; `None` when the
/// tags do not describe a guard.
fn summary_from_tags(group: &str, tags: &HashMap<String, String>) -> Option<GuardSummary> {
    let guard_id = tags.get(TAG_GUARD_ID)?.clone();
    let mesh_cidrs = tags
        .get(TAG_MESH_CIDRS)
        .map(|joined| {
            joined
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let wg_port = tags.get(TAG_WG_PORT)?.parse().ok()?;
    Some(GuardSummary {
        guard_id,
        resource_group: group.to_string(),
        mesh_cidrs,
        wg_port,
    })
}

fn guard_tags(spec: &GuardSpec) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    tags.insert(TAG_MANAGED_BY.to_string(), "morpheus".to_string());
    tags.insert(TAG_GUARD_ID.to_string(), spec.guard_id.clone());
    tags.insert(TAG_MESH_CIDRS.to_string(), spec.mesh_cidrs.join(","));
    tags.insert(TAG_WG_PORT.to_string(), spec.wg_port.to_string());
    tags
}

fn security_rules(wg_port: u16) -> Vec<SecurityRule> {
    vec![
        SecurityRule {
            name: "allow-ssh".to_string(),
            protocol: "Tcp".to_string(),
            port: 22,
            priority: 1000,
        },
        SecurityRule {
            name: "allow-wireguard".to_string(),
            protocol: "Udp".to_string(),
            port: wg_port,
            priority: 1010,
        },
    ]
}

// ─── Provisioner ─────────────────────────────────────────────────────────────

pub struct GuardProvisioner {
    network: std::sync::Arc<dyn CloudNetwork>,
}

impl GuardProvisioner {
    pub fn new(network: std::sync::Arc<dyn CloudNetwork>) -> Self {
        Self { network }
    }

    /// Create the isolated network and the gateway VM. Resource creation
    /// order follows the dependency chain: group → vnet → nsg → public IP →
    /// NIC → VM.
    pub async fn create_guard(&self, spec: &GuardSpec) -> Result<GuardHandle> {
        let group = resource_group_name(&spec.guard_id);
        let vnet = format!("{group}-vnet");
        let subnet = "guard".to_string();
        let nsg = format!("{group}-nsg");
        let pip = format!("{group}-pip");
        let nic = format!("{group}-nic");
        let vm = format!("{group}-vm");
        let tags = guard_tags(spec);

        info!(guard_id = %spec.guard_id, location = %spec.location, "creating guard");
        self.network
            .create_resource_group(&group, &spec.location, &tags)
            .await?;
        self.network
            .create_virtual_network(
                &group,
                &vnet,
                &spec.location,
                &spec.vnet_cidr,
                &subnet,
                &spec.vnet_cidr,
                &tags,
            )
            .await?;
        self.network
            .create_security_group(&group, &nsg, &spec.location, &security_rules(spec.wg_port), &tags)
            .await?;
        let public_ip = self
            .network
            .create_public_ip(&group, &pip, &spec.location, &tags)
            .await?;
        let private_ip = self
            .network
            .create_network_interface(
                &group,
                &nic,
                &spec.location,
                &vnet,
                &subnet,
                &nsg,
                &pip,
                true,
                &tags,
            )
            .await?;

        let custom_data = base64::engine::general_purpose::STANDARD.encode(&spec.user_data);
        self.network
            .create_vm(
                &group,
                &vm,
                &spec.location,
                &nic,
                &spec.vm_size,
                &spec.admin_username,
                &spec.ssh_public_key,
                &custom_data,
                &tags,
            )
            .await?;

        info!(guard_id = %spec.guard_id, %public_ip, %private_ip, "guard ready");
        Ok(GuardHandle {
            guard_id: spec.guard_id.clone(),
            resource_group: group,
            vnet,
            subnet,
            public_ip,
            private_ip,
        })
    }

    /// Every guard this tool manages, recovered from resource-group tags.
    pub async fn list_guards(&self) -> Result<Vec<GuardSummary>> {
        let groups = self
            .network
            .list_resource_groups(TAG_MANAGED_BY, "morpheus")
            .await?;
        Ok(groups
            .iter()
            .filter_map(|(name, tags)| summary_from_tags(name, tags))
            .collect())
    }

    /// Delete the guard's resource group; the backend cascades to every
    /// member resource.
    pub async fn teardown(&self, guard_id: &str) -> Result<()> {
        let group = resource_group_name(guard_id);
        info!(guard_id, %group, "tearing down guard");
        self.network.delete_resource_group(&group).await
    }

    /// Peer a remote network with the guard's network, bidirectionally, and
    /// point the mesh CIDRs on the remote subnet at the guard as next hop.
    pub async fn peer(
        &self,
        guard: &GuardHandle,
        remote_group: &str,
        remote_vnet: &str,
        remote_subnet: &str,
        location: &str,
        mesh_cidrs: &[String],
    ) -> Result<()> {
        let guard_vnet_id = self.network.vnet_id(&guard.resource_group, &guard.vnet);
        let remote_vnet_id = self.network.vnet_id(remote_group, remote_vnet);

        info!(guard_id = %guard.guard_id, remote_vnet, "peering networks");
        self.network
            .create_peering(
                &guard.resource_group,
                &guard.vnet,
                &format!("to-{remote_vnet}"),
                &remote_vnet_id,
            )
            .await?;
        self.network
            .create_peering(
                remote_group,
                remote_vnet,
                &format!("to-{}", guard.vnet),
                &guard_vnet_id,
            )
            .await?;

        let routes: Vec<Route> = mesh_cidrs
            .iter()
            .enumerate()
            .map(|(i, cidr)| Route {
                name: format!("mesh-{i}"),
                address_prefix: cidr.clone(),
                next_hop_ip: guard.private_ip.clone(),
            })
            .collect();
        let table = format!("{}-routes", guard.resource_group);
        let tags = HashMap::from([
            (TAG_MANAGED_BY.to_string(), "morpheus".to_string()),
            (TAG_GUARD_ID.to_string(), guard.guard_id.clone()),
        ]);
        self.network
            .create_route_table(remote_group, &table, location, &routes, &tags)
            .await?;
        self.network
            .associate_route_table(remote_group, remote_vnet, remote_subnet, &table)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every call so tests can assert ordering and tagging.
    #[derive(Default)]
    struct FakeNetwork {
        calls: Mutex<Vec<String>>,
        tags_seen: Mutex<Vec<HashMap<String, String>>>,
        groups: Mutex<Vec<(String, HashMap<String, String>)>>,
    }

    impl FakeNetwork {
        fn record(&self, call: &str, tags: Option<&HashMap<String, String>>) {
            self.calls.lock().push(call.to_string());
            if let Some(tags) = tags {
                self.tags_seen.lock().push(tags.clone());
            }
        }
    }

    #[async_trait]
    impl CloudNetwork for FakeNetwork {
        async fn create_resource_group(
            &self,
            name: &str,
            _location: &str,
            tags: &HashMap<String, String>,
        ) -> Result<()> {
            self.record(&format!("group:{name}"), Some(tags));
            self.groups.lock().push((name.to_string(), tags.clone()));
            Ok(())
        }

        async fn create_virtual_network(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            _cidr: &str,
            _subnet_name: &str,
            _subnet_cidr: &str,
            tags: &HashMap<String, String>,
        ) -> Result<()> {
            self.record(&format!("vnet:{name}"), Some(tags));
            Ok(())
        }

        async fn create_security_group(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            rules: &[SecurityRule],
            tags: &HashMap<String, String>,
        ) -> Result<()> {
            self.record(&format!("nsg:{name}:rules={}", rules.len()), Some(tags));
            Ok(())
        }

        async fn create_public_ip(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            tags: &HashMap<String, String>,
        ) -> Result<String> {
            self.record(&format!("pip:{name}"), Some(tags));
            Ok("203.0.113.10".to_string())
        }

        async fn create_network_interface(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            _vnet: &str,
            _subnet: &str,
            _security_group: &str,
            _public_ip: &str,
            ip_forwarding: bool,
            tags: &HashMap<String, String>,
        ) -> Result<String> {
            assert!(ip_forwarding, "guard NIC must forward");
            self.record(&format!("nic:{name}"), Some(tags));
            Ok("10.250.0.4".to_string())
        }

        async fn create_vm(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            _nic: &str,
            _vm_size: &str,
            _admin_username: &str,
            _ssh_public_key: &str,
            custom_data_b64: &str,
            tags: &HashMap<String, String>,
        ) -> Result<()> {
            assert!(base64::engine::general_purpose::STANDARD
                .decode(custom_data_b64)
                .is_ok());
            self.record(&format!("vm:{name}"), Some(tags));
            Ok(())
        }

        async fn delete_resource_group(&self, name: &str) -> Result<()> {
            self.record(&format!("delete:{name}"), None);
            Ok(())
        }

        async fn create_peering(
            &self,
            group: &str,
            vnet: &str,
            peering_name: &str,
            _remote_vnet_id: &str,
        ) -> Result<()> {
            self.record(&format!("peer:{group}/{vnet}/{peering_name}"), None);
            Ok(())
        }

        async fn create_route_table(
            &self,
            _group: &str,
            name: &str,
            _location: &str,
            routes: &[Route],
            _tags: &HashMap<String, String>,
        ) -> Result<()> {
            for route in routes {
                assert_eq!(route.next_hop_ip, "10.250.0.4");
            }
            self.record(&format!("routes:{name}:{}", routes.len()), None);
            Ok(())
        }

        async fn associate_route_table(
            &self,
            _group: &str,
            _vnet: &str,
            subnet: &str,
            route_table: &str,
        ) -> Result<()> {
            self.record(&format!("associate:{subnet}:{route_table}"), None);
            Ok(())
        }

        async fn list_resource_groups(
            &self,
            tag_key: &str,
            tag_value: &str,
        ) -> Result<Vec<(String, HashMap<String, String>)>> {
            Ok(self
                .groups
                .lock()
                .iter()
                .filter(|(_, tags)| tags.get(tag_key).map(String::as_str) == Some(tag_value))
                .cloned()
                .collect())
        }

        fn vnet_id(&self, group: &str, vnet: &str) -> String {
            format!("/fake/{group}/{vnet}")
        }
    }

    fn spec() -> GuardSpec {
        let mut spec = GuardSpec::new("westeurope");
        spec.guard_id = "g1".to_string();
        spec.mesh_cidrs = vec!["10.0.0.0/16".to_string(), "10.1.0.0/16".to_string()];
        spec.user_data = "#!/bin/sh\necho wg".to_string();
        spec
    }

    #[tokio::test]
    async fn test_create_guard_order_and_tags() {
        let network = Arc::new(FakeNetwork::default());
        let provisioner = GuardProvisioner::new(network.clone());

        let handle = provisioner.create_guard(&spec()).await.expect("create");
        assert_eq!(handle.resource_group, "morpheus-guard-g1");
        assert_eq!(handle.public_ip, "203.0.113.10");
        assert_eq!(handle.private_ip, "10.250.0.4");

        let calls = network.calls.lock().clone();
        let kinds: Vec<&str> = calls.iter().map(|c| c.split(':').next().unwrap()).collect();
        assert_eq!(kinds, vec!["group", "vnet", "nsg", "pip", "nic", "vm"]);

        for tags in network.tags_seen.lock().iter() {
            assert_eq!(tags[TAG_MANAGED_BY], "morpheus");
            assert_eq!(tags[TAG_GUARD_ID], "g1");
            assert_eq!(tags[TAG_MESH_CIDRS], "10.0.0.0/16,10.1.0.0/16");
            assert_eq!(tags[TAG_WG_PORT], "51820");
        }
    }

    #[tokio::test]
    async fn test_security_rules_cover_ssh_and_wireguard() {
        let rules = security_rules(51820);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.port == 22 && r.protocol == "Tcp"));
        assert!(rules.iter().any(|r| r.port == 51820 && r.protocol == "Udp"));
    }

    #[tokio::test]
    async fn test_guard_discovery_from_tags() {
        let network = Arc::new(FakeNetwork::default());
        let provisioner = GuardProvisioner::new(network.clone());
        provisioner.create_guard(&spec()).await.expect("create");

        let guards = provisioner.list_guards().await.expect("list");
        assert_eq!(guards.len(), 1);
        assert_eq!(guards[0].guard_id, "g1");
        assert_eq!(guards[0].resource_group, "morpheus-guard-g1");
        assert_eq!(guards[0].mesh_cidrs, ["10.0.0.0/16", "10.1.0.0/16"]);
        assert_eq!(guards[0].wg_port, 51820);
    }

    #[test]
    fn test_summary_ignores_untagged_groups() {
        let mut tags = HashMap::new();
        tags.insert("owner".to_string(), "someone-else".to_string());
        assert!(summary_from_tags("random-rg", &tags).is_none());
    }

    #[tokio::test]
    async fn test_teardown_deletes_group() {
        let network = Arc::new(FakeNetwork::default());
        let provisioner = GuardProvisioner::new(network.clone());
        provisioner.teardown("g1").await.expect("teardown");
        assert_eq!(network.calls.lock().as_slice(), ["delete:morpheus-guard-g1"]);
    }

    #[tokio::test]
    async fn test_peering_is_bidirectional_with_routes() {
        let network = Arc::new(FakeNetwork::default());
        let provisioner = GuardProvisioner::new(network.clone());
        let handle = provisioner.create_guard(&spec()).await.expect("create");
        network.calls.lock().clear();

        provisioner
            .peer(
                &handle,
                "app-rg",
                "app-vnet",
                "app-subnet",
                "westeurope",
                &["10.0.0.0/16".to_string()],
            )
            .await
            .expect("peer");

        let calls = network.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "peer:morpheus-guard-g1/morpheus-guard-g1-vnet/to-app-vnet",
                "peer:app-rg/app-vnet/to-morpheus-guard-g1-vnet",
                "routes:morpheus-guard-g1-routes:1",
                "associate:app-subnet:morpheus-guard-g1-routes",
            ]
        );
    }
}
