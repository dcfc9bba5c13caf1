//! Hypervisor-backed machine provider.
//!
//! VMs are pre-created on the Proxmox host; creation through this backend is
//! unsupported. Deletion is a graceful ACPI shutdown, not destruction.

use crate::error::{ProviderError, ProviderResult};
use crate::{labels_match, MachineProvider};
use async_trait::async_trait;
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use morpheus_proxmox::{ProxmoxClient, VmSummary, POLL_INTERVAL};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_WAIT: Duration = Duration::from_secs(120);

pub struct HypervisorProvider {
    client: Arc<ProxmoxClient>,
}

impl HypervisorProvider {
    pub fn new(client: Arc<ProxmoxClient>) -> Self {
        Self { client }
    }

    fn parse_vmid(id: &str) -> ProviderResult<u32> {
        id.parse()
            .map_err(|_| ProviderError::NotFound(id.to_string()))
    }

    fn to_server(&self, vm: &VmSummary, ips: &[IpAddr]) -> Server {
        Server {
            id: vm.vmid.to_string(),
            name: vm.name.clone().unwrap_or_else(|| vm.vmid.to_string()),
            ipv4: ips.iter().find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            }),
            ipv6: ips.iter().find_map(|ip| match ip {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            }),
            location: self.client.node().to_string(),
            state: ServerState::from_backend(&vm.status),
            labels: HashMap::new(),
            created: String::new(),
        }
    }
}

#[async_trait]
impl MachineProvider for HypervisorProvider {
    fn name(&self) -> &str {
        "proxmox"
    }

    async fn create_server(&self, _req: &CreateServerRequest) -> ProviderResult<Server> {
        Err(ProviderError::Unsupported("create_server"))
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Server> {
        let vmid = Self::parse_vmid(id)?;
        let vm = self
            .client
            .list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.vmid == vmid)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let ips = self.client.get_vm_ips(vmid).await?;
        Ok(self.to_server(&vm, &ips))
    }

    /// Graceful ACPI shutdown followed by a wait for the stopped state. The
    /// VM definition stays on the host.
    async fn delete_server(&self, id: &str) -> ProviderResult<()> {
        let vmid = Self::parse_vmid(id)?;
        let cancel = CancellationToken::new();
        info!(vmid, "shutting down hypervisor VM");
        let upid = self.client.shutdown_vm(vmid, SHUTDOWN_TIMEOUT, true).await?;
        self.client.wait_for_task(&cancel, &upid, POLL_INTERVAL).await?;
        self.client
            .wait_for_vm_status(&cancel, vmid, "stopped", POLL_INTERVAL, STOP_WAIT)
            .await?;
        Ok(())
    }

    /// Running inventory minus templates. Guest IPs are not resolved here;
    /// `get_server` reads them per VM on demand.
    async fn list_servers(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>> {
        let vms = self.client.list_vms().await?;
        Ok(vms
            .iter()
            .filter(|vm| vm.template == 0)
            .map(|vm| self.to_server(vm, &[]))
            .filter(|s| labels_match(&s.labels, label_filter))
            .collect())
    }
}
