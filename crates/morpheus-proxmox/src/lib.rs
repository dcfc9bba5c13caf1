//! Proxmox VE REST client and asynchronous task poller.
//!
//! Speaks the `/api2/json` surface with `PVEAPIToken` authentication. Long
//! operations (start, stop, shutdown) return a UPID; [`ProxmoxClient::wait_for_task`]
//! polls the node-scoped task endpoint until the task leaves the running state.

#![forbid(unsafe_code)]

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll cadence for task and VM status waits.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// VM config keys with this prefix describe PCI passthrough devices.
const PCI_PASSTHROUGH_PREFIX: &str = "hostpci";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProxmoxError {
    #[error(
        "proxmox authentication failed ({status}): verify the API token id, secret, \
         and that the token has VM.Audit/VM.PowerMgmt privileges"
    )]
    AuthFailed {
        status: u16,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("proxmox api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed UPID '{0}'")]
    InvalidUpid(String),

    #[error("task {upid} failed: {exitstatus}")]
    TaskFailed { upid: String, exitstatus: String },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,
}

pub type ProxmoxResult<T> = Result<T, ProxmoxError>;

// ─── Wire types ──────────────────────────────────────────────────────────────

/// Every Proxmox response wraps its payload in `{ "data": … }`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PveNode {
    pub node: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: String,
    /// 1 for templates. Templates are not switchable machines.
    #[serde(default)]
    pub template: u8,
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
    pub uptime: Option<u64>,
    pub cpus: Option<f64>,
    pub maxmem: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// A task succeeded iff it stopped with exit status "OK".
    pub fn succeeded(&self) -> bool {
        self.status == "stopped" && self.exitstatus.as_deref() == Some("OK")
    }
}

// ─── UPID ────────────────────────────────────────────────────────────────────

/// Opaque task identifier. The executing node is encoded as the second
/// colon-delimited segment: `UPID:{node}:{pid}:{pstart}:{starttime}:{type}:{id}:{user}:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upid {
    raw: String,
    node: String,
}

impl Upid {
    pub fn parse(raw: &str) -> ProxmoxResult<Self> {
        let mut parts = raw.split(':');
        if parts.next() != Some("UPID") {
            return Err(ProxmoxError::InvalidUpid(raw.to_string()));
        }
        let node = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProxmoxError::InvalidUpid(raw.to_string()))?;
        Ok(Self { raw: raw.to_string(), node: node.to_string() })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for Upid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// Base URL including scheme and port, e.g. `https://pve.lan:8006`.
    pub base_url: String,
    /// Token id in `user@realm!name` form.
    pub token_id: String,
    pub token_secret: String,
    /// Node that owns the managed VMs.
    pub node: String,
    /// Accept self-signed TLS certificates.
    pub insecure_tls: bool,
}

pub struct ProxmoxClient {
    base_url: String,
    auth_header: String,
    node: String,
    client: reqwest::Client,
}

impl ProxmoxClient {
    pub fn new(config: &ProxmoxConfig) -> ProxmoxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;
        Ok(Self {
            base_url: format!("{}/api2/json", config.base_url.trim_end_matches('/')),
            auth_header: auth_header(&config.token_id, &config.token_secret),
            node: config.node.clone(),
            client,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ProxmoxResult<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<Envelope<T>>().await?.data)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> ProxmoxResult<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", &self.auth_header)
            .form(form)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<Envelope<T>>().await?.data)
    }

    /// Cluster nodes. Doubles as the connectivity check.
    pub async fn list_nodes(&self) -> ProxmoxResult<Vec<PveNode>> {
        self.get_json("/nodes").await
    }

    pub async fn list_vms(&self) -> ProxmoxResult<Vec<VmSummary>> {
        self.get_json(&format!("/nodes/{}/qemu", self.node)).await
    }

    pub async fn get_vm_status(&self, vmid: u32) -> ProxmoxResult<VmStatus> {
        self.get_json(&format!("/nodes/{}/qemu/{vmid}/status/current", self.node))
            .await
    }

    /// Raw VM config as key/value pairs.
    pub async fn get_vm_config(
        &self,
        vmid: u32,
    ) -> ProxmoxResult<HashMap<String, serde_json::Value>> {
        self.get_json(&format!("/nodes/{}/qemu/{vmid}/config", self.node))
            .await
    }

    pub async fn start_vm(&self, vmid: u32) -> ProxmoxResult<Upid> {
        info!(vmid, "starting VM");
        let raw: String = self
            .post_form(&format!("/nodes/{}/qemu/{vmid}/status/start", self.node), &[])
            .await?;
        Upid::parse(&raw)
    }

    /// Immediate stop, no guest cooperation.
    pub async fn stop_vm(&self, vmid: u32) -> ProxmoxResult<Upid> {
        info!(vmid, "stopping VM");
        let raw: String = self
            .post_form(&format!("/nodes/{}/qemu/{vmid}/status/stop", self.node), &[])
            .await?;
        Upid::parse(&raw)
    }

    /// ACPI shutdown. With `force_stop`, the hypervisor hard-stops the VM once
    /// `timeout` elapses without the guest powering off.
    pub async fn shutdown_vm(
        &self,
        vmid: u32,
        timeout: Duration,
        force_stop: bool,
    ) -> ProxmoxResult<Upid> {
        info!(vmid, timeout_secs = timeout.as_secs(), force_stop, "shutting down VM");
        let mut form = vec![("timeout", timeout.as_secs().to_string())];
        if force_stop {
            form.push(("forceStop", "1".to_string()));
        }
        let raw: String = self
            .post_form(
                &format!("/nodes/{}/qemu/{vmid}/status/shutdown", self.node),
                &form,
            )
            .await?;
        Upid::parse(&raw)
    }

    /// Guest IP addresses via the QEMU guest agent. An unreachable or missing
    /// agent yields an empty list, not an error.
    pub async fn get_vm_ips(&self, vmid: u32) -> ProxmoxResult<Vec<IpAddr>> {
        let path = format!(
            "/nodes/{}/qemu/{vmid}/agent/network-get-interfaces",
            self.node
        );
        match self.get_json::<serde_json::Value>(&path).await {
            Ok(data) => Ok(parse_agent_interfaces(&data)),
            Err(ProxmoxError::Api { status, message }) => {
                debug!(vmid, status, %message, "guest agent unavailable");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Task status, queried on the node the UPID encodes.
    pub async fn get_task_status(&self, upid: &Upid) -> ProxmoxResult<TaskStatus> {
        let encoded = urlencode(upid.as_str());
        self.get_json(&format!("/nodes/{}/tasks/{encoded}/status", upid.node()))
            .await
    }

    /// Poll a task at `interval` until it stops running. Fails with
    /// [`ProxmoxError::TaskFailed`] when the task finished unsuccessfully.
    pub async fn wait_for_task(
        &self,
        cancel: &CancellationToken,
        upid: &Upid,
        interval: Duration,
    ) -> ProxmoxResult<TaskStatus> {
        loop {
            if cancel.is_cancelled() {
                return Err(ProxmoxError::Cancelled);
            }
            let status = self.get_task_status(upid).await?;
            if !status.is_running() {
                if !status.succeeded() {
                    return Err(ProxmoxError::TaskFailed {
                        upid: upid.to_string(),
                        exitstatus: status.exitstatus.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                return Ok(status);
            }
            debug!(upid = %upid, "task still running");
            tokio::select! {
                () = cancel.cancelled() => return Err(ProxmoxError::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Poll VM status at `interval` until it reports `target` or `timeout` elapses.
    pub async fn wait_for_vm_status(
        &self,
        cancel: &CancellationToken,
        vmid: u32,
        target: &str,
        interval: Duration,
        timeout: Duration,
    ) -> ProxmoxResult<()> {
        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ProxmoxError::Cancelled);
            }
            let status = self.get_vm_status(vmid).await?;
            if status.status == target {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ProxmoxError::Timeout {
                    what: format!("VM {vmid} to reach {target}"),
                    waited: started.elapsed(),
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(ProxmoxError::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn auth_header(token_id: &str, secret: &str) -> String {
    format!("PVEAPIToken={token_id}={secret}")
}

async fn check_status(resp: reqwest::Response) -> ProxmoxResult<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProxmoxError::AuthFailed { status: status.as_u16(), source: None });
    }
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), %message, "proxmox api error");
        return Err(ProxmoxError::Api { status: status.as_u16(), message });
    }
    Ok(resp)
}

/// PCI passthrough entries (`hostpciN` keys) from a raw VM config, in key order.
pub fn pci_passthrough_devices(config: &HashMap<String, serde_json::Value>) -> Vec<String> {
    let mut entries: Vec<(&String, String)> = config
        .iter()
        .filter(|(k, _)| k.starts_with(PCI_PASSTHROUGH_PREFIX))
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, v)| v).collect()
}

/// Extract non-loopback addresses from a guest-agent
/// `network-get-interfaces` payload.
fn parse_agent_interfaces(data: &serde_json::Value) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    let Some(interfaces) = data["result"].as_array() else {
        return ips;
    };
    for iface in interfaces {
        if iface["name"].as_str() == Some("lo") {
            continue;
        }
        let Some(addrs) = iface["ip-addresses"].as_array() else {
            continue;
        };
        for addr in addrs {
            if let Some(ip) = addr["ip-address"].as_str()
                && let Ok(parsed) = ip.parse::<IpAddr>()
                && !parsed.is_loopback()
            {
                ips.push(parsed);
            }
        }
    }
    ips
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
