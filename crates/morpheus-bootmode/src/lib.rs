//! Boot-mode management for a single hypervisor host.
//!
//! A mode is a named VM configuration; at most one GPU-hungry mode runs at a
//! time. The manager derives the current mode from live VM states on every
//! call (there is no cached current-mode store), computes conflicts from GPU
//! exclusivity plus explicit conflict lists, and performs switches as a
//! graceful shutdown-then-start sequence against the hypervisor seam.

#![forbid(unsafe_code)]

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use morpheus_proxmox::{pci_passthrough_devices, ProxmoxClient, Upid, POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Mode model ──────────────────────────────────────────────────────────────

/// GPU access pattern a mode requires of the host GPU. Governs the conflict
/// model: `exclusive` tolerates no other GPU user, `shared` tolerates other
/// sharers, `none` is compatible with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    Exclusive,
    Shared,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Unknown,
}

impl ModeState {
    /// Paused counts as stopped for switching purposes.
    pub fn from_backend(status: &str) -> Self {
        match status {
            "running" => Self::Running,
            "stopped" | "paused" => Self::Stopped,
            "starting" => Self::Starting,
            "stopping" | "shutdown" => Self::Stopping,
            _ => Self::Unknown,
        }
    }
}

/// Static definition of one boot mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDefinition {
    pub name: String,
    pub description: String,
    /// Backing VM on the hypervisor.
    pub vm_id: u32,
    pub gpu: GpuMode,
    /// Mode names this one explicitly conflicts with. Symmetric for
    /// detection: if A lists B, switching to B while A runs also conflicts.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
}

/// A mode joined with the live state of its backing VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub description: String,
    pub vm_id: u32,
    pub gpu: GpuMode,
    pub conflicts_with: Vec<String>,
    pub state: ModeState,
    pub ips: Vec<IpAddr>,
    pub uptime: Option<Duration>,
}

/// Mode plus host inventory for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeInfo {
    pub mode: Mode,
    pub cpus: Option<f64>,
    pub memory_bytes: Option<u64>,
    /// Raw PCI passthrough entries of the backing VM.
    pub pci_devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Running mode that blocks the switch.
    pub mode: String,
    pub reason: String,
    /// Runnable alternatives, e.g. modes that leave the GPU alone.
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SwitchOptions {
    pub dry_run: bool,
    pub shutdown_timeout: Duration,
    pub startup_timeout: Duration,
    /// Read guest IPs after the switch; missing IPs are not fatal.
    pub wait_for_network: bool,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            wait_for_network: false,
        }
    }
}

/// Outcome of a switch attempt. Mid-sequence failures land here with
/// `success = false`; the host is left as-is (no automatic restore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchResult {
    pub from: Option<String>,
    pub to: String,
    pub success: bool,
    pub duration: Duration,
    pub ips: Vec<IpAddr>,
    /// Conflicts that were (or, for a dry run, would be) shut down.
    pub conflicts: Vec<Conflict>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("mode '{0}' not found")]
    ModeNotFound(String),

    #[error("mode '{0}' is already active")]
    AlreadyActive(String),

    #[error("duplicate mode name '{0}' in mode table")]
    DuplicateMode(String),

    #[error("mode table {path}: {message}")]
    InvalidTable { path: String, message: String },

    #[error(transparent)]
    Hypervisor(#[from] anyhow::Error),
}

pub type ModeResult<T> = Result<T, ModeError>;

/// Load a mode table from a JSON file (an array of mode definitions).
/// Duplicate names and empty tables are rejected here rather than at first
/// use.
pub fn load_mode_table(path: &std::path::Path) -> ModeResult<Vec<ModeDefinition>> {
    let content = std::fs::read_to_string(path).map_err(|e| ModeError::InvalidTable {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let modes: Vec<ModeDefinition> =
        serde_json::from_str(&content).map_err(|e| ModeError::InvalidTable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    if modes.is_empty() {
        return Err(ModeError::InvalidTable {
            path: path.display().to_string(),
            message: "no modes defined".to_string(),
        });
    }
    let mut seen = std::collections::HashSet::new();
    for mode in &modes {
        if !seen.insert(mode.name.as_str()) {
            return Err(ModeError::DuplicateMode(mode.name.clone()));
        }
    }
    Ok(modes)
}

// ─── Hypervisor seam ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VmView {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: String,
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct VmDetails {
    pub status: String,
    pub uptime: Option<u64>,
    pub cpus: Option<f64>,
    pub memory_bytes: Option<u64>,
}

/// The narrow hypervisor surface the manager needs. Implemented for the
/// Proxmox client; faked in tests.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<VmView>>;

    async fn vm_details(&self, vmid: u32) -> Result<VmDetails>;

    async fn vm_pci_devices(&self, vmid: u32) -> Result<Vec<String>>;

    /// Kick off a start; returns an opaque task handle.
    async fn start_vm(&self, vmid: u32) -> Result<String>;

    /// Kick off an ACPI shutdown with a hard-stop fallback after `timeout`.
    async fn shutdown_vm(&self, vmid: u32, timeout: Duration, force: bool) -> Result<String>;

    async fn wait_task(&self, cancel: &CancellationToken, task: &str) -> Result<()>;

    async fn wait_vm_state(
        &self,
        cancel: &CancellationToken,
        vmid: u32,
        target: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn vm_ips(&self, vmid: u32) -> Result<Vec<IpAddr>>;

    /// Connectivity check; returns a short host description.
    async fn ping(&self) -> Result<String>;
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn list_vms(&self) -> Result<Vec<VmView>> {
        let vms = ProxmoxClient::list_vms(self).await.context("list VMs")?;
        Ok(vms
            .into_iter()
            .filter(|vm| vm.template == 0)
            .map(|vm| VmView {
                vmid: vm.vmid,
                name: vm.name,
                status: vm.status,
                uptime: vm.uptime,
            })
            .collect())
    }

    async fn vm_details(&self, vmid: u32) -> Result<VmDetails> {
        let status = self.get_vm_status(vmid).await.context("VM status")?;
        Ok(VmDetails {
            status: status.status,
            uptime: status.uptime,
            cpus: status.cpus,
            memory_bytes: status.maxmem,
        })
    }

    async fn vm_pci_devices(&self, vmid: u32) -> Result<Vec<String>> {
        let config = self.get_vm_config(vmid).await.context("VM config")?;
        Ok(pci_passthrough_devices(&config))
    }

    async fn start_vm(&self, vmid: u32) -> Result<String> {
        Ok(ProxmoxClient::start_vm(self, vmid)
            .await
            .context("start VM")?
            .to_string())
    }

    async fn shutdown_vm(&self, vmid: u32, timeout: Duration, force: bool) -> Result<String> {
        Ok(ProxmoxClient::shutdown_vm(self, vmid, timeout, force)
            .await
            .context("shutdown VM")?
            .to_string())
    }

    async fn wait_task(&self, cancel: &CancellationToken, task: &str) -> Result<()> {
        let upid = Upid::parse(task).context("parse task handle")?;
        self.wait_for_task(cancel, &upid, POLL_INTERVAL)
            .await
            .context("wait for task")?;
        Ok(())
    }

    async fn wait_vm_state(
        &self,
        cancel: &CancellationToken,
        vmid: u32,
        target: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.wait_for_vm_status(cancel, vmid, target, POLL_INTERVAL, timeout)
            .await
            .context("wait for VM state")?;
        Ok(())
    }

    async fn vm_ips(&self, vmid: u32) -> Result<Vec<IpAddr>> {
        ProxmoxClient::get_vm_ips(self, vmid).await.context("VM IPs")
    }

    async fn ping(&self) -> Result<String> {
        let nodes = self.list_nodes().await.context("list nodes")?;
        Ok(format!("{} node(s) reachable", nodes.len()))
    }
}

// ─── Conflict engine ─────────────────────────────────────────────────────────

/// Reason `running` blocks a switch to `target`, if it does.
///
/// Conflict iff (gpu(target)=exclusive ∧ gpu(running)≠none)
/// ∨ (gpu(target)=shared ∧ gpu(running)=exclusive)
/// ∨ either lists the other explicitly.
pub fn conflict_reason(target: &ModeDefinition, running: &ModeDefinition) -> Option<String> {
    match (target.gpu, running.gpu) {
        (GpuMode::Exclusive, r) if r != GpuMode::None => Some(format!(
            "'{}' needs exclusive GPU access but '{}' is using the GPU",
            target.name, running.name
        )),
        (GpuMode::Shared, GpuMode::Exclusive) => Some(format!(
            "'{}' holds the GPU exclusively",
            running.name
        )),
        _ if target.conflicts_with.iter().any(|n| n == &running.name)
            || running.conflicts_with.iter().any(|n| n == &target.name) =>
        {
            Some(format!(
                "'{}' and '{}' are declared mutually exclusive",
                target.name, running.name
            ))
        }
        _ => None,
    }
}

fn gpu_driven(target: &ModeDefinition, running: &ModeDefinition) -> bool {
    matches!(
        (target.gpu, running.gpu),
        (GpuMode::Exclusive, GpuMode::Exclusive)
            | (GpuMode::Exclusive, GpuMode::Shared)
            | (GpuMode::Shared, GpuMode::Exclusive)
    )
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct BootModeManager {
    hypervisor: Arc<dyn Hypervisor>,
    modes: Vec<ModeDefinition>,
}

impl BootModeManager {
    /// Mode names must be unique within the table.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, modes: Vec<ModeDefinition>) -> ModeResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for mode in &modes {
            if !seen.insert(mode.name.as_str()) {
                return Err(ModeError::DuplicateMode(mode.name.clone()));
            }
        }
        Ok(Self { hypervisor, modes })
    }

    pub fn definitions(&self) -> &[ModeDefinition] {
        &self.modes
    }

    fn definition(&self, name: &str) -> ModeResult<&ModeDefinition> {
        self.modes
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ModeError::ModeNotFound(name.to_string()))
    }

    /// Every defined mode joined with the live state of its backing VM. A
    /// mode whose VM is absent from the host reports `Unknown`.
    pub async fn list_modes(&self) -> ModeResult<Vec<Mode>> {
        let vms = self.hypervisor.list_vms().await?;
        Ok(self
            .modes
            .iter()
            .map(|def| {
                let vm = vms.iter().find(|vm| vm.vmid == def.vm_id);
                Mode {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    vm_id: def.vm_id,
                    gpu: def.gpu,
                    conflicts_with: def.conflicts_with.clone(),
                    state: vm
                        .map(|vm| ModeState::from_backend(&vm.status))
                        .unwrap_or(ModeState::Unknown),
                    ips: Vec::new(),
                    uptime: vm.and_then(|vm| vm.uptime).map(Duration::from_secs),
                }
            })
            .collect())
    }

    pub async fn get_mode(&self, name: &str) -> ModeResult<Mode> {
        self.definition(name)?;
        let mut mode = self
            .list_modes()
            .await?
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ModeError::ModeNotFound(name.to_string()))?;
        if mode.state == ModeState::Running {
            mode.ips = self.hypervisor.vm_ips(mode.vm_id).await.unwrap_or_default();
        }
        Ok(mode)
    }

    /// The single mode whose VM is running, in definition order. More than
    /// one running mode is a pre-existing violation; `check_conflicts`
    /// reports it, this accessor returns the first.
    pub async fn current_mode(&self) -> ModeResult<Option<Mode>> {
        Ok(self
            .list_modes()
            .await?
            .into_iter()
            .find(|m| m.state == ModeState::Running))
    }

    pub async fn mode_info(&self, name: &str) -> ModeResult<ModeInfo> {
        let mode = self.get_mode(name).await?;
        let details = self.hypervisor.vm_details(mode.vm_id).await?;
        let pci_devices = self.hypervisor.vm_pci_devices(mode.vm_id).await?;
        Ok(ModeInfo {
            mode,
            cpus: details.cpus,
            memory_bytes: details.memory_bytes,
            pci_devices,
        })
    }

    pub async fn ping(&self) -> ModeResult<String> {
        Ok(self.hypervisor.ping().await?)
    }

    /// Conflicts a switch to `target` would face right now.
    pub async fn check_conflicts(&self, target: &str) -> ModeResult<Vec<Conflict>> {
        let target_def = self.definition(target)?.clone();
        let running = self.running_definitions().await?;
        Ok(self.conflicts_for(&target_def, &running))
    }

    async fn running_definitions(&self) -> ModeResult<Vec<ModeDefinition>> {
        let modes = self.list_modes().await?;
        Ok(modes
            .into_iter()
            .filter(|m| m.state == ModeState::Running)
            .map(|m| ModeDefinition {
                name: m.name,
                description: m.description,
                vm_id: m.vm_id,
                gpu: m.gpu,
                conflicts_with: m.conflicts_with,
            })
            .collect())
    }

    fn conflicts_for(
        &self,
        target: &ModeDefinition,
        running: &[ModeDefinition],
    ) -> Vec<Conflict> {
        running
            .iter()
            .filter(|r| r.name != target.name)
            .filter_map(|r| {
                conflict_reason(target, r).map(|reason| Conflict {
                    mode: r.name.clone(),
                    reason,
                    suggestions: if gpu_driven(target, r) {
                        self.modes
                            .iter()
                            .filter(|m| m.gpu == GpuMode::None && m.name != target.name)
                            .map(|m| m.name.clone())
                            .collect()
                    } else {
                        Vec::new()
                    },
                })
            })
            .collect()
    }

    /// Switch the host to `target`.
    ///
    /// Pre-flight failures (unknown mode, already active) return an error.
    /// Failures mid-sequence land in the result with `success = false`; the
    /// manager does not restore the previous mode.
    pub async fn switch(
        &self,
        cancel: &CancellationToken,
        target: &str,
        options: &SwitchOptions,
    ) -> ModeResult<SwitchResult> {
        let started = std::time::Instant::now();
        let target_def = self.definition(target)?.clone();
        let running = self.running_definitions().await?;
        let current = running.first().map(|m| m.name.clone());

        if current.as_deref() == Some(target) {
            return Err(ModeError::AlreadyActive(target.to_string()));
        }

        let conflicts = self.conflicts_for(&target_def, &running);

        if options.dry_run {
            info!(target, conflicts = conflicts.len(), "dry-run switch");
            return Ok(SwitchResult {
                from: current,
                to: target.to_string(),
                success: true,
                duration: started.elapsed(),
                ips: Vec::new(),
                conflicts,
                error: None,
            });
        }

        info!(target, from = current.as_deref().unwrap_or("-"), "switching boot mode");
        let outcome = self
            .run_switch(cancel, &target_def, &running, &conflicts, options)
            .await;

        let (success, ips, error) = match outcome {
            Ok(ips) => (true, ips, None),
            Err(e) => {
                let reason = if cancel.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    format!("{e:#}")
                };
                warn!(target, %reason, "switch failed, host left as-is");
                (false, Vec::new(), Some(reason))
            }
        };

        let result = SwitchResult {
            from: current,
            to: target.to_string(),
            success,
            duration: started.elapsed(),
            ips,
            conflicts,
            error,
        };
        info!(
            from = result.from.as_deref().unwrap_or("-"),
            to = %result.to,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            "switch finished"
        );
        Ok(result)
    }

    async fn run_switch(
        &self,
        cancel: &CancellationToken,
        target: &ModeDefinition,
        running: &[ModeDefinition],
        conflicts: &[Conflict],
        options: &SwitchOptions,
    ) -> Result<Vec<IpAddr>> {
        // Stop every conflicting mode, then the current mode if it was not
        // already in the conflict set.
        for conflict in conflicts {
            let def = self.definition(&conflict.mode).map_err(anyhow::Error::new)?;
            self.shutdown_mode(cancel, def, options).await?;
        }
        if let Some(current) = running.first()
            && current.name != target.name
            && !conflicts.iter().any(|c| c.mode == current.name)
        {
            self.shutdown_mode(cancel, current, options).await?;
        }

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before start");
        }

        let task = self.hypervisor.start_vm(target.vm_id).await?;
        self.hypervisor.wait_task(cancel, &task).await?;
        self.hypervisor
            .wait_vm_state(cancel, target.vm_id, "running", options.startup_timeout)
            .await?;

        if options.wait_for_network {
            match self.hypervisor.vm_ips(target.vm_id).await {
                Ok(ips) => return Ok(ips),
                Err(e) => warn!(vm_id = target.vm_id, error = %e, "no guest IPs yet"),
            }
        }
        Ok(Vec::new())
    }

    async fn shutdown_mode(
        &self,
        cancel: &CancellationToken,
        def: &ModeDefinition,
        options: &SwitchOptions,
    ) -> Result<()> {
        info!(mode = %def.name, vm_id = def.vm_id, "shutting down conflicting mode");
        let task = self
            .hypervisor
            .shutdown_vm(def.vm_id, options.shutdown_timeout, true)
            .await?;
        self.hypervisor.wait_task(cancel, &task).await?;
        self.hypervisor
            .wait_vm_state(cancel, def.vm_id, "stopped", options.shutdown_timeout)
            .await?;
        Ok(())
    }
}
