//! Shared domain types for the Morpheus orchestrator.
//!
//! Defines the server, forest, and node shapes exchanged between machine
//! backends, the provisioner, and the forest registry.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ─── Labels ──────────────────────────────────────────────────────────────────

/// Label key marking a resource as owned by this tool.
pub const LABEL_MANAGED_BY: &str = "managed_by";
/// Label value for [`LABEL_MANAGED_BY`].
pub const MANAGED_BY: &str = "morpheus";
/// Label key carrying the owning forest id.
pub const LABEL_FOREST_ID: &str = "forest_id";
/// Label key carrying the node role.
pub const LABEL_ROLE: &str = "role";

// ─── Server ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Running,
    Stopped,
    Deleting,
    #[default]
    Unknown,
}

impl ServerState {
    /// Map a backend status string onto the common state alphabet.
    pub fn from_backend(status: &str) -> Self {
        match status {
            "starting" | "initializing" | "provisioning" => Self::Starting,
            "running" => Self::Running,
            "off" | "stopped" | "exited" => Self::Stopped,
            "deleting" => Self::Deleting,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleting => write!(f, "deleting"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A backend server as observed at a point in time. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Backend-assigned opaque identifier.
    pub id: String,
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub location: String,
    pub state: ServerState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Backend creation timestamp, verbatim.
    pub created: String,
}

impl Server {
    /// The address used for reachability probes: IPv6 when present, else IPv4.
    pub fn preferred_ip(&self) -> Option<IpAddr> {
        self.ipv6
            .map(IpAddr::V6)
            .or_else(|| self.ipv4.map(IpAddr::V4))
    }
}

/// Request handed to a machine backend to create one server.
///
/// Creation returning does not imply reachability; callers follow with a
/// running-state wait and a protocol-level probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: Option<String>,
    /// Names or ids of SSH public keys already known to the backend.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub user_data: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// IPv6 is enabled unconditionally where the backend supports it.
    pub enable_ipv4: bool,
}

// ─── Forest & nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForestStatus {
    Provisioning,
    Active,
    Degraded,
    Failed,
}

impl std::fmt::Display for ForestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForestSize {
    Small,
    Medium,
    Large,
}

impl ForestSize {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    pub fn node_count(self) -> usize {
        match self {
            Self::Small => 1,
            Self::Medium => 3,
            Self::Large => 5,
        }
    }
}

/// Node count hinted by a free-form size tag. Unknown tags provision one node.
pub fn node_count_for_size(tag: &str) -> usize {
    ForestSize::parse(tag).map_or(1, ForestSize::node_count)
}

/// A named cluster of servers provisioned together. Persisted in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    pub id: String,
    /// Free-form size tag; hints the node count but is not re-derived.
    pub size: String,
    /// Location as observed on the backend; may differ from the requested one.
    pub location: String,
    pub provider: String,
    pub status: ForestStatus,
    pub created_at: DateTime<Utc>,
}

/// One backend server belonging to exactly one forest. Persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Equals the backend server id.
    pub id: String,
    pub forest_id: String,
    pub role: String,
    pub ip: Option<IpAddr>,
    pub location: String,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}
