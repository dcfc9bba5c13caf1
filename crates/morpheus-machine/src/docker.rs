//! Local container backend.
//!
//! Shells out to the `docker` binary. Containers live on a dedicated bridge
//! network provisioned on first use; the 12-character short container id is
//! the server id.

use crate::error::{ProviderError, ProviderResult};
use crate::{labels_match, MachineProvider};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info};

const DEFAULT_NETWORK: &str = "morpheus";
const SHORT_ID_LEN: usize = 12;

pub struct DockerProvider {
    binary: String,
    network: String,
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

impl DockerProvider {
    pub fn new(binary: impl Into<String>, network: impl Into<String>) -> Self {
        Self { binary: binary.into(), network: network.into() }
    }

    async fn run(&self, args: &[&str]) -> ProviderResult<String> {
        debug!(binary = %self.binary, ?args, "running container command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {}", self.binary))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Backend(anyhow!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create the private bridge network unless it already exists.
    async fn ensure_network(&self) -> ProviderResult<()> {
        if self
            .run(&["network", "inspect", &self.network])
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!(network = %self.network, "creating container bridge network");
        self.run(&["network", "create", &self.network]).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> ProviderResult<Server> {
        let raw = self
            .run(&["inspect", id])
            .await
            .map_err(|_| ProviderError::NotFound(id.to_string()))?;
        let docs: Vec<serde_json::Value> =
            serde_json::from_str(&raw).context("parse inspect output")?;
        let doc = docs
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        Ok(parse_inspect(&doc, &self.network))
    }
}

#[async_trait]
impl MachineProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_server(&self, req: &CreateServerRequest) -> ProviderResult<Server> {
        self.ensure_network().await?;

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            req.name.clone(),
            "--network".to_string(),
            self.network.clone(),
        ];
        for (k, v) in &req.labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(req.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(name = %req.name, image = %req.image, "creating container");
        let full_id = self.run(&arg_refs).await?;
        let short_id = &full_id[..full_id.len().min(SHORT_ID_LEN)];
        self.inspect(short_id).await
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Server> {
        self.inspect(id).await
    }

    async fn delete_server(&self, id: &str) -> ProviderResult<()> {
        self.run(&["rm", "-f", id])
            .await
            .map_err(|_| ProviderError::NotFound(id.to_string()))?;
        info!(id, "removed container");
        Ok(())
    }

    async fn list_servers(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>> {
        let raw = self.run(&["ps", "-aq"]).await?;
        let mut servers = Vec::new();
        for id in raw.lines().filter(|l| !l.is_empty()) {
            let server = self.inspect(id).await?;
            // No native AND-selector on this runtime; filter client-side.
            if labels_match(&server.labels, label_filter) {
                servers.push(server);
            }
        }
        Ok(servers)
    }
}

/// Map one `docker inspect` document onto the common server shape. The IP is
/// the address on `network` when the container is attached to it, otherwise
/// the default bridge address.
fn parse_inspect(doc: &serde_json::Value, network: &str) -> Server {
    let full_id = doc["Id"].as_str().unwrap_or_default();
    let name = doc["Name"]
        .as_str()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let status = doc["State"]["Status"].as_str().unwrap_or("unknown");

    let networks = &doc["NetworkSettings"]["Networks"];
    let ip = networks[network]["IPAddress"]
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            networks["bridge"]["IPAddress"]
                .as_str()
                .filter(|s| !s.is_empty())
        });

    let labels = doc["Config"]["Labels"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Server {
        id: full_id[..full_id.len().min(SHORT_ID_LEN)].to_string(),
        name,
        ipv4: ip.and_then(|s| s.parse().ok()),
        ipv6: None,
        location: "local".to_string(),
        state: ServerState::from_backend(status),
        labels,
        created: doc["Created"].as_str().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_doc(status: &str, on_private: bool) -> serde_json::Value {
        let networks = if on_private {
            serde_json::json!({
                "morpheus": {"IPAddress": "172.28.0.3"},
                "bridge": {"IPAddress": "172.17.0.2"}
            })
        } else {
            serde_json::json!({
                "bridge": {"IPAddress": "172.17.0.2"}
            })
        };
        serde_json::json!({
            "Id": "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6",
            "Name": "/pine-0",
            "Created": "2025-06-01T10:00:00Z",
            "State": {"Status": status},
            "Config": {"Labels": {"managed_by": "morpheus", "forest_id": "f1"}},
            "NetworkSettings": {"Networks": networks}
        })
    }

    #[test]
    fn test_parse_inspect_short_id_and_name() {
        let server = parse_inspect(&inspect_doc("running", true), "morpheus");
        assert_eq!(server.id, "a1b2c3d4e5f6");
        assert_eq!(server.id.len(), SHORT_ID_LEN);
        assert_eq!(server.name, "pine-0");
        assert_eq!(server.state, ServerState::Running);
        assert_eq!(server.labels["forest_id"], "f1");
    }

    #[test]
    fn test_parse_inspect_prefers_private_bridge() {
        let server = parse_inspect(&inspect_doc("running", true), "morpheus");
        assert_eq!(server.ipv4.unwrap().to_string(), "172.28.0.3");
    }

    #[test]
    fn test_parse_inspect_falls_back_to_default_bridge() {
        let server = parse_inspect(&inspect_doc("running", false), "morpheus");
        assert_eq!(server.ipv4.unwrap().to_string(), "172.17.0.2");
    }

    #[test]
    fn test_parse_inspect_exited_state() {
        let server = parse_inspect(&inspect_doc("exited", true), "morpheus");
        assert_eq!(server.state, ServerState::Stopped);
    }
}
