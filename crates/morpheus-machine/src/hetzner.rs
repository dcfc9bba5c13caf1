//! Hetzner Cloud backend.
//!
//! Resolves symbolic server-type / image / location names to backend ids
//! before creation, ensures an SSH public key is present remotely, and lists
//! with server-side label selectors.

use crate::error::{ProviderError, ProviderResult};
use crate::{build_http_client, MachineProvider, LocationAwareProvider};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Local public keys probed, in order, when the project has no key yet.
const SSH_KEY_SEARCH_PATH: &[&str] = &[
    ".ssh/id_ed25519.pub",
    ".ssh/id_rsa.pub",
    ".ssh/id_ecdsa.pub",
];

/// Name under which an auto-uploaded key is registered.
const UPLOADED_KEY_NAME: &str = "morpheus";

pub struct HetznerProvider {
    token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(token: String) -> ProviderResult<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string())
    }

    /// Constructor with an overridable API endpoint, used by tests.
    pub fn with_base_url(token: String, base_url: String) -> ProviderResult<Self> {
        validate_token(&token)?;
        Ok(Self { token, base_url, client: build_http_client() })
    }

    async fn get_json(&self, path_and_query: &str) -> ProviderResult<serde_json::Value> {
        let url = format!("{}{path_and_query}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::Backend(anyhow!(e).context("hetzner GET failed")))?;
        check(resp).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Backend(anyhow!(e).context("hetzner POST failed")))?;
        check(resp).await
    }

    /// Resolve a symbolic name through a list endpoint's `?name=` filter.
    async fn resolve_id(&self, endpoint: &str, plural: &str, name: &str) -> ProviderResult<u64> {
        let doc = self.get_json(&format!("/{endpoint}?name={name}")).await?;
        let resources: Vec<NamedResource> = serde_json::from_value(doc[plural].clone())
            .with_context(|| format!("parse {endpoint} list"))?;
        resources
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id)
            .ok_or_else(|| ProviderError::Backend(anyhow!("unknown {endpoint} '{name}'")))
    }

    /// Make sure at least one usable SSH key name exists remotely. When the
    /// request names keys they are taken as-is; otherwise the first local
    /// public key on the search path is uploaded if the project lacks it.
    async fn ensure_ssh_keys(&self, requested: &[String]) -> ProviderResult<Vec<String>> {
        if !requested.is_empty() {
            return Ok(requested.to_vec());
        }

        let doc = self.get_json("/ssh_keys").await?;
        let remote: Vec<SshKey> =
            serde_json::from_value(doc["ssh_keys"].clone()).context("parse ssh key list")?;

        let Some((path, material)) = read_local_public_key() else {
            // No local key either; let the backend decide (it will fall back
            // to password mail for images that support it).
            return Ok(Vec::new());
        };
        let material = material.trim().to_string();

        if let Some(existing) = remote.iter().find(|k| k.public_key.trim() == material) {
            debug!(name = %existing.name, "ssh key already present remotely");
            return Ok(vec![existing.name.clone()]);
        }

        info!(path = %path.display(), "uploading local ssh public key");
        let body = serde_json::json!({ "name": UPLOADED_KEY_NAME, "public_key": material });
        self.post_json("/ssh_keys", &body).await?;
        Ok(vec![UPLOADED_KEY_NAME.to_string()])
    }
}

#[async_trait]
impl MachineProvider for HetznerProvider {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn create_server(&self, req: &CreateServerRequest) -> ProviderResult<Server> {
        let server_type = self
            .resolve_id("server_types", "server_types", &req.server_type)
            .await?;
        let image = self.resolve_id("images", "images", &req.image).await?;
        let ssh_keys = self.ensure_ssh_keys(&req.ssh_keys).await?;

        let mut body = serde_json::json!({
            "name": req.name,
            "server_type": server_type,
            "image": image,
            "ssh_keys": ssh_keys,
            "labels": req.labels,
            "public_net": { "enable_ipv4": req.enable_ipv4, "enable_ipv6": true },
            "start_after_create": true,
        });
        if let Some(location) = &req.location {
            body["location"] = serde_json::json!(self
                .resolve_id("locations", "locations", location)
                .await?);
        }
        if let Some(user_data) = &req.user_data {
            body["user_data"] = serde_json::json!(user_data);
        }

        info!(name = %req.name, server_type = %req.server_type, "creating hetzner server");
        let doc = self.post_json("/servers", &body).await?;
        let wire: ApiServer =
            serde_json::from_value(doc["server"].clone()).context("parse created server")?;
        Ok(wire.into_server())
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Server> {
        let doc = self.get_json(&format!("/servers/{id}")).await.map_err(|e| {
            match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(id.to_string()),
                other => other,
            }
        })?;
        let wire: ApiServer =
            serde_json::from_value(doc["server"].clone()).context("parse server")?;
        Ok(wire.into_server())
    }

    async fn delete_server(&self, id: &str) -> ProviderResult<()> {
        let url = format!("{}/servers/{id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::Backend(anyhow!(e).context("hetzner DELETE failed")))?;
        check(resp).await.map_err(|e| match e {
            ProviderError::NotFound(_) => ProviderError::NotFound(id.to_string()),
            other => other,
        })?;
        info!(id, "deleted hetzner server");
        Ok(())
    }

    async fn list_servers(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>> {
        let selector = label_selector(label_filter);
        let mut servers = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query = format!("/servers?page={page}&per_page=50");
            if !selector.is_empty() {
                query.push_str("&label_selector=");
                query.push_str(&selector);
            }
            let doc = self.get_json(&query).await?;
            let batch: Vec<ApiServer> =
                serde_json::from_value(doc["servers"].clone()).context("parse server list")?;
            servers.extend(batch.into_iter().map(ApiServer::into_server));
            match doc["meta"]["pagination"]["next_page"].as_u64() {
                Some(next) => page = next as u32,
                None => break,
            }
        }
        Ok(servers)
    }
}

#[async_trait]
impl LocationAwareProvider for HetznerProvider {
    async fn check_location_availability(
        &self,
        location: &str,
        server_type: &str,
    ) -> ProviderResult<bool> {
        Ok(self
            .get_available_locations(server_type)
            .await?
            .iter()
            .any(|l| l == location))
    }

    /// Locations a server type is priced in; pricing presence tracks
    /// availability on this backend.
    async fn get_available_locations(&self, server_type: &str) -> ProviderResult<Vec<String>> {
        let doc = self
            .get_json(&format!("/server_types?name={server_type}"))
            .await?;
        let prices = doc["server_types"][0]["prices"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(prices
            .iter()
            .filter_map(|p| p["location"].as_str().map(str::to_string))
            .collect())
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiServer {
    id: u64,
    name: String,
    status: String,
    created: String,
    public_net: PublicNet,
    datacenter: Option<Datacenter>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Option<IpBlock>,
    ipv6: Option<IpBlock>,
}

#[derive(Debug, Deserialize)]
struct IpBlock {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct Datacenter {
    location: LocationRef,
}

#[derive(Debug, Deserialize)]
struct LocationRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SshKey {
    name: String,
    public_key: String,
}

/// Anything the symbolic-name endpoints hand back: an id and its name.
#[derive(Debug, Deserialize)]
struct NamedResource {
    id: u64,
    name: String,
}

impl ApiServer {
    fn into_server(self) -> Server {
        Server {
            id: self.id.to_string(),
            name: self.name,
            ipv4: self
                .public_net
                .ipv4
                .and_then(|b| b.ip.parse().ok()),
            ipv6: self
                .public_net
                .ipv6
                .and_then(|b| first_host_in_net(&b.ip)),
            location: self
                .datacenter
                .map(|d| d.location.name)
                .unwrap_or_default(),
            state: ServerState::from_backend(&self.status),
            labels: self.labels,
            created: self.created,
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// The backend hands out an IPv6 network (`2001:db8::/64`); the server itself
/// answers on the first host address in it.
fn first_host_in_net(net: &str) -> Option<Ipv6Addr> {
    let addr: Ipv6Addr = net.split('/').next()?.parse().ok()?;
    let mut segments = addr.segments();
    if segments[7] == 0 {
        segments[7] = 1;
    }
    Some(Ipv6Addr::from(segments))
}

/// Tokens are used in an HTTP header; anything outside printable ASCII is a
/// paste error, rejected before the first request.
fn validate_token(token: &str) -> ProviderResult<()> {
    if token.is_empty() {
        return Err(ProviderError::InvalidToken("token is empty".to_string()));
    }
    if let Some(bad) = token.bytes().find(|b| !(0x21..=0x7e).contains(b)) {
        return Err(ProviderError::InvalidToken(format!(
            "byte 0x{bad:02x} is not printable ASCII"
        )));
    }
    Ok(())
}

fn label_selector(filter: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = filter.iter().map(|(k, v)| format!("{k}%3D{v}")).collect();
    pairs.sort();
    pairs.join(",")
}

fn read_local_public_key() -> Option<(PathBuf, String)> {
    let home = PathBuf::from(std::env::var("HOME").ok()?);
    for rel in SSH_KEY_SEARCH_PATH {
        let path = home.join(rel);
        if let Ok(material) = std::fs::read_to_string(&path) {
            return Some((path, material));
        }
    }
    None
}

async fn check(resp: reqwest::Response) -> ProviderResult<serde_json::Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::AuthFailed {
            remediation: "check that HCLOUD_TOKEN is a valid read-write API token for this \
                          project"
                .to_string(),
            source: anyhow!("hetzner returned {status}: {body}"),
        });
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(String::new()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Backend(anyhow!(
            "hetzner returned {status}: {body}"
        )));
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(serde_json::Value::Null);
    }
    resp.json()
        .await
        .map_err(|e| ProviderError::Backend(anyhow!(e).context("parse hetzner response")))
}
