//! Machine provider abstraction for Morpheus.
//!
//! A [`MachineProvider`] exposes uniform create / get / delete / wait / list
//! operations over servers. Backends: Hetzner cloud, local Docker containers,
//! a Proxmox-backed hypervisor, and a no-op stub. Location awareness is an
//! optional capability ([`LocationAwareProvider`]).

#![forbid(unsafe_code)]

mod docker;
mod error;
mod hetzner;
mod hypervisor;
mod noop;

pub use docker::DockerProvider;
pub use error::{ProviderError, ProviderResult};
pub use hetzner::HetznerProvider;
pub use hypervisor::HypervisorProvider;
pub use noop::NoopProvider;

use async_trait::async_trait;
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fixed cadence for server-state polling.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Inner wall-clock cap on a single wait, independent of the caller's token.
pub const WAIT_CAP: Duration = Duration::from_secs(600);

// ─── Provider traits ─────────────────────────────────────────────────────────

/// Uniform server lifecycle operations over a machine backend.
///
/// `create_server` returns once the backend accepted the creation; it does
/// not imply the server is reachable. Callers follow with
/// [`wait_for_server`](MachineProvider::wait_for_server) and a protocol-level
/// probe.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_server(&self, req: &CreateServerRequest) -> ProviderResult<Server>;

    async fn get_server(&self, id: &str) -> ProviderResult<Server>;

    async fn delete_server(&self, id: &str) -> ProviderResult<()>;

    /// Servers matching `label_filter`, interpreted as AND of exact
    /// equalities. Backends without native filtering filter client-side.
    async fn list_servers(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>>;

    /// Poll [`get_server`](MachineProvider::get_server) at a fixed 5 s cadence
    /// until the server reaches `target`, the 10 min cap elapses, or `cancel`
    /// fires.
    async fn wait_for_server(
        &self,
        cancel: &CancellationToken,
        id: &str,
        target: ServerState,
    ) -> ProviderResult<Server> {
        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let server = self.get_server(id).await?;
            if server.state == target {
                return Ok(server);
            }
            if started.elapsed() >= WAIT_CAP {
                return Err(ProviderError::Timeout {
                    what: format!("server {id} to reach {target}"),
                    waited: started.elapsed(),
                });
            }
            debug!(id, state = %server.state, target = %target, "waiting for server state");
            tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }
}

/// Optional capability: backends that can answer where a server type is
/// actually available, enabling cost-preserving location selection.
#[async_trait]
pub trait LocationAwareProvider: MachineProvider {
    async fn check_location_availability(
        &self,
        location: &str,
        server_type: &str,
    ) -> ProviderResult<bool>;

    async fn get_available_locations(&self, server_type: &str) -> ProviderResult<Vec<String>>;

    /// Split `candidates` into (supported, unsupported) for `server_type`.
    async fn filter_locations_by_server_type(
        &self,
        candidates: &[String],
        server_type: &str,
    ) -> ProviderResult<(Vec<String>, Vec<String>)> {
        let available = self.get_available_locations(server_type).await?;
        let mut supported = Vec::new();
        let mut unsupported = Vec::new();
        for candidate in candidates {
            if available.iter().any(|l| l == candidate) {
                supported.push(candidate.clone());
            } else {
                unsupported.push(candidate.clone());
            }
        }
        Ok((supported, unsupported))
    }
}

/// Cost-preserving placement: keep the primary (cheapest) server type if it
/// is available in any acceptable location, and only then walk the fallback
/// types through the preferred locations in order.
pub async fn select_placement<P: LocationAwareProvider + ?Sized>(
    provider: &P,
    primary_type: &str,
    fallback_types: &[String],
    preferred_locations: &[String],
) -> ProviderResult<Option<(String, String)>> {
    let (supported, _) = provider
        .filter_locations_by_server_type(preferred_locations, primary_type)
        .await?;
    if let Some(location) = supported.first() {
        return Ok(Some((primary_type.to_string(), location.clone())));
    }

    for server_type in fallback_types {
        let (supported, _) = provider
            .filter_locations_by_server_type(preferred_locations, server_type)
            .await?;
        if let Some(location) = supported.first() {
            return Ok(Some((server_type.clone(), location.clone())));
        }
    }
    Ok(None)
}

// ─── Provider registry ───────────────────────────────────────────────────────

/// Named machine providers, built from whatever credentials the environment
/// carries.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn MachineProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every backend whose credentials are present. The no-op
    /// backend is always available.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Ok(token) = std::env::var("HCLOUD_TOKEN") {
            match HetznerProvider::new(token) {
                Ok(provider) => registry.register(Arc::new(provider)),
                Err(e) => tracing::warn!(error = %e, "skipping hetzner provider"),
            }
        }
        if let (Ok(base_url), Ok(token_id), Ok(secret), Ok(node)) = (
            std::env::var("PROXMOX_URL"),
            std::env::var("PROXMOX_TOKEN_ID"),
            std::env::var("PROXMOX_TOKEN_SECRET"),
            std::env::var("PROXMOX_NODE"),
        ) {
            let config = morpheus_proxmox::ProxmoxConfig {
                base_url,
                token_id,
                token_secret: secret,
                node,
                insecure_tls: std::env::var("PROXMOX_INSECURE_TLS").as_deref() == Ok("1"),
            };
            match morpheus_proxmox::ProxmoxClient::new(&config) {
                Ok(client) => {
                    registry.register(Arc::new(HypervisorProvider::new(Arc::new(client))));
                }
                Err(e) => tracing::warn!(error = %e, "skipping proxmox provider"),
            }
        }
        if std::env::var("MORPHEUS_LOCAL_RUNTIME").is_ok() {
            registry.register(Arc::new(DockerProvider::default()));
        }
        registry.register(Arc::new(NoopProvider));

        registry
    }

    pub fn register(&mut self, provider: Arc<dyn MachineProvider>) {
        info!(name = provider.name(), "registering machine provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MachineProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

/// AND of exact label equalities.
pub(crate) fn labels_match(
    labels: &HashMap<String, String>,
    filter: &HashMap<String, String>,
) -> bool {
    filter
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

pub(crate) fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_match_is_and_of_equalities() {
        let labels = map(&[("managed_by", "morpheus"), ("forest_id", "f1"), ("role", "worker")]);
        assert!(labels_match(&labels, &map(&[])));
        assert!(labels_match(&labels, &map(&[("forest_id", "f1")])));
        assert!(labels_match(&labels, &map(&[("forest_id", "f1"), ("role", "worker")])));
        assert!(!labels_match(&labels, &map(&[("forest_id", "f2")])));
        assert!(!labels_match(&labels, &map(&[("missing", "x")])));
    }

    #[test]
    fn test_registry_always_has_noop() {
        let registry = ProviderRegistry::from_env();
        assert!(registry.get("noop").is_some());
    }

    #[tokio::test]
    async fn test_wait_for_server_cancellation() {
        // Noop servers report running immediately, so ask for a state the
        // backend never reaches and cancel from the outside.
        let provider = NoopProvider;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider
            .wait_for_server(&cancel, "noop-a", ServerState::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_for_server_reaches_target() {
        let provider = NoopProvider;
        let cancel = CancellationToken::new();
        let server = provider
            .wait_for_server(&cancel, "noop-a", ServerState::Running)
            .await
            .expect("wait");
        assert_eq!(server.state, ServerState::Running);
    }

    /// Location-aware backend scripted with a fixed availability table.
    struct FixedLocations {
        /// (server_type, location) pairs that exist.
        available: Vec<(String, String)>,
    }

    #[async_trait]
    impl MachineProvider for FixedLocations {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn create_server(
            &self,
            _req: &morpheus_proto::CreateServerRequest,
        ) -> ProviderResult<morpheus_proto::Server> {
            Err(ProviderError::Unsupported("create_server"))
        }
        async fn get_server(&self, id: &str) -> ProviderResult<morpheus_proto::Server> {
            Err(ProviderError::NotFound(id.to_string()))
        }
        async fn delete_server(&self, _id: &str) -> ProviderResult<()> {
            Ok(())
        }
        async fn list_servers(
            &self,
            _label_filter: &HashMap<String, String>,
        ) -> ProviderResult<Vec<morpheus_proto::Server>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl LocationAwareProvider for FixedLocations {
        async fn check_location_availability(
            &self,
            location: &str,
            server_type: &str,
        ) -> ProviderResult<bool> {
            Ok(self
                .available
                .iter()
                .any(|(t, l)| t == server_type && l == location))
        }
        async fn get_available_locations(&self, server_type: &str) -> ProviderResult<Vec<String>> {
            Ok(self
                .available
                .iter()
                .filter(|(t, _)| t == server_type)
                .map(|(_, l)| l.clone())
                .collect())
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_select_placement_prefers_cheapest_type() {
        // The primary type is only available in the *second* preferred
        // location; it must still win over a fallback type in the first.
        let provider = FixedLocations {
            available: vec![
                ("cx22".to_string(), "hel1".to_string()),
                ("cx32".to_string(), "nbg1".to_string()),
            ],
        };
        let placement = select_placement(
            &provider,
            "cx22",
            &strings(&["cx32"]),
            &strings(&["nbg1", "hel1"]),
        )
        .await
        .expect("select")
        .expect("placed");
        assert_eq!(placement, ("cx22".to_string(), "hel1".to_string()));
    }

    #[tokio::test]
    async fn test_select_placement_falls_back_by_type() {
        let provider = FixedLocations {
            available: vec![("cx32".to_string(), "nbg1".to_string())],
        };
        let placement = select_placement(
            &provider,
            "cx22",
            &strings(&["cx32"]),
            &strings(&["nbg1", "hel1"]),
        )
        .await
        .expect("select")
        .expect("placed");
        assert_eq!(placement, ("cx32".to_string(), "nbg1".to_string()));

        let nothing = select_placement(&provider, "cx22", &[], &strings(&["hel1"]))
            .await
            .expect("select");
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn test_filter_locations_splits_supported() {
        let provider = FixedLocations {
            available: vec![("cx22".to_string(), "fsn1".to_string())],
        };
        let (supported, unsupported) = provider
            .filter_locations_by_server_type(&strings(&["fsn1", "ash"]), "cx22")
            .await
            .expect("filter");
        assert_eq!(supported, strings(&["fsn1"]));
        assert_eq!(unsupported, strings(&["ash"]));
    }
}
