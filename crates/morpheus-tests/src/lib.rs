//! Shared fixtures for the cross-crate scenarios in `tests/`.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use morpheus_machine::{MachineProvider, ProviderError, ProviderResult};
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Machine backend whose behavior is scripted per test: which create call
/// fails, and which address created servers report.
pub struct StubProvider {
    pub ip: IpAddr,
    pub fail_on_create: Option<usize>,
    pub create_calls: AtomicUsize,
    pub servers: Mutex<HashMap<String, Server>>,
    pub deleted: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            fail_on_create: None,
            create_calls: AtomicUsize::new(0),
            servers: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Fail the `call`-th create (1-based) with a scripted backend error.
    pub fn failing_on(ip: IpAddr, call: usize) -> Self {
        Self { fail_on_create: Some(call), ..Self::new(ip) }
    }
}

#[async_trait]
impl MachineProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn create_server(&self, req: &CreateServerRequest) -> ProviderResult<Server> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_create == Some(call) {
            return Err(ProviderError::Backend(anyhow::anyhow!(
                "scripted create failure on call {call}"
            )));
        }
        let server = Server {
            id: format!("srv-{call}"),
            name: req.name.clone(),
            ipv4: match self.ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            },
            ipv6: match self.ip {
                IpAddr::V6(v6) => Some(v6),
                IpAddr::V4(_) => None,
            },
            location: "stub-dc".to_string(),
            state: ServerState::Running,
            labels: req.labels.clone(),
            created: String::new(),
        };
        self.servers.lock().insert(server.id.clone(), server.clone());
        Ok(server)
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Server> {
        self.servers
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn delete_server(&self, id: &str) -> ProviderResult<()> {
        self.deleted.lock().push(id.to_string());
        self.servers.lock().remove(id);
        Ok(())
    }

    async fn list_servers(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>> {
        Ok(self
            .servers
            .lock()
            .values()
            .filter(|s| label_filter.iter().all(|(k, v)| s.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

/// A listener kept open for readiness probes, plus its port.
pub async fn open_port() -> (tokio::net::TcpListener, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

/// A port that was just released and is very likely closed.
pub async fn closed_port() -> u16 {
    let (listener, port) = open_port().await;
    drop(listener);
    port
}
