//! No-op backend: trivially succeeds, holds no state.

use crate::error::ProviderResult;
use crate::MachineProvider;
use async_trait::async_trait;
use morpheus_proto::{CreateServerRequest, Server, ServerState};
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub struct NoopProvider;

impl NoopProvider {
    fn server(id: &str, name: &str, labels: HashMap<String, String>) -> Server {
        Server {
            id: id.to_string(),
            name: name.to_string(),
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            location: "nowhere".to_string(),
            state: ServerState::Running,
            labels,
            created: String::new(),
        }
    }
}

#[async_trait]
impl MachineProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    async fn create_server(&self, req: &CreateServerRequest) -> ProviderResult<Server> {
        Ok(Self::server(
            &format!("noop-{}", req.name),
            &req.name,
            req.labels.clone(),
        ))
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Server> {
        Ok(Self::server(id, id, HashMap::new()))
    }

    async fn delete_server(&self, _id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn list_servers(
        &self,
        _label_filter: &HashMap<String, String>,
    ) -> ProviderResult<Vec<Server>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_lifecycle() {
        let provider = NoopProvider;
        let req = CreateServerRequest {
            name: "oak-0".to_string(),
            server_type: "cx22".to_string(),
            image: "ubuntu-24.04".to_string(),
            location: None,
            ssh_keys: vec![],
            user_data: None,
            labels: HashMap::new(),
            enable_ipv4: true,
        };
        let server = provider.create_server(&req).await.expect("create");
        assert_eq!(server.id, "noop-oak-0");
        assert_eq!(server.state, ServerState::Running);
        provider.delete_server(&server.id).await.expect("delete");
        assert!(provider.list_servers(&HashMap::new()).await.expect("list").is_empty());
    }
}
