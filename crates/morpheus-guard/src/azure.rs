//! Azure ARM implementation of the [`CloudNetwork`](crate::CloudNetwork) seam.
//!
//! Plain api-versioned PUT/DELETE calls against the management endpoint.
//! Token acquisition is abstracted behind [`TokenProvider`] so tests can
//! inject a static token.

use crate::{CloudNetwork, Route, SecurityRule};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const API_NETWORK: &str = "2023-04-01";
const API_COMPUTE: &str = "2023-07-01";
const API_GROUPS: &str = "2021-04-01";

// ─── Token acquisition ───────────────────────────────────────────────────────

/// Abstraction over ARM token acquisition; enables test injection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Client-credentials flow for a service principal, with the token cached
/// until shortly before expiry.
pub struct ServicePrincipalTokenProvider {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    login_base: String,
    client: reqwest::Client,
    cache: Mutex<Option<(String, Instant)>>,
}

impl ServicePrincipalTokenProvider {
    pub fn new(tenant_id: String, client_id: String, client_secret: String) -> Self {
        Self::with_login_base(
            tenant_id,
            client_id,
            client_secret,
            "https://login.microsoftonline.com".to_string(),
        )
    }

    pub fn with_login_base(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        login_base: String,
    ) -> Self {
        Self {
            tenant_id,
            client_id,
            client_secret,
            login_base,
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for ServicePrincipalTokenProvider {
    async fn token(&self) -> Result<String> {
        {
            let guard = self.cache.lock().await;
            if let Some((token, expiry)) = guard.as_ref()
                && Instant::now() < *expiry
            {
                return Ok(token.clone());
            }
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("scope", "https://management.azure.com/.default"),
        ];
        let resp: Value = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .context("token request failed")?
            .json()
            .await
            .context("token response decode failed")?;

        let token = resp["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("no access_token in token response: {resp}"))?
            .to_string();
        let expires_in = resp["expires_in"].as_u64().unwrap_or(3600);
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        *self.cache.lock().await = Some((token.clone(), expiry));
        Ok(token)
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AzureNetworkConfig {
    pub subscription_id: String,
    /// Management endpoint; overridden in tests.
    pub management_base: String,
}

impl AzureNetworkConfig {
    pub fn new(subscription_id: String) -> Self {
        Self {
            subscription_id,
            management_base: "https://management.azure.com".to_string(),
        }
    }
}

pub struct AzureNetwork {
    config: AzureNetworkConfig,
    token: std::sync::Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl AzureNetwork {
    pub fn new(config: AzureNetworkConfig, token: std::sync::Arc<dyn TokenProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { config, token, client }
    }

    fn group_url(&self, group: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourcegroups/{group}",
            self.config.management_base, self.config.subscription_id
        )
    }

    fn network_url(&self, group: &str, kind: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{group}/providers/Microsoft.Network/{kind}/{name}",
            self.config.management_base, self.config.subscription_id
        )
    }

    async fn put(&self, url: &str, api_version: &str, body: &Value) -> Result<Value> {
        let token = self.token.token().await?;
        debug!(url, "azure PUT");
        let resp = self
            .client
            .put(url)
            .query(&[("api-version", api_version)])
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .context("azure PUT failed")?;
        Self::read(resp).await
    }

    async fn get(&self, url: &str, api_version: &str) -> Result<Value> {
        let token = self.token.token().await?;
        let resp = self
            .client
            .get(url)
            .query(&[("api-version", api_version)])
            .bearer_auth(token)
            .send()
            .await
            .context("azure GET failed")?;
        Self::read(resp).await
    }

    async fn read(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("azure returned {status}: {body}"));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).context("parse azure response")
    }

    fn subnet_id(&self, group: &str, vnet: &str, subnet: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{group}/providers/Microsoft.Network/virtualNetworks/{vnet}/subnets/{subnet}",
            self.config.subscription_id
        )
    }

    fn resource_id(&self, group: &str, kind: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{group}/providers/Microsoft.Network/{kind}/{name}",
            self.config.subscription_id
        )
    }
}

#[async_trait]
impl CloudNetwork for AzureNetwork {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        info!(group = name, "creating resource group");
        self.put(
            &self.group_url(name),
            API_GROUPS,
            &json!({ "location": location, "tags": tags }),
        )
        .await?;
        Ok(())
    }

    async fn create_virtual_network(
        &self,
        group: &str,
        name: &str,
        location: &str,
        cidr: &str,
        subnet_name: &str,
        subnet_cidr: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        info!(vnet = name, cidr, "creating virtual network");
        self.put(
            &self.network_url(group, "virtualNetworks", name),
            API_NETWORK,
            &json!({
                "location": location,
                "tags": tags,
                "properties": {
                    "addressSpace": { "addressPrefixes": [cidr] },
                    "subnets": [
                        { "name": subnet_name, "properties": { "addressPrefix": subnet_cidr } }
                    ]
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        group: &str,
        name: &str,
        location: &str,
        rules: &[SecurityRule],
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        let security_rules: Vec<Value> = rules
            .iter()
            .map(|rule| {
                json!({
                    "name": rule.name,
                    "properties": {
                        "priority": rule.priority,
                        "direction": "Inbound",
                        "access": "Allow",
                        "protocol": rule.protocol,
                        "sourceAddressPrefix": "*",
                        "sourcePortRange": "*",
                        "destinationAddressPrefix": "*",
                        "destinationPortRange": rule.port.to_string(),
                    }
                })
            })
            .collect();
        info!(nsg = name, rules = rules.len(), "creating security group");
        self.put(
            &self.network_url(group, "networkSecurityGroups", name),
            API_NETWORK,
            &json!({
                "location": location,
                "tags": tags,
                "properties": { "securityRules": security_rules }
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_public_ip(
        &self,
        group: &str,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        info!(public_ip = name, "creating public ip");
        self.put(
            &self.network_url(group, "publicIPAddresses", name),
            API_NETWORK,
            &json!({
                "location": location,
                "tags": tags,
                "sku": { "name": "Standard" },
                "properties": { "publicIPAllocationMethod": "Static" }
            }),
        )
        .await?;
        // Static allocation assigns immediately; read it back.
        let doc = self
            .get(&self.network_url(group, "publicIPAddresses", name), API_NETWORK)
            .await?;
        Ok(doc["properties"]["ipAddress"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

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
    ) -> Result<String> {
        info!(nic = name, ip_forwarding, "creating network interface");
        let doc = self
            .put(
                &self.network_url(group, "networkInterfaces", name),
                API_NETWORK,
                &json!({
                    "location": location,
                    "tags": tags,
                    "properties": {
                        "enableIPForwarding": ip_forwarding,
                        "networkSecurityGroup": {
                            "id": self.resource_id(group, "networkSecurityGroups", security_group)
                        },
                        "ipConfigurations": [{
                            "name": "ipconfig1",
                            "properties": {
                                "subnet": { "id": self.subnet_id(group, vnet, subnet) },
                                "privateIPAllocationMethod": "Dynamic",
                                "publicIPAddress": {
                                    "id": self.resource_id(group, "publicIPAddresses", public_ip)
                                }
                            }
                        }]
                    }
                }),
            )
            .await?;
        Ok(doc["properties"]["ipConfigurations"][0]["properties"]["privateIPAddress"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

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
    ) -> Result<()> {
        info!(vm = name, vm_size, "creating guard vm");
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{group}/providers/Microsoft.Compute/virtualMachines/{name}",
            self.config.management_base, self.config.subscription_id
        );
        self.put(
            &url,
            API_COMPUTE,
            &json!({
                "location": location,
                "tags": tags,
                "properties": {
                    "hardwareProfile": { "vmSize": vm_size },
                    "osProfile": {
                        "computerName": name,
                        "adminUsername": admin_username,
                        "customData": custom_data_b64,
                        "linuxConfiguration": {
                            "disablePasswordAuthentication": true,
                            "ssh": {
                                "publicKeys": [{
                                    "path": format!("/home/{admin_username}/.ssh/authorized_keys"),
                                    "keyData": ssh_public_key
                                }]
                            }
                        }
                    },
                    "storageProfile": {
                        "imageReference": {
                            "publisher": "Canonical",
                            "offer": "ubuntu-24_04-lts",
                            "sku": "server",
                            "version": "latest"
                        },
                        "osDisk": { "createOption": "FromImage" }
                    },
                    "networkProfile": {
                        "networkInterfaces": [{
                            "id": self.resource_id(group, "networkInterfaces", nic)
                        }]
                    }
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> Result<()> {
        let token = self.token.token().await?;
        info!(group = name, "deleting resource group");
        let resp = self
            .client
            .delete(self.group_url(name))
            .query(&[("api-version", API_GROUPS)])
            .bearer_auth(token)
            .send()
            .await
            .context("azure DELETE failed")?;
        Self::read(resp).await?;
        Ok(())
    }

    async fn create_peering(
        &self,
        group: &str,
        vnet: &str,
        peering_name: &str,
        remote_vnet_id: &str,
    ) -> Result<()> {
        info!(vnet, peering = peering_name, "creating vnet peering");
        let url = format!(
            "{}/virtualNetworkPeerings/{peering_name}",
            self.network_url(group, "virtualNetworks", vnet)
        );
        self.put(
            &url,
            API_NETWORK,
            &json!({
                "properties": {
                    "remoteVirtualNetwork": { "id": remote_vnet_id },
                    "allowVirtualNetworkAccess": true,
                    "allowForwardedTraffic": true
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_route_table(
        &self,
        group: &str,
        name: &str,
        location: &str,
        routes: &[Route],
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        let route_entries: Vec<Value> = routes
            .iter()
            .map(|route| {
                json!({
                    "name": route.name,
                    "properties": {
                        "addressPrefix": route.address_prefix,
                        "nextHopType": "VirtualAppliance",
                        "nextHopIpAddress": route.next_hop_ip
                    }
                })
            })
            .collect();
        info!(route_table = name, routes = routes.len(), "creating route table");
        self.put(
            &self.network_url(group, "routeTables", name),
            API_NETWORK,
            &json!({
                "location": location,
                "tags": tags,
                "properties": { "routes": route_entries }
            }),
        )
        .await?;
        Ok(())
    }

    /// Read-modify-write: subnet PUT requires the existing address prefix.
    async fn associate_route_table(
        &self,
        group: &str,
        vnet: &str,
        subnet: &str,
        route_table: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/subnets/{subnet}",
            self.network_url(group, "virtualNetworks", vnet)
        );
        let mut doc = self.get(&url, API_NETWORK).await?;
        doc["properties"]["routeTable"] =
            json!({ "id": self.resource_id(group, "routeTables", route_table) });
        info!(subnet, route_table, "associating route table");
        self.put(&url, API_NETWORK, &doc).await?;
        Ok(())
    }

    async fn list_resource_groups(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let token = self.token.token().await?;
        let url = format!(
            "{}/subscriptions/{}/resourcegroups",
            self.config.management_base, self.config.subscription_id
        );
        let filter = format!("tagName eq '{tag_key}' and tagValue eq '{tag_value}'");
        let resp = self
            .client
            .get(&url)
            .query(&[("api-version", API_GROUPS), ("$filter", filter.as_str())])
            .bearer_auth(token)
            .send()
            .await
            .context("azure GET failed")?;
        let doc = Self::read(resp).await?;

        let mut groups = Vec::new();
        for entry in doc["value"].as_array().into_iter().flatten() {
            let Some(name) = entry["name"].as_str() else {
                continue;
            };
            let tags = entry["tags"]
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            groups.push((name.to_string(), tags));
        }
        Ok(groups)
    }

    fn vnet_id(&self, group: &str, vnet: &str) -> String {
        self.resource_id(group, "virtualNetworks", vnet)
    }
}
