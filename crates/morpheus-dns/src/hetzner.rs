//! Hetzner DNS backend.
//!
//! Token-authenticated REST against `dns.hetzner.com`. Zone ids are cached by
//! zone name; record lookups resolve their zone by longest-suffix match over
//! the cache, refreshing it once on a miss.

use crate::{longest_suffix_match, DnsError, DnsProvider, DnsResult, Record, RecordType, Zone};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://dns.hetzner.com/api/v1";
const DEFAULT_TTL: u32 = 3600;

pub struct HetznerDnsProvider {
    token: String,
    base_url: String,
    client: reqwest::Client,
    /// zone name → zone id. Read-mostly; refreshed from the API on a miss.
    zone_ids: RwLock<HashMap<String, String>>,
}

impl HetznerDnsProvider {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(token: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { token, base_url, client, zone_ids: RwLock::new(HashMap::new()) }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> DnsResult<serde_json::Value> {
        let resp = req
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(|e| DnsError::Backend(anyhow!(e).context("hetzner dns request failed")))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = resp.text().await.unwrap_or_default();
            return Err(DnsError::AuthFailed {
                remediation: "check that the Hetzner DNS API token is valid and not expired"
                    .to_string(),
                source: anyhow!("hetzner dns returned {status}: {body}"),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DnsError::Backend(anyhow!(
                "hetzner dns returned {status}: {body}"
            )));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        resp.json()
            .await
            .map_err(|e| DnsError::Backend(anyhow!(e).context("parse hetzner dns response")))
    }

    async fn fetch_zones(&self) -> DnsResult<Vec<ApiZone>> {
        let doc = self
            .send(self.client.get(format!("{}/zones", self.base_url)))
            .await?;
        let zones: Vec<ApiZone> =
            serde_json::from_value(doc["zones"].clone()).context("parse zone list")?;
        let mut cache = self.zone_ids.write();
        cache.clear();
        for zone in &zones {
            cache.insert(zone.name.clone(), zone.id.clone());
        }
        Ok(zones)
    }

    /// Zone id owning `domain`. The cache answers first; on a miss it is
    /// rebuilt from the API before giving up.
    async fn zone_id_for(&self, domain: &str) -> DnsResult<String> {
        if let Some(id) = self.cached_zone_id(domain) {
            return Ok(id);
        }
        self.fetch_zones().await?;
        self.cached_zone_id(domain)
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))
    }

    fn cached_zone_id(&self, domain: &str) -> Option<String> {
        let cache = self.zone_ids.read();
        let zone = longest_suffix_match(cache.keys().map(String::as_str), domain)?;
        cache.get(&zone).cloned()
    }

    async fn records_in_zone(&self, zone_id: &str) -> DnsResult<Vec<ApiRecord>> {
        let doc = self
            .send(
                self.client
                    .get(format!("{}/records?zone_id={zone_id}", self.base_url)),
            )
            .await?;
        serde_json::from_value(doc["records"].clone())
            .context("parse record list")
            .map_err(DnsError::Backend)
    }
}

#[async_trait]
impl DnsProvider for HetznerDnsProvider {
    fn name(&self) -> &str {
        "hetzner-dns"
    }

    /// Appends: a new record value is created alongside any existing
    /// (name, type) values, growing the RRSet.
    async fn create_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
        value: &str,
        ttl: Option<u32>,
    ) -> DnsResult<Record> {
        let zone_id = self.zone_id_for(domain).await?;
        let body = serde_json::json!({
            "zone_id": zone_id,
            "type": rtype.to_string(),
            "name": name,
            "value": value,
            "ttl": ttl.unwrap_or(DEFAULT_TTL),
        });
        info!(domain, name, %rtype, "creating dns record");
        let doc = self
            .send(
                self.client
                    .post(format!("{}/records", self.base_url))
                    .json(&body),
            )
            .await?;
        let wire: ApiRecord =
            serde_json::from_value(doc["record"].clone()).context("parse created record")?;
        wire.into_record(domain)
            .ok_or_else(|| DnsError::Backend(anyhow!("backend returned unexpected record type")))
    }

    async fn delete_record(&self, domain: &str, name: &str, rtype: RecordType) -> DnsResult<()> {
        let zone_id = self.zone_id_for(domain).await?;
        let matching: Vec<ApiRecord> = self
            .records_in_zone(&zone_id)
            .await?
            .into_iter()
            .filter(|r| r.name == name && r.rtype == rtype.to_string())
            .collect();
        if matching.is_empty() {
            debug!(domain, name, %rtype, "delete of absent rrset, nothing to do");
            return Ok(());
        }
        for record in matching {
            self.send(
                self.client
                    .delete(format!("{}/records/{}", self.base_url, record.id)),
            )
            .await?;
        }
        info!(domain, name, %rtype, "deleted dns rrset");
        Ok(())
    }

    async fn list_records(&self, domain: &str) -> DnsResult<Vec<Record>> {
        let zone_id = self.zone_id_for(domain).await?;
        Ok(self
            .records_in_zone(&zone_id)
            .await?
            .into_iter()
            .filter_map(|r| r.into_record(domain))
            .collect())
    }

    async fn get_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
    ) -> DnsResult<Vec<Record>> {
        let records: Vec<Record> = self
            .list_records(domain)
            .await?
            .into_iter()
            .filter(|r| r.name == name && r.rtype == rtype)
            .collect();
        if records.is_empty() {
            return Err(DnsError::RecordNotFound { name: name.to_string(), rtype });
        }
        Ok(records)
    }

    async fn create_zone(&self, name: &str, default_ttl: Option<u32>) -> DnsResult<Zone> {
        let body = serde_json::json!({
            "name": name,
            "ttl": default_ttl.unwrap_or(DEFAULT_TTL),
        });
        info!(name, "creating dns zone");
        let doc = self
            .send(
                self.client
                    .post(format!("{}/zones", self.base_url))
                    .json(&body),
            )
            .await?;
        let wire: ApiZone =
            serde_json::from_value(doc["zone"].clone()).context("parse created zone")?;
        self.zone_ids
            .write()
            .insert(wire.name.clone(), wire.id.clone());
        Ok(wire.into_zone())
    }

    async fn delete_zone(&self, name: &str) -> DnsResult<()> {
        self.fetch_zones().await?;
        let Some(id) = self.zone_ids.read().get(name).cloned() else {
            debug!(name, "delete of absent zone, nothing to do");
            return Ok(());
        };
        self.send(self.client.delete(format!("{}/zones/{id}", self.base_url)))
            .await?;
        self.zone_ids.write().remove(name);
        info!(name, "deleted dns zone");
        Ok(())
    }

    async fn get_zone(&self, name: &str) -> DnsResult<Zone> {
        self.fetch_zones()
            .await?
            .into_iter()
            .find(|z| z.name == name)
            .map(ApiZone::into_zone)
            .ok_or_else(|| DnsError::ZoneNotFound(name.to_string()))
    }

    async fn list_zones(&self) -> DnsResult<Vec<Zone>> {
        Ok(self
            .fetch_zones()
            .await?
            .into_iter()
            .map(ApiZone::into_zone)
            .collect())
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiZone {
    id: String,
    name: String,
    #[serde(default)]
    ttl: Option<u32>,
    #[serde(default)]
    ns: Vec<String>,
}

impl ApiZone {
    fn into_zone(self) -> Zone {
        Zone {
            id: self.id,
            name: self.name,
            default_ttl: self.ttl.unwrap_or(DEFAULT_TTL),
            ns: self.ns,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    value: String,
    #[serde(default)]
    ttl: Option<u32>,
}

impl ApiRecord {
    /// `None` for record types outside the managed alphabet (SOA, NS, ...).
    fn into_record(self, domain: &str) -> Option<Record> {
        let rtype = match self.rtype.as_str() {
            "A" => RecordType::A,
            "AAAA" => RecordType::AAAA,
            "CNAME" => RecordType::CNAME,
            "TXT" => RecordType::TXT,
            "SRV" => RecordType::SRV,
            "MX" => RecordType::MX,
            _ => return None,
        };
        Some(Record {
            id: self.id,
            domain: domain.to_string(),
            name: self.name,
            rtype,
            value: self.value,
            ttl: self.ttl.unwrap_or(DEFAULT_TTL),
        })
    }
}
