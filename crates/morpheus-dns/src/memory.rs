//! In-memory DNS provider for tests and dry runs.

use crate::{longest_suffix_match, DnsError, DnsProvider, DnsResult, Record, RecordType, Zone};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_TTL: u32 = 3600;

#[derive(Default)]
pub struct MemoryDnsProvider {
    zones: RwLock<HashMap<String, Zone>>,
    /// zone name → records.
    records: RwLock<HashMap<String, Vec<Record>>>,
    next_id: AtomicU64,
}

impl MemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: a provider pre-seeded with one zone.
    pub fn with_zone(zone_name: &str) -> Self {
        let provider = Self::new();
        {
            let mut zones = provider.zones.write();
            zones.insert(
                zone_name.to_string(),
                Zone {
                    id: format!("zone-{zone_name}"),
                    name: zone_name.to_string(),
                    default_ttl: DEFAULT_TTL,
                    ns: Vec::new(),
                },
            );
        }
        provider
    }

    fn zone_for(&self, domain: &str) -> DnsResult<String> {
        let zones = self.zones.read();
        longest_suffix_match(zones.keys().map(String::as_str), domain)
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))
    }

    fn fresh_id(&self) -> String {
        format!("rec-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    fn name(&self) -> &str {
        "memory"
    }

    /// Appends to any existing (name, type) RRSet.
    async fn create_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
        value: &str,
        ttl: Option<u32>,
    ) -> DnsResult<Record> {
        let zone = self.zone_for(domain)?;
        let record = Record {
            id: self.fresh_id(),
            domain: domain.to_string(),
            name: name.to_string(),
            rtype,
            value: value.to_string(),
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        };
        self.records
            .write()
            .entry(zone)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn delete_record(&self, domain: &str, name: &str, rtype: RecordType) -> DnsResult<()> {
        let zone = self.zone_for(domain)?;
        if let Some(records) = self.records.write().get_mut(&zone) {
            records.retain(|r| !(r.name == name && r.rtype == rtype));
        }
        Ok(())
    }

    async fn list_records(&self, domain: &str) -> DnsResult<Vec<Record>> {
        let zone = self.zone_for(domain)?;
        Ok(self.records.read().get(&zone).cloned().unwrap_or_default())
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
        let zone = Zone {
            id: format!("zone-{name}"),
            name: name.to_string(),
            default_ttl: default_ttl.unwrap_or(DEFAULT_TTL),
            ns: Vec::new(),
        };
        self.zones.write().insert(name.to_string(), zone.clone());
        Ok(zone)
    }

    async fn delete_zone(&self, name: &str) -> DnsResult<()> {
        self.zones.write().remove(name);
        self.records.write().remove(name);
        Ok(())
    }

    async fn get_zone(&self, name: &str) -> DnsResult<Zone> {
        self.zones
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DnsError::ZoneNotFound(name.to_string()))
    }

    async fn list_zones(&self) -> DnsResult<Vec<Zone>> {
        Ok(self.zones.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rrset_append_and_get() {
        let dns = MemoryDnsProvider::with_zone("example.com");
        dns.create_record("example.com", "www", RecordType::A, "1.2.3.4", None)
            .await
            .expect("create");
        dns.create_record("example.com", "www", RecordType::A, "5.6.7.8", None)
            .await
            .expect("append");
        let rrset = dns
            .get_record("example.com", "www", RecordType::A)
            .await
            .expect("get");
        assert_eq!(rrset.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_record_is_idempotent() {
        let dns = MemoryDnsProvider::with_zone("example.com");
        dns.delete_record("example.com", "ghost", RecordType::TXT)
            .await
            .expect("deleting an absent rrset succeeds");

        dns.create_record("example.com", "www", RecordType::A, "1.2.3.4", None)
            .await
            .expect("create");
        dns.delete_record("example.com", "www", RecordType::A)
            .await
            .expect("delete");
        dns.delete_record("example.com", "www", RecordType::A)
            .await
            .expect("second delete still succeeds");
        assert!(dns
            .get_record("example.com", "www", RecordType::A)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_whole_rrset_only() {
        let dns = MemoryDnsProvider::with_zone("example.com");
        dns.create_record("example.com", "www", RecordType::A, "1.2.3.4", None)
            .await
            .expect("create");
        dns.create_record("example.com", "www", RecordType::A, "5.6.7.8", None)
            .await
            .expect("append");
        dns.create_record("example.com", "www", RecordType::TXT, "hello", None)
            .await
            .expect("other type");

        dns.delete_record("example.com", "www", RecordType::A)
            .await
            .expect("delete");
        assert!(dns.get_record("example.com", "www", RecordType::A).await.is_err());
        // The TXT record with the same name survives.
        assert_eq!(
            dns.get_record("example.com", "www", RecordType::TXT)
                .await
                .expect("txt")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_zone_rejected() {
        let dns = MemoryDnsProvider::with_zone("example.com");
        assert!(matches!(
            dns.create_record("other.net", "www", RecordType::A, "1.2.3.4", None)
                .await,
            Err(DnsError::ZoneNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zone_delete_idempotent() {
        let dns = MemoryDnsProvider::new();
        dns.create_zone("example.com", None).await.expect("create");
        dns.delete_zone("example.com").await.expect("delete");
        dns.delete_zone("example.com").await.expect("second delete succeeds");
    }
}
