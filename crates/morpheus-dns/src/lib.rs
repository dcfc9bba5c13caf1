//! DNS provider abstraction and resilient resolution for Morpheus.
//!
//! [`DnsProvider`] gives uniform zone / record CRUD over provider APIs.
//! [`resolver::Resolver`] answers lookups through three tiers (system →
//! direct UDP → DNS-over-HTTPS); [`verify`] builds structured delegation and
//! MX diffs on top of it.

#![forbid(unsafe_code)]

mod hetzner;
pub mod memory;
pub mod resolver;
pub mod verify;

pub use hetzner::HetznerDnsProvider;
pub use resolver::{MxHost, ResolveError, Resolver};
pub use verify::{MxResult, NsResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Record & zone model ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    TXT,
    SRV,
    MX,
}

impl RecordType {
    /// Numeric wire type, as used by DNS-over-HTTPS JSON answers.
    pub fn wire_type(self) -> u16 {
        match self {
            Self::A => 1,
            Self::AAAA => 28,
            Self::CNAME => 5,
            Self::TXT => 16,
            Self::SRV => 33,
            Self::MX => 15,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::AAAA => "AAAA",
            Self::CNAME => "CNAME",
            Self::TXT => "TXT",
            Self::SRV => "SRV",
            Self::MX => "MX",
        };
        write!(f, "{s}")
    }
}

/// One record value. Multi-valued RRSets are represented as multiple records
/// sharing (name, type) and differing by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Zone-qualified domain this record lives under.
    pub domain: String,
    /// Name relative to the zone; `@` for the apex.
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: RecordType,
    pub value: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub default_ttl: u32,
    /// Authoritative nameservers as reported by the provider.
    #[serde(default)]
    pub ns: Vec<String>,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no zone found for '{0}'")]
    ZoneNotFound(String),

    #[error("record {name} ({rtype}) not found")]
    RecordNotFound { name: String, rtype: RecordType },

    #[error("authentication failed: {remediation}")]
    AuthFailed {
        remediation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type DnsResult<T> = Result<T, DnsError>;

// ─── Provider contract ───────────────────────────────────────────────────────

/// Zone and record CRUD over one provider account.
///
/// `domain` parameters locate the owning zone by longest-suffix match, so a
/// caller may pass `api.eu.example.com` and land in the `example.com` zone
/// (or `eu.example.com` when that zone exists too).
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create one record value. Behavior on an existing (name, type) is
    /// backend-specific (append vs replace) and documented per
    /// implementation.
    async fn create_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
        value: &str,
        ttl: Option<u32>,
    ) -> DnsResult<Record>;

    /// Remove the whole (name, type) RRSet. Succeeds when nothing matches.
    async fn delete_record(&self, domain: &str, name: &str, rtype: RecordType) -> DnsResult<()>;

    async fn list_records(&self, domain: &str) -> DnsResult<Vec<Record>>;

    /// All values of the (name, type) RRSet; [`DnsError::RecordNotFound`]
    /// when the set is empty.
    async fn get_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
    ) -> DnsResult<Vec<Record>>;

    async fn create_zone(&self, name: &str, default_ttl: Option<u32>) -> DnsResult<Zone>;

    /// Idempotent: deleting an unknown zone succeeds.
    async fn delete_zone(&self, name: &str) -> DnsResult<()>;

    async fn get_zone(&self, name: &str) -> DnsResult<Zone>;

    async fn list_zones(&self) -> DnsResult<Vec<Zone>>;
}

/// Longest-suffix zone match: `domain` belongs to the longest zone name that
/// equals it or is a dot-separated suffix of it.
pub(crate) fn longest_suffix_match<'a, I>(zone_names: I, domain: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let domain = domain.trim_end_matches('.');
    zone_names
        .into_iter()
        .filter(|zone| {
            domain == *zone || domain.ends_with(&format!(".{zone}"))
        })
        .max_by_key(|zone| zone.len())
        .map(str::to_string)
}
