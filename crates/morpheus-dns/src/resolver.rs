//! Resilient three-tier DNS resolution.
//!
//! Tier 1 asks the system resolver, tier 2 goes directly to public resolvers
//! over UDP/53, tier 3 falls back to DNS-over-HTTPS. The first tier to answer
//! wins; later tiers are never consulted. In a restricted environment
//! (no raw UDP, unusual certificate stores) the plan collapses to tier 1.

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType as WireType;
use hickory_resolver::TokioResolver;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_TIMEOUT: Duration = Duration::from_secs(3);
const DIRECT_UDP_TIMEOUT: Duration = Duration::from_secs(5);
const DOH_TIMEOUT: Duration = Duration::from_secs(15);

/// Queried in order until one accepts the socket.
const PUBLIC_RESOLVERS: [IpAddr; 3] = [
    IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(std::net::Ipv4Addr::new(9, 9, 9, 9)),
];

const DOH_ENDPOINTS: [&str; 2] = [
    "https://dns.google/resolve",
    "https://cloudflare-dns.com/dns-query",
];

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{tier} lookup for {domain} failed: {message}")]
    Lookup {
        tier: &'static str,
        domain: String,
        message: String,
    },

    #[error("doh endpoint rejected query with status {status}")]
    DohStatus { status: i64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

// ─── Tier plan ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    System,
    DirectUdp,
    DoH,
}

const FULL_PLAN: &[Tier] = &[Tier::System, Tier::DirectUdp, Tier::DoH];
const RESTRICTED_PLAN: &[Tier] = &[Tier::System];

pub(crate) fn tier_plan(restricted: bool) -> &'static [Tier] {
    if restricted { RESTRICTED_PLAN } else { FULL_PLAN }
}

/// Run `attempt` over the tiers in order, returning the first success. When
/// every tier fails, the last tier's error is surfaced.
pub(crate) async fn first_success<T, F, Fut>(
    tiers: &[Tier],
    mut attempt: F,
) -> ResolveResult<T>
where
    F: FnMut(Tier) -> Fut,
    Fut: Future<Output = ResolveResult<T>>,
{
    let mut last_err: Option<ResolveError> = None;
    for tier in tiers {
        match attempt(*tier).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(tier = ?tier, error = %e, "resolver tier failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("tier plan is never empty"))
}

/// True when direct UDP/53 and non-standard certificate sources are known to
/// be unavailable: an environment marker or a well-known installation path.
pub fn detect_restricted_environment() -> bool {
    std::env::var_os("TERMUX_VERSION").is_some()
        || Path::new("/data/data/com.termux/files/usr").exists()
}

// ─── Query model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryType {
    Ns,
    Mx,
    Txt,
    A,
    Aaaa,
}

impl QueryType {
    fn wire(self) -> WireType {
        match self {
            Self::Ns => WireType::NS,
            Self::Mx => WireType::MX,
            Self::Txt => WireType::TXT,
            Self::A => WireType::A,
            Self::Aaaa => WireType::AAAA,
        }
    }

    fn wire_code(self) -> u16 {
        match self {
            Self::Ns => 2,
            Self::Mx => 15,
            Self::Txt => 16,
            Self::A => 1,
            Self::Aaaa => 28,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ns => "NS",
            Self::Mx => "MX",
            Self::Txt => "TXT",
            Self::A => "A",
            Self::Aaaa => "AAAA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub priority: u16,
    pub host: String,
}

/// Parse MX answer data in "priority host" form.
pub(crate) fn parse_mx_data(data: &str) -> Option<MxHost> {
    let mut parts = data.split_whitespace();
    let priority = parts.next()?.parse().ok()?;
    let host = parts.next()?.to_string();
    Some(MxHost { priority, host })
}

// ─── Resolver ────────────────────────────────────────────────────────────────

pub struct Resolver {
    restricted: bool,
    system: Option<TokioResolver>,
    direct: TokioResolver,
    doh_client: reqwest::Client,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_restricted(detect_restricted_environment())
    }

    pub fn with_restricted(restricted: bool) -> Self {
        let system = match TokioResolver::builder_tokio() {
            Ok(mut builder) => {
                builder.options_mut().timeout = SYSTEM_TIMEOUT;
                builder.options_mut().attempts = 1;
                Some(builder.build())
            }
            Err(e) => {
                warn!(error = %e, "system resolver configuration unavailable");
                None
            }
        };

        let group = NameServerConfigGroup::from_ips_clear(&PUBLIC_RESOLVERS, 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = DIRECT_UDP_TIMEOUT;
        builder.options_mut().attempts = 1;
        let direct = builder.build();

        let doh_client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self { restricted, system, direct, doh_client }
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub async fn lookup_ns(&self, domain: &str) -> ResolveResult<Vec<String>> {
        self.query(domain, QueryType::Ns).await
    }

    pub async fn lookup_mx(&self, domain: &str) -> ResolveResult<Vec<MxHost>> {
        let answers = self.query(domain, QueryType::Mx).await?;
        Ok(answers.iter().filter_map(|a| parse_mx_data(a)).collect())
    }

    pub async fn lookup_txt(&self, domain: &str) -> ResolveResult<Vec<String>> {
        self.query(domain, QueryType::Txt).await
    }

    /// A and AAAA answers combined.
    pub async fn lookup_ips(&self, domain: &str) -> ResolveResult<Vec<IpAddr>> {
        let mut answers = self.query(domain, QueryType::A).await?;
        answers.extend(self.query(domain, QueryType::Aaaa).await?);
        Ok(answers.iter().filter_map(|a| a.parse().ok()).collect())
    }

    async fn query(&self, domain: &str, qtype: QueryType) -> ResolveResult<Vec<String>> {
        first_success(tier_plan(self.restricted), |tier| {
            self.query_tier(tier, domain, qtype)
        })
        .await
    }

    async fn query_tier(
        &self,
        tier: Tier,
        domain: &str,
        qtype: QueryType,
    ) -> ResolveResult<Vec<String>> {
        match tier {
            Tier::System => match &self.system {
                Some(resolver) => hickory_lookup(resolver, domain, qtype, "system").await,
                None => Err(ResolveError::Lookup {
                    tier: "system",
                    domain: domain.to_string(),
                    message: "no system resolver configuration".to_string(),
                }),
            },
            Tier::DirectUdp => hickory_lookup(&self.direct, domain, qtype, "direct-udp").await,
            Tier::DoH => self.doh_query(domain, qtype).await,
        }
    }

    async fn doh_query(&self, domain: &str, qtype: QueryType) -> ResolveResult<Vec<String>> {
        let mut last_err: Option<ResolveError> = None;
        for endpoint in DOH_ENDPOINTS {
            let url = format!("{endpoint}?name={domain}&type={}", qtype.as_str());
            let result = async {
                let body: DohResponse = self
                    .doh_client
                    .get(&url)
                    .header("Accept", "application/dns-json")
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                parse_doh_answers(&body, qtype)
            }
            .await;
            match result {
                Ok(answers) => return Ok(answers),
                Err(e) => {
                    debug!(endpoint, error = %e, "doh endpoint failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one doh endpoint is configured"))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

async fn hickory_lookup(
    resolver: &TokioResolver,
    domain: &str,
    qtype: QueryType,
    tier: &'static str,
) -> ResolveResult<Vec<String>> {
    match resolver.lookup(domain, qtype.wire()).await {
        Ok(lookup) => Ok(lookup
            .iter()
            .filter_map(|rdata| match qtype {
                QueryType::Ns => rdata.as_ns().map(|ns| ns.to_string()),
                QueryType::Mx => rdata
                    .as_mx()
                    .map(|mx| format!("{} {}", mx.preference(), mx.exchange())),
                QueryType::Txt => rdata.as_txt().map(|txt| txt.to_string()),
                QueryType::A => rdata.as_a().map(|a| a.to_string()),
                QueryType::Aaaa => rdata.as_aaaa().map(|aaaa| aaaa.to_string()),
            })
            .collect()),
        // An authoritative "no such records" is an answer, not a failure.
        Err(e) if e.is_no_records_found() => Ok(Vec::new()),
        Err(e) => Err(ResolveError::Lookup {
            tier,
            domain: domain.to_string(),
            message: e.to_string(),
        }),
    }
}

// ─── DoH JSON ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

/// Validate and flatten a DoH response: `Status` must be zero, and only
/// answers of the queried type count (CNAME chains show up inline).
fn parse_doh_answers(body: &DohResponse, qtype: QueryType) -> ResolveResult<Vec<String>> {
    if body.status != 0 {
        return Err(ResolveError::DohStatus { status: body.status });
    }
    Ok(body
        .answer
        .iter()
        .filter(|a| a.rtype == qtype.wire_code())
        .map(|a| {
            let data = a.data.trim();
            if qtype == QueryType::Txt {
                data.trim_matches('"').to_string()
            } else {
                data.to_string()
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_tier_plan_restricted_collapses_to_system() {
        assert_eq!(tier_plan(true), &[Tier::System]);
        assert_eq!(tier_plan(false), &[Tier::System, Tier::DirectUdp, Tier::DoH]);
    }

    #[tokio::test]
    async fn test_first_success_skips_later_tiers() {
        let calls = Cell::new(0u32);
        let result = first_success(tier_plan(false), |_tier| {
            calls.set(calls.get() + 1);
            async { Ok::<_, ResolveError>(vec!["answer".to_string()]) }
        })
        .await
        .expect("first tier answers");
        assert_eq!(result, vec!["answer".to_string()]);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_first_success_falls_through_on_failure() {
        let calls = Cell::new(0u32);
        let result = first_success(tier_plan(false), |tier| {
            calls.set(calls.get() + 1);
            async move {
                if tier == Tier::DoH {
                    Ok(vec!["doh".to_string()])
                } else {
                    Err(ResolveError::Lookup {
                        tier: "x",
                        domain: "d".to_string(),
                        message: "boom".to_string(),
                    })
                }
            }
        })
        .await
        .expect("last tier answers");
        assert_eq!(result, vec!["doh".to_string()]);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_first_success_surfaces_last_error() {
        let err = first_success(tier_plan(true), |_tier| async {
            Err::<Vec<String>, _>(ResolveError::Lookup {
                tier: "system",
                domain: "d".to_string(),
                message: "refused".to_string(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::Lookup { tier: "system", .. }));
    }

    #[test]
    fn test_parse_mx_data() {
        let mx = parse_mx_data("10 aspmx.l.google.com.").expect("parse");
        assert_eq!(mx.priority, 10);
        assert_eq!(mx.host, "aspmx.l.google.com.");
        assert!(parse_mx_data("notanumber host").is_none());
        assert!(parse_mx_data("").is_none());
    }

    #[test]
    fn test_doh_ns_answers_filtered_by_type() {
        let body = DohResponse {
            status: 0,
            answer: vec![
                DohAnswer { rtype: 2, data: "ns1.example.com.".to_string() },
                DohAnswer { rtype: 2, data: "ns2.example.com.".to_string() },
                DohAnswer { rtype: 46, data: "rrsig-noise".to_string() },
            ],
        };
        let answers = parse_doh_answers(&body, QueryType::Ns).expect("parse");
        assert_eq!(answers, vec!["ns1.example.com.", "ns2.example.com."]);
    }

    #[test]
    fn test_doh_nonzero_status_is_error() {
        let body = DohResponse { status: 3, answer: vec![] };
        assert!(matches!(
            parse_doh_answers(&body, QueryType::Ns),
            Err(ResolveError::DohStatus { status: 3 })
        ));
    }

    #[test]
    fn test_doh_txt_quotes_stripped() {
        let body = DohResponse {
            status: 0,
            answer: vec![DohAnswer { rtype: 16, data: "\"v=spf1 -all\"".to_string() }],
        };
        let answers = parse_doh_answers(&body, QueryType::Txt).expect("parse");
        assert_eq!(answers, vec!["v=spf1 -all"]);
    }

    #[test]
    fn test_doh_mx_data_shape() {
        let body = DohResponse {
            status: 0,
            answer: vec![DohAnswer { rtype: 15, data: "5 mail.example.com.".to_string() }],
        };
        let answers = parse_doh_answers(&body, QueryType::Mx).expect("parse");
        let mx = parse_mx_data(&answers[0]).expect("mx");
        assert_eq!(mx.priority, 5);
    }
}
