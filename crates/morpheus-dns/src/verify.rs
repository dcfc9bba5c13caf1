//! NS delegation and MX verification with structured diffs.

use crate::resolver::{ResolveResult, Resolver};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of comparing expected against observed nameservers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsResult {
    pub domain: String,
    pub matching: Vec<String>,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    /// Every expected nameserver answered.
    pub delegated: bool,
    /// Some, but not all, expected nameservers answered.
    pub partial: bool,
}

/// Outcome of comparing expected against observed MX hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MxResult {
    pub domain: String,
    pub matching: Vec<String>,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub configured: bool,
    pub partial: bool,
}

/// Hostname normalisation applied to both sides of every diff: lowercase,
/// trimmed, trailing dot stripped.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// (matching, missing, extra) between normalised expected and actual sets,
/// each sorted for stable output.
fn diff_hosts(expected: &[String], actual: &[String]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let expected: BTreeSet<String> = expected.iter().map(|h| normalize_host(h)).collect();
    let actual: BTreeSet<String> = actual.iter().map(|h| normalize_host(h)).collect();

    let matching = expected.intersection(&actual).cloned().collect();
    let missing = expected.difference(&actual).cloned().collect();
    let extra = actual.difference(&expected).cloned().collect();
    (matching, missing, extra)
}

/// Check that `domain` is delegated to the expected nameservers.
pub async fn verify_ns_delegation(
    resolver: &Resolver,
    domain: &str,
    expected: &[String],
) -> ResolveResult<NsResult> {
    let observed = resolver.lookup_ns(domain).await?;
    let (matching, missing, extra) = diff_hosts(expected, &observed);
    let delegated = missing.is_empty() && !expected.is_empty();
    let partial = !matching.is_empty() && !missing.is_empty();
    Ok(NsResult {
        domain: domain.to_string(),
        matching,
        missing,
        extra,
        delegated,
        partial,
    })
}

/// Check that `domain` routes mail through the expected MX hosts. Priorities
/// are not compared; the diff is over exchange hostnames.
pub async fn verify_mx_records(
    resolver: &Resolver,
    domain: &str,
    expected: &[String],
) -> ResolveResult<MxResult> {
    let observed: Vec<String> = resolver
        .lookup_mx(domain)
        .await?
        .into_iter()
        .map(|mx| mx.host)
        .collect();
    let (matching, missing, extra) = diff_hosts(expected, &observed);
    let configured = missing.is_empty() && !expected.is_empty();
    let partial = !matching.is_empty() && !missing.is_empty();
    Ok(MxResult {
        domain: domain.to_string(),
        matching,
        missing,
        extra,
        configured,
        partial,
    })
}
