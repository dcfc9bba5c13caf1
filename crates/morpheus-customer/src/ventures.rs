//! Venture service records.
//!
//! A venture is a hosted service bundle. Enabling one renders a fixed
//! template of (sub-name, type, value) tuples against the customer's root
//! domain and creates the records; disabling deletes them symmetrically.

use crate::Customer;
use morpheus_dns::{DnsProvider, DnsResult, Record, RecordType};
use tracing::info;

/// One rendered template entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VentureRecord {
    pub name: String,
    pub rtype: RecordType,
    pub value: String,
}

/// The fixed record template for a venture, rendered against a root domain:
/// the venture endpoint, its www alias, and a discovery TXT marker.
pub fn venture_template(venture: &str, root_domain: &str) -> Vec<VentureRecord> {
    vec![
        VentureRecord {
            name: venture.to_string(),
            rtype: RecordType::CNAME,
            value: format!("edge.{root_domain}"),
        },
        VentureRecord {
            name: format!("www.{venture}"),
            rtype: RecordType::CNAME,
            value: format!("{venture}.{root_domain}"),
        },
        VentureRecord {
            name: format!("_venture.{venture}"),
            rtype: RecordType::TXT,
            value: format!("venture={venture}"),
        },
    ]
}

/// Create every template record for `venture` under the customer's root
/// domain.
pub async fn enable_venture(
    dns: &dyn DnsProvider,
    customer: &Customer,
    venture: &str,
) -> DnsResult<Vec<Record>> {
    let mut created = Vec::new();
    for entry in venture_template(venture, &customer.root_domain) {
        let record = dns
            .create_record(
                &customer.root_domain,
                &entry.name,
                entry.rtype,
                &entry.value,
                None,
            )
            .await?;
        created.push(record);
    }
    info!(customer = %customer.id, venture, records = created.len(), "venture enabled");
    Ok(created)
}

/// Delete every template record for `venture`. Deleting records that were
/// never created succeeds, so disable is idempotent.
pub async fn disable_venture(
    dns: &dyn DnsProvider,
    customer: &Customer,
    venture: &str,
) -> DnsResult<()> {
    for entry in venture_template(venture, &customer.root_domain) {
        dns.delete_record(&customer.root_domain, &entry.name, entry.rtype)
            .await?;
    }
    info!(customer = %customer.id, venture, "venture disabled");
    Ok(())
}
