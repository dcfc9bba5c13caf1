//! Customer layer: per-customer provider credentials and venture records.
//!
//! Customers live in a single JSON file, indexed by id. Credential fields may
//! hold an environment reference of the form `${NAME}`, resolved (and
//! trimmed) at use-time. Enabling a venture renders a fixed service-record
//! template against the customer's root domain.

#![forbid(unsafe_code)]

pub mod ventures;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("customer '{0}' not found")]
    NotFound(String),

    #[error("invalid customer entry: {0}")]
    Invalid(String),

    #[error("duplicate customer id '{0}'")]
    Duplicate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CustomerResult<T> = Result<T, CustomerError>;

// ─── Model ───────────────────────────────────────────────────────────────────

/// Credentials a customer holds for one provider. Values may be literal or
/// `${VAR}` environment references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub project_id: Option<String>,
    pub dns_token: Option<String>,
    pub cloud_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub root_domain: String,
    /// Venture names currently enabled for this customer.
    #[serde(default)]
    pub ventures: Vec<String>,
    /// Provider name → credentials.
    #[serde(default)]
    pub credentials: HashMap<String, CredentialBundle>,
}

impl Customer {
    pub fn dns_token(&self, provider: &str) -> Option<String> {
        self.credentials
            .get(provider)
            .and_then(|c| c.dns_token.as_deref())
            .map(resolve_credential)
    }

    pub fn cloud_token(&self, provider: &str) -> Option<String> {
        self.credentials
            .get(provider)
            .and_then(|c| c.cloud_token.as_deref())
            .map(resolve_credential)
    }

    /// A DNS client bound to this customer's token for `provider`. `None`
    /// when the customer holds no usable token (absent, or an env reference
    /// that resolves to empty).
    pub fn dns_provider(&self, provider: &str) -> Option<morpheus_dns::HetznerDnsProvider> {
        let token = self.dns_token(provider)?;
        if token.is_empty() {
            return None;
        }
        Some(morpheus_dns::HetznerDnsProvider::new(token))
    }

    fn validate(&self) -> CustomerResult<()> {
        if self.id.trim().is_empty() {
            return Err(CustomerError::Invalid("empty id".to_string()));
        }
        if self.root_domain.trim().is_empty() {
            return Err(CustomerError::Invalid(format!(
                "customer '{}' has no root domain",
                self.id
            )));
        }
        Ok(())
    }
}

/// Resolve a credential value: `${NAME}` becomes the trimmed environment
/// value (empty when unset); anything else is returned verbatim.
pub fn resolve_credential(value: &str) -> String {
    resolve_credential_with(value, |var| std::env::var(var).ok())
}

fn resolve_credential_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match value.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(var) => lookup(var).unwrap_or_default().trim().to_string(),
        None => value.to_string(),
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct CustomerStore {
    customers: HashMap<String, Customer>,
}

impl CustomerStore {
    /// Load and validate the customer file (a JSON array of customers).
    pub fn load(path: &Path) -> CustomerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<Customer> = serde_json::from_str(&content)?;
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<Customer>) -> CustomerResult<Self> {
        let mut customers = HashMap::new();
        for customer in entries {
            customer.validate()?;
            if customers.contains_key(&customer.id) {
                return Err(CustomerError::Duplicate(customer.id));
            }
            customers.insert(customer.id.clone(), customer);
        }
        debug!(count = customers.len(), "loaded customers");
        Ok(Self { customers })
    }

    pub fn get(&self, id: &str) -> CustomerResult<&Customer> {
        self.customers
            .get(id)
            .ok_or_else(|| CustomerError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<&Customer> {
        self.customers.values().collect()
    }
}
