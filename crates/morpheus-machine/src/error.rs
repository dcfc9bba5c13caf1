//! Machine backend error kinds.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend rejected our credentials. Carries remediation guidance and
    /// preserves the underlying cause.
    #[error("authentication failed: {remediation}")]
    AuthFailed {
        remediation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("server '{0}' not found")]
    NotFound(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("api token is not printable ASCII: {0}")]
    InvalidToken(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<morpheus_proxmox::ProxmoxError> for ProviderError {
    fn from(e: morpheus_proxmox::ProxmoxError) -> Self {
        use morpheus_proxmox::ProxmoxError;
        match e {
            ProxmoxError::AuthFailed { .. } => Self::AuthFailed {
                remediation: "verify the Proxmox API token id and secret, and that the \
                              token carries VM.Audit/VM.PowerMgmt privileges"
                    .to_string(),
                source: e.into(),
            },
            ProxmoxError::Timeout { what, waited } => Self::Timeout { what, waited },
            ProxmoxError::Cancelled => Self::Cancelled,
            other => Self::Backend(other.into()),
        }
    }
}
