use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single issuance attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    /// Network trouble, rate limiting or CA-side errors. Worth retrying later.
    #[error("Transient issuance failure: {0}")]
    Transient(String),

    /// Validation or policy failure. Retrying without operator action will not help.
    #[error("Issuance rejected: {0}")]
    Permanent(String),
}

impl IssuanceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IssuanceError::Transient(_))
    }
}

/// PEM output of a completed order.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_chain_pem: String,
    pub private_key_pem: String,
}

/// CertificateAuthority defines the port for obtaining a certificate for one hostname.
#[async_trait]
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Run one complete order for `hostname`.
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, IssuanceError>;

    /// Directory URL identifying this CA, recorded as the issuance source.
    fn directory_url(&self) -> &str;
}
