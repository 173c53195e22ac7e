//! Certificate and ACME account records.
//!
//! A [`CertificateRecord`] is the unit the store persists and the TLS terminator serves.
//! Validity bounds are read from the leaf certificate when the record is built, so a record
//! can never claim a window its certificate does not have.
use std::{collections::BTreeSet, io::BufReader};

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::extensions::GeneralName;

/// Errors raised while building or decoding a certificate record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("PEM input contains no certificate")]
    NoCertificate,

    #[error("PEM input contains no private key")]
    NoPrivateKey,

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Failed to parse X.509 certificate: {0}")]
    Parse(String),

    #[error("Certificate does not cover hostname '{hostname}' (names: {names:?})")]
    HostnameMismatch {
        hostname: String,
        names: Vec<String>,
    },
}

/// Where a certificate came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssuanceSource {
    /// Issued through the ACME directory at `directory`.
    Acme { directory: String },
    /// Supplied by the operator.
    Manual,
}

/// The one active certificate for a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub hostname: String,
    /// Leaf first, then intermediates.
    pub certificate_chain_pem: String,
    pub private_key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub source: IssuanceSource,
    pub issued_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record from a PEM chain and key, reading the validity window from the leaf.
    ///
    /// Fails if the chain or key cannot be decoded, or if the leaf does not name `hostname`.
    pub fn from_pem(
        hostname: &str,
        certificate_chain_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
        source: IssuanceSource,
    ) -> Result<Self, CertificateError> {
        let certificate_chain_pem = certificate_chain_pem.into();
        let private_key_pem = private_key_pem.into();

        let chain = decode_chain(&certificate_chain_pem)?;
        decode_key(&private_key_pem)?;

        let leaf = LeafInfo::parse(&chain[0])?;
        if !leaf.covers(hostname) {
            return Err(CertificateError::HostnameMismatch {
                hostname: hostname.to_string(),
                names: leaf.names,
            });
        }

        Ok(Self {
            hostname: hostname.to_string(),
            certificate_chain_pem,
            private_key_pem,
            not_before: leaf.not_before,
            not_after: leaf.not_after,
            source,
            issued_at: Utc::now(),
        })
    }

    /// `not_before <= now <= not_after`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// True when the record is not servable or expires within `threshold` of `now`.
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        !self.is_valid_at(now) || self.not_after - now <= threshold
    }

    pub fn is_manual(&self) -> bool {
        self.source == IssuanceSource::Manual
    }

    pub fn certificate_chain(&self) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
        decode_chain(&self.certificate_chain_pem)
    }

    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, CertificateError> {
        decode_key(&self.private_key_pem)
    }
}

fn decode_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::InvalidPem(e.to_string()))?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificate);
    }
    Ok(chain)
}

fn decode_key(pem: &str) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertificateError::InvalidPem(e.to_string()))?
        .ok_or(CertificateError::NoPrivateKey)
}

struct LeafInfo {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    names: Vec<String>,
}

impl LeafInfo {
    fn parse(der: &CertificateDer<'_>) -> Result<Self, CertificateError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| CertificateError::Parse("notBefore out of range".to_string()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| CertificateError::Parse("notAfter out of range".to_string()))?;

        let mut names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_ascii_lowercase());
                }
            }
        }
        if names.is_empty() {
            for cn in cert.subject().iter_common_name() {
                if let Ok(cn) = cn.as_str() {
                    names.push(cn.to_ascii_lowercase());
                }
            }
        }

        Ok(Self {
            not_before,
            not_after,
            names,
        })
    }

    fn covers(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.names.iter().any(|name| match name.strip_prefix("*.") {
            Some(suffix) => hostname
                .split_once('.')
                .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
            None => *name == hostname,
        })
    }
}

/// Persistent state of one ACME account, keyed by directory URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub directory_url: String,
    /// Registration URI returned by the CA
    pub account_url: String,
    pub contact: Vec<String>,
    /// Serialized client credentials, including the account key
    pub credentials: serde_json::Value,
    /// Hostnames this account has completed orders for
    #[serde(default)]
    pub authorized_domains: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{test_support::self_signed, *};

    #[test]
    fn test_from_pem_reads_validity_window() {
        let now = Utc::now();
        let (cert, key) = self_signed("example.com", now - Duration::days(2), now + Duration::days(60));

        let record =
            CertificateRecord::from_pem("example.com", cert, key, IssuanceSource::Manual).unwrap();

        assert!(record.is_valid_at(now));
        assert!(record.not_after > now + Duration::days(58));
        assert!(record.is_manual());
        assert_eq!(record.certificate_chain().unwrap().len(), 1);
    }

    #[test]
    fn test_needs_renewal_threshold() {
        let now = Utc::now();
        let (cert, key) = self_signed("example.com", now - Duration::days(2), now + Duration::days(20));
        let record = CertificateRecord::from_pem(
            "example.com",
            cert,
            key,
            IssuanceSource::Acme {
                directory: "https://ca.test/dir".to_string(),
            },
        )
        .unwrap();

        assert!(record.needs_renewal(now, Duration::days(30)));
        assert!(!record.needs_renewal(now, Duration::days(10)));
        assert!(record.needs_renewal(now + Duration::days(40), Duration::days(10)));
    }

    #[test]
    fn test_from_pem_rejects_other_hostname() {
        let now = Utc::now();
        let (cert, key) = self_signed("other.com", now - Duration::days(1), now + Duration::days(60));

        let err = CertificateRecord::from_pem("example.com", cert, key, IssuanceSource::Manual)
            .unwrap_err();
        assert!(matches!(err, CertificateError::HostnameMismatch { .. }));
    }

    #[test]
    fn test_wildcard_covers_single_label() {
        let now = Utc::now();
        let (cert, key) =
            self_signed("*.example.com", now - Duration::days(1), now + Duration::days(60));

        assert!(
            CertificateRecord::from_pem("www.example.com", cert.clone(), key.clone(), IssuanceSource::Manual)
                .is_ok()
        );
        assert!(CertificateRecord::from_pem("a.b.example.com", cert, key, IssuanceSource::Manual).is_err());
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert_eq!(
            CertificateRecord::from_pem("example.com", "nope", "nope", IssuanceSource::Manual),
            Err(CertificateError::NoCertificate)
        );
    }
}
