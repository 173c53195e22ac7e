//! Certificate lifecycle: the `ensure` operation and its caches.
//!
//! [`CertificateManager`] is the explicit shared handle the TLS terminator, the renewal
//! scheduler and the CLI work through. It owns:
//!
//! * a write-through memory cache over the [`CertificateStore`],
//! * one async mutex per hostname so at most one issuance runs for a name,
//! * per-hostname backoff state after failed issuance.
//!
//! The fast path (a cached, fresh record) takes no lock and performs no I/O. Anything
//! slower runs on a spawned task, so a caller that stops waiting (a handshake deadline,
//! a dropped connection) never cancels an order halfway or skips the backoff bookkeeping.
#![allow(clippy::collapsible_if)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use rand::Rng;
use scc::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    config::models::{AcmeConfig, SiteTls},
    core::{
        certificate::{CertificateError, CertificateRecord, IssuanceSource},
        router::{DomainEntry, normalize_hostname},
    },
    metrics,
    ports::{
        certificate_authority::{CertificateAuthority, IssuanceError},
        certificate_store::{CertificateStore, StoreError},
    },
};

#[derive(Error, Debug)]
pub enum EnsureError {
    #[error("Issuance failed for {hostname}: {source}")]
    Issuance {
        hostname: String,
        #[source]
        source: IssuanceError,
    },

    #[error("Issuance for {hostname} is backing off for another {retry_in:?}")]
    BackingOff { hostname: String, retry_in: Duration },

    #[error("Storage error for {hostname}: {source}")]
    Store {
        hostname: String,
        #[source]
        source: StoreError,
    },

    #[error("Certificate for {hostname} is unusable: {source}")]
    Certificate {
        hostname: String,
        #[source]
        source: CertificateError,
    },

    #[error("No valid manual certificate for {0}")]
    ManualUnavailable(String),

    #[error("No certificate authority configured to issue for {0}")]
    NoAuthority(String),

    #[error("Issuance task for {0} stopped before completing")]
    Interrupted(String),
}

impl EnsureError {
    /// Whether another inline attempt may succeed.
    fn is_retryable(&self) -> bool {
        match self {
            EnsureError::Issuance { source, .. } => source.is_transient(),
            EnsureError::Store { .. } => true,
            _ => false,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            EnsureError::Issuance { source, .. } if source.is_transient() => "transient",
            EnsureError::Issuance { .. } => "permanent",
            EnsureError::Store { .. } => "store_failed",
            EnsureError::Certificate { .. } => "invalid_certificate",
            _ => "skipped",
        }
    }
}

/// Knobs for [`CertificateManager`], usually taken from `[acme]`.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub renewal_threshold: chrono::Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Attempts made inline when no valid record exists
    pub max_attempts: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&AcmeConfig::default())
    }
}

impl From<&AcmeConfig> for ManagerSettings {
    fn from(acme: &AcmeConfig) -> Self {
        Self {
            renewal_threshold: acme.renewal_threshold(),
            retry_base: acme.retry_base(),
            retry_max: acme.retry_max(),
            max_attempts: acme.max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Delay before the next attempt after `failures` consecutive failures, without jitter.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

pub struct CertificateManager {
    store: Arc<dyn CertificateStore>,
    authority: Option<Arc<dyn CertificateAuthority>>,
    settings: ManagerSettings,
    cache: HashMap<String, Arc<CertificateRecord>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    backoff: HashMap<String, Backoff>,
}

impl CertificateManager {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        authority: Option<Arc<dyn CertificateAuthority>>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            authority,
            settings,
            cache: HashMap::new(),
            locks: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    /// Return a servable certificate for `entry`, issuing through ACME when due.
    pub async fn ensure_site(
        self: &Arc<Self>,
        entry: &DomainEntry,
    ) -> Result<Arc<CertificateRecord>, EnsureError> {
        match entry.tls {
            SiteTls::Acme => self.ensure(&entry.hostname).await,
            SiteTls::Manual { .. } => self.manual(&entry.hostname).await,
        }
    }

    /// Return the stored record for `hostname` if it is fresh; otherwise obtain a new one.
    ///
    /// While a record is valid and outside the renewal threshold this performs no network
    /// call. Failed renewals keep the previous record in service until it expires.
    pub async fn ensure(
        self: &Arc<Self>,
        hostname: &str,
    ) -> Result<Arc<CertificateRecord>, EnsureError> {
        let hostname = normalize_hostname(hostname);

        if let Some(record) = self.cached(&hostname).await {
            if !record.needs_renewal(Utc::now(), self.settings.renewal_threshold) {
                return Ok(record);
            }
        }

        let manager = self.clone();
        let task_hostname = hostname.clone();
        tokio::spawn(async move { manager.ensure_locked(task_hostname).await })
            .await
            .map_err(|_| EnsureError::Interrupted(hostname))?
    }

    /// Slow path of [`ensure`](Self::ensure), serialized per hostname.
    async fn ensure_locked(&self, hostname: String) -> Result<Arc<CertificateRecord>, EnsureError> {
        let threshold = self.settings.renewal_threshold;
        let lock = self.lock_for(&hostname).await;
        let _guard = lock.lock().await;

        // whoever held the lock before us may have renewed already
        let current = self.current(&hostname).await?;
        let now = Utc::now();
        if let Some(record) = &current {
            if !record.needs_renewal(now, threshold) {
                return Ok(record.clone());
            }
        }
        let fallback = current.filter(|record| record.is_valid_at(now));

        if let Some(retry_in) = self.backoff_remaining(&hostname).await {
            return match fallback {
                Some(record) => Ok(record),
                None => Err(EnsureError::BackingOff { hostname, retry_in }),
            };
        }

        let attempts = if fallback.is_some() {
            1
        } else {
            self.settings.max_attempts
        };

        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match self.issue_and_store(&hostname).await {
                Ok(record) => {
                    let _ = self.backoff.remove_async(&hostname).await;
                    return Ok(record);
                }
                Err(e) => {
                    let delay = self.record_failure(&hostname).await;
                    metrics::increment_certificates_issued(&hostname, e.outcome());
                    tracing::warn!(
                        hostname = %hostname,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "Certificate issuance attempt failed"
                    );
                    if attempt >= attempts || !e.is_retryable() {
                        break e;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match fallback {
            Some(record) => {
                tracing::warn!(
                    hostname = %hostname,
                    not_after = %record.not_after,
                    "Renewal failed, keeping current certificate in service"
                );
                Ok(record)
            }
            None => Err(error),
        }
    }

    /// Return the operator supplied record for `hostname`. Never contacts the CA.
    pub async fn manual(&self, hostname: &str) -> Result<Arc<CertificateRecord>, EnsureError> {
        let hostname = normalize_hostname(hostname);
        match self.current(&hostname).await? {
            Some(record) if record.is_manual() && record.is_valid_at(Utc::now()) => Ok(record),
            _ => Err(EnsureError::ManualUnavailable(hostname)),
        }
    }

    /// Store an operator supplied certificate as the active record for `hostname`.
    pub async fn install_manual(
        &self,
        hostname: &str,
        certificate_chain_pem: String,
        private_key_pem: String,
    ) -> Result<Arc<CertificateRecord>, EnsureError> {
        let hostname = normalize_hostname(hostname);
        let record = CertificateRecord::from_pem(
            &hostname,
            certificate_chain_pem,
            private_key_pem,
            IssuanceSource::Manual,
        )
        .map_err(|source| EnsureError::Certificate {
            hostname: hostname.clone(),
            source,
        })?;

        let lock = self.lock_for(&hostname).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.current(&hostname).await? {
            if existing.is_manual()
                && existing.certificate_chain_pem == record.certificate_chain_pem
                && existing.private_key_pem == record.private_key_pem
            {
                return Ok(existing);
            }
        }

        self.commit(&hostname, record).await
    }

    /// Load every stored record into memory. Returns how many were loaded.
    pub async fn warm_cache(&self) -> Result<usize, StoreError> {
        let mut loaded = 0;
        for hostname in self.store.list().await? {
            match self.store.get(&hostname).await {
                Ok(Some(record)) => {
                    report_expiry(&record);
                    let _ = self
                        .cache
                        .upsert_async(hostname.clone(), Arc::new(record))
                        .await;
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(hostname = %hostname, error = %e, "Skipping unreadable certificate record");
                }
            }
        }
        Ok(loaded)
    }

    async fn cached(&self, hostname: &str) -> Option<Arc<CertificateRecord>> {
        self.cache.read_async(hostname, |_, r| r.clone()).await
    }

    /// Cache, falling back to the store.
    async fn current(&self, hostname: &str) -> Result<Option<Arc<CertificateRecord>>, EnsureError> {
        if let Some(record) = self.cached(hostname).await {
            return Ok(Some(record));
        }
        let stored = self
            .store
            .get(hostname)
            .await
            .map_err(|source| EnsureError::Store {
                hostname: hostname.to_string(),
                source,
            })?;
        Ok(match stored {
            Some(record) => {
                let record = Arc::new(record);
                let _ = self
                    .cache
                    .upsert_async(hostname.to_string(), record.clone())
                    .await;
                Some(record)
            }
            None => None,
        })
    }

    async fn lock_for(&self, hostname: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry_async(hostname.to_string())
            .await
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .get()
            .clone()
    }

    async fn backoff_remaining(&self, hostname: &str) -> Option<Duration> {
        let retry_at = self.backoff.read_async(hostname, |_, b| b.retry_at).await?;
        let now = Instant::now();
        (retry_at > now).then(|| retry_at - now)
    }

    async fn record_failure(&self, hostname: &str) -> Duration {
        let failures = self
            .backoff
            .read_async(hostname, |_, b| b.failures)
            .await
            .unwrap_or(0)
            + 1;
        let delay = with_jitter(backoff_delay(
            self.settings.retry_base,
            self.settings.retry_max,
            failures,
        ));
        let _ = self
            .backoff
            .upsert_async(
                hostname.to_string(),
                Backoff {
                    failures,
                    retry_at: Instant::now() + delay,
                },
            )
            .await;
        delay
    }

    async fn issue_and_store(&self, hostname: &str) -> Result<Arc<CertificateRecord>, EnsureError> {
        let authority = self
            .authority
            .as_ref()
            .ok_or_else(|| EnsureError::NoAuthority(hostname.to_string()))?;

        tracing::info!(hostname = %hostname, directory = %authority.directory_url(), "Requesting certificate");
        let issued = authority
            .issue(hostname)
            .await
            .map_err(|source| EnsureError::Issuance {
                hostname: hostname.to_string(),
                source,
            })?;

        let record = CertificateRecord::from_pem(
            hostname,
            issued.certificate_chain_pem,
            issued.private_key_pem,
            IssuanceSource::Acme {
                directory: authority.directory_url().to_string(),
            },
        )
        .map_err(|source| EnsureError::Certificate {
            hostname: hostname.to_string(),
            source,
        })?;

        let record = self.commit(hostname, record).await?;
        metrics::increment_certificates_issued(hostname, "issued");
        tracing::info!(
            hostname = %hostname,
            not_after = %record.not_after,
            "Certificate issued and stored"
        );
        Ok(record)
    }

    /// Persist, then publish to the cache. A failed write leaves both untouched.
    async fn commit(
        &self,
        hostname: &str,
        record: CertificateRecord,
    ) -> Result<Arc<CertificateRecord>, EnsureError> {
        self.store
            .put(hostname, &record)
            .await
            .map_err(|source| EnsureError::Store {
                hostname: hostname.to_string(),
                source,
            })?;
        report_expiry(&record);
        let record = Arc::new(record);
        let _ = self
            .cache
            .upsert_async(hostname.to_string(), record.clone())
            .await;
        Ok(record)
    }
}

fn report_expiry(record: &CertificateRecord) {
    let remaining = (record.not_after - Utc::now()).num_seconds() as f64;
    metrics::set_certificate_expiry(&record.hostname, remaining);
}
