//! ACME (RFC 8555) certificate authority using HTTP-01 challenges.
//!
//! One account is kept per directory URL. It is created on first use, persisted through
//! the certificate store and reused for every later order until an explicit reset.
#![allow(clippy::collapsible_if)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DnType, KeyPair};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::models::AcmeConfig,
    core::{certificate::AccountRecord, challenge::ChallengeManager},
    ports::{
        certificate_authority::{CertificateAuthority, IssuanceError, IssuedCertificate},
        certificate_store::CertificateStore,
    },
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Map a client error onto the retry policy.
fn classify(context: &str, error: instant_acme::Error) -> IssuanceError {
    match &error {
        instant_acme::Error::Api(problem) => {
            let kind = problem.r#type.as_deref().unwrap_or_default();
            let transient = ["rateLimited", "serverInternal", "badNonce"]
                .iter()
                .any(|t| kind.ends_with(t));
            let message = format!("{context}: {error}");
            if transient {
                IssuanceError::Transient(message)
            } else {
                IssuanceError::Permanent(message)
            }
        }
        _ => IssuanceError::Transient(format!("{context}: {error}")),
    }
}

fn local_failure(context: &str, error: impl std::fmt::Display) -> IssuanceError {
    IssuanceError::Permanent(format!("{context}: {error}"))
}

/// Settings for [`AcmeAuthority`].
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub contact_email: Option<String>,
    /// Longest a single order may take from creation to certificate download
    pub order_timeout: Duration,
    pub poll_interval: Duration,
}

impl AcmeSettings {
    pub fn new(directory_url: impl Into<String>, contact_email: Option<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email,
            order_timeout: Duration::from_secs(90),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct AcmeAuthority {
    settings: AcmeSettings,
    store: Arc<dyn CertificateStore>,
    challenges: ChallengeManager,
    account: Mutex<Option<Account>>,
}

impl AcmeAuthority {
    pub fn new(
        settings: AcmeSettings,
        store: Arc<dyn CertificateStore>,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            settings,
            store,
            challenges,
            account: Mutex::new(None),
        }
    }

    /// Authority for the `[acme]` section. Nothing is contacted until the first order, so
    /// it is built even when no site uses ACME yet and a reload can add one later.
    pub fn from_config(
        acme: &AcmeConfig,
        store: Arc<dyn CertificateStore>,
        challenges: ChallengeManager,
    ) -> Self {
        Self::new(
            AcmeSettings::new(acme.directory(), acme.email.clone()),
            store,
            challenges,
        )
    }

    /// Restore the persisted account for this directory, or register a new one.
    async fn account(&self) -> Result<Account, IssuanceError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let directory = &self.settings.directory_url;
        let stored = self
            .store
            .load_account(directory)
            .await
            .map_err(|e| IssuanceError::Transient(format!("Failed to load ACME account: {e}")))?;

        let account = match stored {
            Some(record) => {
                debug!(account_url = %record.account_url, "Restoring ACME account from store");
                let credentials: AccountCredentials = serde_json::from_value(record.credentials)
                    .map_err(|e| local_failure("Stored ACME credentials are unreadable", e))?;
                Account::from_credentials(credentials)
                    .await
                    .map_err(|e| classify("Failed to restore ACME account", e))?
            }
            None => self.register().await?,
        };

        *cached = Some(account.clone());
        Ok(account)
    }

    async fn register(&self) -> Result<Account, IssuanceError> {
        let email = self.settings.contact_email.as_deref().ok_or_else(|| {
            IssuanceError::Permanent(
                "An ACME contact email is required to register an account".to_string(),
            )
        })?;
        let directory = &self.settings.directory_url;

        info!(email = %email, directory = %directory, "Creating new ACME account");
        let contact = format!("mailto:{email}");
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::create(&new_account, directory, None)
            .await
            .map_err(|e| classify("Failed to create ACME account", e))?;

        let record = AccountRecord {
            directory_url: directory.clone(),
            account_url: account.id().to_string(),
            contact: vec![contact],
            credentials: serde_json::to_value(&credentials)
                .map_err(|e| local_failure("Failed to serialize ACME credentials", e))?,
            authorized_domains: Default::default(),
            created_at: Utc::now(),
        };
        self.store
            .save_account(&record)
            .await
            .map_err(|e| IssuanceError::Transient(format!("Failed to persist ACME account: {e}")))?;

        info!(account_url = %record.account_url, "ACME account registered");
        Ok(account)
    }

    /// Add `hostname` to the stored account's authorized domains.
    async fn remember_domain(&self, hostname: &str) {
        // load-modify-save on the shared account file, one issuance at a time
        let _account = self.account.lock().await;
        let directory = &self.settings.directory_url;
        match self.store.load_account(directory).await {
            Ok(Some(mut record)) => {
                if record.authorized_domains.insert(hostname.to_string()) {
                    if let Err(e) = self.store.save_account(&record).await {
                        warn!(hostname = %hostname, error = %e, "Failed to record authorized domain");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(hostname = %hostname, error = %e, "Failed to load ACME account"),
        }
    }

    async fn publish_challenges(
        &self,
        order: &mut Order,
        hostname: &str,
    ) -> Result<(), IssuanceError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| classify("Failed to fetch authorizations", e))?;

        for auth in authorizations {
            debug!(hostname = %hostname, status = ?auth.status, "Processing authorization");
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    IssuanceError::Permanent(format!(
                        "CA offered no HTTP-01 challenge for '{hostname}'"
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .publish(&challenge.token, hostname, key_authorization.as_str())
                .await;

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| classify("Failed to mark challenge ready", e))?;
        }
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        order: &mut Order,
        hostname: &str,
        deadline: Instant,
    ) -> Result<(), IssuanceError> {
        loop {
            if Instant::now() > deadline {
                return Err(IssuanceError::Transient(format!(
                    "Validation for '{hostname}' did not complete in time"
                )));
            }

            let state = order
                .refresh()
                .await
                .map_err(|e| classify("Failed to refresh order", e))?;
            debug!(hostname = %hostname, status = ?state.status, "Order status");

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|p| format!("{p:?}"))
                        .unwrap_or_else(|| "unknown reason".to_string());
                    return Err(IssuanceError::Permanent(format!(
                        "Order for '{hostname}' became invalid: {reason}"
                    )));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    async fn run_order(&self, hostname: &str) -> Result<IssuedCertificate, IssuanceError> {
        let deadline = Instant::now() + self.settings.order_timeout;
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| classify("Failed to create order", e))?;

        self.publish_challenges(&mut order, hostname).await?;
        self.wait_until_ready(&mut order, hostname, deadline).await?;

        let key_pair = KeyPair::generate().map_err(|e| local_failure("Key generation failed", e))?;
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| local_failure("Invalid certificate parameters", e))?;
        params.distinguished_name.push(DnType::CommonName, hostname);
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| local_failure("CSR generation failed", e))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| classify("Failed to finalize order", e))?;
        }

        let chain = loop {
            if Instant::now() > deadline {
                return Err(IssuanceError::Transient(format!(
                    "Certificate for '{hostname}' was not issued in time"
                )));
            }
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => tokio::time::sleep(self.settings.poll_interval).await,
                Err(e) => return Err(classify("Failed to download certificate", e)),
            }
        };

        self.remember_domain(hostname).await;
        Ok(IssuedCertificate {
            certificate_chain_pem: chain,
            private_key_pem: key_pair.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, IssuanceError> {
        info!(hostname = %hostname, directory = %self.settings.directory_url, "Starting ACME order");
        let result = self.run_order(hostname).await;
        self.challenges.withdraw_host(hostname).await;

        if let Err(e) = &result {
            // forget the account handle; the next attempt restores it from the store
            if matches!(e, IssuanceError::Permanent(_)) {
                *self.account.lock().await = None;
            }
        }
        result
    }

    fn directory_url(&self) -> &str {
        &self.settings.directory_url
    }
}
