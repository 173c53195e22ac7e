//! Background renewal scheduler.
//!
//! Every `check_interval` the scheduler walks the current routing snapshot and calls
//! `ensure` for each ACME site, so renewal normally happens off the handshake path.
//! Manual certificates are never renewed; the scheduler only warns as they near expiry.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::sleep;

use crate::{
    config::models::SiteTls,
    core::{certificate_manager::CertificateManager, challenge::ChallengeManager, router::SiteRouter},
    utils::ShutdownToken,
};

/// Challenges older than this are assumed abandoned.
const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(600);

/// Result of one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    pub checked: usize,
    pub failed: usize,
    pub manual_expiring: usize,
}

pub struct RenewalScheduler {
    router: Arc<SiteRouter>,
    certificates: Arc<CertificateManager>,
    challenges: ChallengeManager,
    interval: Duration,
}

impl RenewalScheduler {
    pub fn new(
        router: Arc<SiteRouter>,
        certificates: Arc<CertificateManager>,
        challenges: ChallengeManager,
        interval: Duration,
    ) -> Self {
        Self {
            router,
            certificates,
            challenges,
            interval,
        }
    }

    /// Scan immediately, then every interval until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        tracing::info!(interval = ?self.interval, "Starting certificate renewal scheduler");
        loop {
            tokio::select! {
                _ = self.check_all() => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
        tracing::info!("Certificate renewal scheduler stopped");
    }

    /// Run `ensure` for every configured site once.
    pub async fn check_all(&self) -> RenewalReport {
        let snapshot = self.router.snapshot();
        let threshold = self.certificates.settings().renewal_threshold;
        let mut report = RenewalReport::default();

        for entry in snapshot.entries() {
            report.checked += 1;
            match &entry.tls {
                SiteTls::Acme => {
                    if let Err(e) = self.certificates.ensure(&entry.hostname).await {
                        report.failed += 1;
                        tracing::warn!(hostname = %entry.hostname, error = %e, "Scheduled renewal failed");
                    }
                }
                SiteTls::Manual { cert_path, .. } => {
                    match self.certificates.manual(&entry.hostname).await {
                        Ok(record) if record.needs_renewal(Utc::now(), threshold) => {
                            report.manual_expiring += 1;
                            tracing::warn!(
                                hostname = %entry.hostname,
                                cert_path = %cert_path,
                                not_after = %record.not_after,
                                "Manual certificate expires soon, replace it"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            report.failed += 1;
                            tracing::error!(hostname = %entry.hostname, error = %e, "Manual certificate unavailable");
                        }
                    }
                }
            }
        }

        let purged = self.challenges.purge_older_than(CHALLENGE_MAX_AGE).await;
        if purged > 0 {
            tracing::debug!(purged, "Purged stale HTTP-01 challenges");
        }

        tracing::info!(
            checked = report.checked,
            failed = report.failed,
            manual_expiring = report.manual_expiring,
            "Renewal scan complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        adapters::file_store::FileCertificateStore,
        config::models::SiteConfig,
        core::{
            certificate::test_support::self_signed,
            certificate_manager::ManagerSettings,
        },
        ports::certificate_authority::{
            CertificateAuthority, IssuanceError, IssuedCertificate,
        },
    };

    struct CountingAuthority {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateAuthority for CountingAuthority {
        async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            let (cert, key) = self_signed(
                hostname,
                now - ChronoDuration::days(1),
                now + ChronoDuration::days(90),
            );
            Ok(IssuedCertificate {
                certificate_chain_pem: cert,
                private_key_pem: key,
            })
        }

        fn directory_url(&self) -> &str {
            "https://ca.test/directory"
        }
    }

    #[tokio::test]
    async fn test_scan_issues_once_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCertificateStore::open(dir.path()).await.unwrap());
        let authority = Arc::new(CountingAuthority {
            calls: AtomicUsize::new(0),
        });
        let manager = Arc::new(CertificateManager::new(
            store,
            Some(authority.clone() as Arc<dyn CertificateAuthority>),
            ManagerSettings::default(),
        ));
        let router = Arc::new(
            SiteRouter::new(&[SiteConfig {
                hostname: "example.com".to_string(),
                upstream: "backend:5000".to_string(),
                tls: SiteTls::Acme,
            }])
            .unwrap(),
        );
        let scheduler = RenewalScheduler::new(
            router,
            manager,
            ChallengeManager::new(),
            Duration::from_secs(3600),
        );

        let first = scheduler.check_all().await;
        assert_eq!(first.checked, 1);
        assert_eq!(first.failed, 0);
        scheduler.check_all().await;

        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_near_expiry_is_reported_not_renewed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCertificateStore::open(dir.path()).await.unwrap());
        let authority = Arc::new(CountingAuthority {
            calls: AtomicUsize::new(0),
        });
        let manager = Arc::new(CertificateManager::new(
            store,
            Some(authority.clone() as Arc<dyn CertificateAuthority>),
            ManagerSettings::default(),
        ));

        let now = Utc::now();
        let (cert, key) = self_signed(
            "manual.example.com",
            now - ChronoDuration::days(1),
            now + ChronoDuration::days(5),
        );
        manager
            .install_manual("manual.example.com", cert, key)
            .await
            .unwrap();

        let router = Arc::new(
            SiteRouter::new(&[SiteConfig {
                hostname: "manual.example.com".to_string(),
                upstream: "backend:5000".to_string(),
                tls: SiteTls::Manual {
                    cert_path: "/certs/manual.pem".to_string(),
                    key_path: "/certs/manual.key".to_string(),
                },
            }])
            .unwrap(),
        );
        let scheduler =
            RenewalScheduler::new(router, manager, ChallengeManager::new(), Duration::from_secs(60));

        let report = scheduler.check_all().await;
        assert_eq!(report.manual_expiring, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCertificateStore::open(dir.path()).await.unwrap());
        let manager = Arc::new(CertificateManager::new(store, None, ManagerSettings::default()));
        let router = Arc::new(SiteRouter::new(&[]).unwrap());
        let scheduler =
            RenewalScheduler::new(router, manager, ChallengeManager::new(), Duration::from_secs(3600));

        let shutdown = crate::utils::GracefulShutdown::new();
        let token = shutdown.shutdown_token();
        let handle = tokio::spawn(async move { scheduler.run(token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger_shutdown(crate::utils::ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
