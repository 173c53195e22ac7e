// Integration tests for certificate idempotence and restart safety over the file store
mod common;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use portcullis::{
        adapters::FileCertificateStore,
        core::{CertificateManager, IssuanceSource, ManagerSettings},
        ports::{certificate_authority::CertificateAuthority, certificate_store::CertificateStore},
    };

    use crate::common::FakeAuthority;

    async fn manager_over(
        dir: &std::path::Path,
        authority: Arc<FakeAuthority>,
    ) -> Arc<CertificateManager> {
        let store = Arc::new(FileCertificateStore::open(dir).await.unwrap());
        let manager = Arc::new(CertificateManager::new(
            store,
            Some(authority as Arc<dyn CertificateAuthority>),
            ManagerSettings::default(),
        ));
        manager.warm_cache().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_ensure_twice_contacts_ca_once() {
        let dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(FakeAuthority::new(Duration::ZERO));
        let manager = manager_over(dir.path(), authority.clone()).await;

        let first = manager.ensure("example.com").await.unwrap();
        let second = manager.ensure("Example.COM.").await.unwrap();

        assert_eq!(authority.calls(), 1);
        assert_eq!(first.certificate_chain_pem, second.certificate_chain_pem);
        assert!(matches!(first.source, IssuanceSource::Acme { .. }));
    }

    #[tokio::test]
    async fn test_restart_serves_stored_certificate_without_ca() {
        let dir = tempfile::tempdir().unwrap();

        let issued = {
            let authority = Arc::new(FakeAuthority::new(Duration::ZERO));
            let manager = manager_over(dir.path(), authority.clone()).await;
            let record = manager.ensure("example.com").await.unwrap();
            assert_eq!(authority.calls(), 1);
            record
        };

        // a fresh process over the same directory
        let authority = Arc::new(FakeAuthority::new(Duration::ZERO));
        let manager = manager_over(dir.path(), authority.clone()).await;
        let restored = manager.ensure("example.com").await.unwrap();

        assert_eq!(authority.calls(), 0);
        assert_eq!(restored.certificate_chain_pem, issued.certificate_chain_pem);
        assert_eq!(restored.private_key_pem, issued.private_key_pem);
    }

    #[tokio::test]
    async fn test_store_lists_issued_hostnames() {
        let dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(FakeAuthority::new(Duration::ZERO));
        let manager = manager_over(dir.path(), authority).await;

        manager.ensure("b.example.com").await.unwrap();
        manager.ensure("a.example.com").await.unwrap();

        let store = FileCertificateStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.list().await.unwrap(),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        let record = store.get("a.example.com").await.unwrap().unwrap();
        assert_eq!(record.hostname, "a.example.com");
    }
}
