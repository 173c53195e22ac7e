use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::certificate::{AccountRecord, CertificateRecord};

/// Errors from durable certificate/account storage.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CertificateStore defines the port for durable certificate and account state.
///
/// Every mutation must be durable before it returns, and a failed `put` must leave the
/// previously stored record readable.
#[async_trait]
pub trait CertificateStore: Send + Sync + 'static {
    /// Fetch the active record for `hostname`.
    async fn get(&self, hostname: &str) -> StoreResult<Option<CertificateRecord>>;

    /// Atomically replace the record for `hostname`.
    async fn put(&self, hostname: &str, record: &CertificateRecord) -> StoreResult<()>;

    /// Hostnames with a stored record, sorted.
    async fn list(&self) -> StoreResult<Vec<String>>;

    /// Account state for an ACME directory.
    async fn load_account(&self, directory_url: &str) -> StoreResult<Option<AccountRecord>>;

    async fn save_account(&self, account: &AccountRecord) -> StoreResult<()>;

    /// Remove the account for `directory_url`. Returns whether one existed.
    async fn delete_account(&self, directory_url: &str) -> StoreResult<bool>;
}
