//! Filesystem implementation of the certificate store.
//!
//! ```text
//! data_dir/
//! ├── certificates/
//! │   └── example.com/
//! │       └── record.json     # CertificateRecord (chain, key, validity, source)
//! └── accounts/
//!     └── acme-v02.api.letsencrypt.org_directory.json
//! ```
//!
//! Every write goes to a uniquely named temporary file in the target directory, is
//! fsynced, renamed over the destination and followed by a directory fsync. Readers
//! therefore see either the old file or the new one. Files are 0600, directories 0700.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::{
    core::certificate::{AccountRecord, CertificateRecord},
    ports::certificate_store::{CertificateStore, StoreError, StoreResult},
};

const CERTIFICATES_DIR: &str = "certificates";
const ACCOUNTS_DIR: &str = "accounts";
const RECORD_FILE: &str = "record.json";
const TMP_MARKER: &str = ".tmp-";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hostnames become directory names, so only plain DNS characters are accepted.
fn checked_hostname(hostname: &str) -> StoreResult<&str> {
    let ok = !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname.starts_with('.')
        && hostname
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if ok {
        Ok(hostname)
    } else {
        Err(StoreError::InvalidKey(hostname.to_string()))
    }
}

/// File name for a directory URL: scheme dropped, everything else made path-safe.
pub fn account_file_name(directory_url: &str) -> String {
    let trimmed = directory_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(directory_url)
        .trim_end_matches('/');
    let safe: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.json")
}

/// Durable store rooted at `storage.data_dir`.
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    root: PathBuf,
}

impl FileCertificateStore {
    /// Open (creating if needed) the store at `root` and remove leftovers of interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.root.clone(),
            store.certificates_dir(),
            store.accounts_dir(),
        ] {
            create_private_dir(&dir).await?;
        }
        store.remove_stale_temp_files().await?;

        info!(storage_path = %store.root.display(), "Opened certificate store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn certificates_dir(&self) -> PathBuf {
        self.root.join(CERTIFICATES_DIR)
    }

    fn accounts_dir(&self) -> PathBuf {
        self.root.join(ACCOUNTS_DIR)
    }

    fn record_path(&self, hostname: &str) -> StoreResult<PathBuf> {
        Ok(self
            .certificates_dir()
            .join(checked_hostname(hostname)?)
            .join(RECORD_FILE))
    }

    fn account_path(&self, directory_url: &str) -> PathBuf {
        self.accounts_dir().join(account_file_name(directory_url))
    }

    async fn remove_stale_temp_files(&self) -> StoreResult<()> {
        let mut dirs = vec![self.accounts_dir()];
        let certificates = self.certificates_dir();
        let mut entries = fs::read_dir(&certificates)
            .await
            .map_err(io_error(&certificates))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(&certificates))?
        {
            dirs.push(entry.path());
        }

        for dir in dirs {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().contains(TMP_MARKER) {
                    warn!(path = %entry.path().display(), "Removing interrupted write");
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "No stored record");
                return Ok(None);
            }
            Err(e) => return Err(io_error(path)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }
}

async fn create_private_dir(dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(io_error(dir))?;
    }
    Ok(())
}

/// Replace `target` with `bytes` so that a crash at any point leaves either the old or the
/// new content.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = target
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(target.display().to_string()))?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!("{file_name}{TMP_MARKER}{}", uuid::Uuid::new_v4()));

    let result = async {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await.map_err(io_error(&tmp))?;
        file.write_all(bytes).await.map_err(io_error(&tmp))?;
        file.sync_all().await.map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, target).await.map_err(io_error(target))?;
        sync_dir(dir).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StoreResult<()> {
    let handle = fs::File::open(dir).await.map_err(io_error(dir))?;
    handle.sync_all().await.map_err(io_error(dir))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StoreResult<()> {
    Ok(())
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn get(&self, hostname: &str) -> StoreResult<Option<CertificateRecord>> {
        let path = self.record_path(hostname)?;
        let record: Option<CertificateRecord> = Self::read_json(&path).await?;
        if let Some(record) = &record {
            if record.hostname != hostname {
                return Err(StoreError::Corrupt {
                    path,
                    message: format!("record is for '{}'", record.hostname),
                });
            }
            debug!(hostname = %hostname, not_after = %record.not_after, "Loaded stored certificate");
        }
        Ok(record)
    }

    async fn put(&self, hostname: &str, record: &CertificateRecord) -> StoreResult<()> {
        let path = self.record_path(hostname)?;
        if record.hostname != hostname {
            return Err(StoreError::InvalidKey(format!(
                "record for '{}' stored under '{hostname}'",
                record.hostname
            )));
        }
        if let Some(dir) = path.parent() {
            create_private_dir(dir).await?;
        }

        let body = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &body).await?;

        info!(
            hostname = %hostname,
            not_after = %record.not_after,
            "Stored certificate"
        );
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let dir = self.certificates_dir();
        let mut entries = fs::read_dir(&dir).await.map_err(io_error(&dir))?;
        let mut hostnames = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if checked_hostname(&name).is_err() {
                continue;
            }
            if fs::try_exists(entry.path().join(RECORD_FILE))
                .await
                .unwrap_or(false)
            {
                hostnames.push(name);
            }
        }
        hostnames.sort();
        Ok(hostnames)
    }

    async fn load_account(&self, directory_url: &str) -> StoreResult<Option<AccountRecord>> {
        let path = self.account_path(directory_url);
        let account: Option<AccountRecord> = Self::read_json(&path).await?;
        if let Some(account) = &account {
            debug!(
                directory = %directory_url,
                account_url = %account.account_url,
                "Loaded ACME account"
            );
        }
        Ok(account)
    }

    async fn save_account(&self, account: &AccountRecord) -> StoreResult<()> {
        let path = self.account_path(&account.directory_url);
        let body = serde_json::to_vec_pretty(account)?;
        write_atomic(&path, &body).await?;
        info!(
            directory = %account.directory_url,
            account_url = %account.account_url,
            "Saved ACME account"
        );
        Ok(())
    }

    async fn delete_account(&self, directory_url: &str) -> StoreResult<bool> {
        let path = self.account_path(directory_url);
        match fs::remove_file(&path).await {
            Ok(()) => {
                sync_dir(&self.accounts_dir()).await?;
                warn!(directory = %directory_url, "Deleted ACME account");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}
