use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{ServerConfigValidator, loader::load_config, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Loads the routing file and signals when it changes on disk.
pub struct FileConfigProvider {
    path: PathBuf,
    // dropping the watcher stops notifications
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path: path.clone(),
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let config_filename = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", self.path.display()))?
            .to_owned();

        // editors often replace the file, so watch the directory and filter by name
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!(kind = ?event.kind, "Config file changed");
                            // a pending signal already covers this change
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!(error = ?e, "Config watch error"),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch config directory {}", watch_dir.display()))?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        let config = load_config(path_str).await?;
        ServerConfigValidator::validate(&config)
            .wrap_err_with(|| format!("Invalid configuration in {path_str}"))?;
        Ok(config)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let taken = match self.update_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // a second caller gets a receiver that never fires
        taken.unwrap_or_else(|| mpsc::channel(1).1)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    fn write(path: &Path, body: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    fn config_body(upstream: &str) -> String {
        format!(
            r#"
            http_addr = "127.0.0.1:8080"
            https_addr = "127.0.0.1:8443"

            [acme]
            email = "ops@example.com"

            [[sites]]
            hostname = "example.com"
            upstream = "{upstream}"
            "#
        )
    }

    #[tokio::test]
    async fn test_file_config_provider_reload() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("portcullis.toml");
        write(&file_path, &config_body("backend:5000"));

        let provider = FileConfigProvider::new(&file_path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.sites[0].upstream, "backend:5000");

        let mut rx = provider.watch();
        sleep(Duration::from_millis(100)).await;
        write(&file_path, &config_body("backend:6000"));

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for config update");
        assert!(notification.unwrap().is_some());

        let config = provider.load_config().await?;
        assert_eq!(config.sites[0].upstream, "backend:6000");
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("portcullis.toml");
        write(&file_path, &config_body("backend-without-port"));

        let provider = FileConfigProvider::new(&file_path)?;
        assert!(provider.load_config().await.is_err());
        Ok(())
    }
}
