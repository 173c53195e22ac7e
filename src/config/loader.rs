use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::{adapters::file_store::write_atomic, config::models::ServerConfig};

/// Prefix for environment overrides, e.g. `PORTCULLIS__ACME__EMAIL`.
pub const ENV_PREFIX: &str = "PORTCULLIS";

/// File the effective configuration is saved to inside `storage.config_dir`.
pub const AUTOSAVE_FILE: &str = "autosave.json";

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously, layering environment overrides on top of the file.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let mut server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    for site in &mut server_config.sites {
        site.hostname = site.hostname.trim().trim_end_matches('.').to_string();
    }

    Ok(server_config)
}

/// Atomically write the effective configuration to `config_dir/autosave.json`.
pub async fn autosave(config: &ServerConfig) -> Result<()> {
    let dir = &config.storage.config_dir;
    let body = serde_json::to_vec_pretty(config).context("Failed to serialize configuration")?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create config dir {}", dir.display()))?;

    let target = dir.join(AUTOSAVE_FILE);
    write_atomic(&target, &body)
        .await
        .with_context(|| format!("Failed to replace {}", target.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{PlaintextPolicy, SiteTls};

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
http_addr = "127.0.0.1:8080"
https_addr = "127.0.0.1:8443"
plaintext = "reject"

[acme]
email = "ops@example.com"
renew_before_days = 20

[[sites]]
hostname = "example.com."
upstream = "backend:5000"

[[sites]]
hostname = "static.example.com"
upstream = "files:8080"
[sites.tls]
mode = "manual"
cert_path = "/certs/static.pem"
key_path = "/certs/static.key"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.https_addr, "127.0.0.1:8443");
        assert_eq!(config.plaintext, PlaintextPolicy::Reject);
        assert_eq!(config.acme.renew_before_days, 20);
        assert_eq!(config.acme.check_interval, "12h");
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.sites[0].hostname, "example.com");
        assert_eq!(config.sites[0].tls, SiteTls::Acme);
        assert!(matches!(config.sites[1].tls, SiteTls::Manual { .. }));
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
https_addr: "127.0.0.1:8443"
sites:
  - hostname: "example.com"
    upstream: "backend:5000"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:80");
        assert_eq!(config.sites.len(), 1);
    }

    #[tokio::test]
    async fn test_autosave_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::ServerConfig::builder()
            .site("example.com", "backend:5000")
            .storage(dir.path().join("data"), dir.path().join("config"))
            .build()
            .unwrap();

        autosave(&config).await.unwrap();

        let saved = std::fs::read(dir.path().join("config").join(AUTOSAVE_FILE)).unwrap();
        let parsed: ServerConfig = serde_json::from_slice(&saved).unwrap();
        assert_eq!(parsed.sites, config.sites);
    }

    #[tokio::test]
    async fn test_autosave_replaces_previous_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let first = crate::config::ServerConfig::builder()
            .site("example.com", "backend:5000")
            .storage(dir.path().join("data"), &config_dir)
            .build()
            .unwrap();
        let second = crate::config::ServerConfig::builder()
            .site("example.com", "backend:6000")
            .storage(dir.path().join("data"), &config_dir)
            .build()
            .unwrap();

        autosave(&first).await.unwrap();
        autosave(&second).await.unwrap();

        let saved = std::fs::read(config_dir.join(AUTOSAVE_FILE)).unwrap();
        let parsed: ServerConfig = serde_json::from_slice(&saved).unwrap();
        assert_eq!(parsed.sites[0].upstream, "backend:6000");

        let entries: Vec<_> = std::fs::read_dir(&config_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(AUTOSAVE_FILE)]);
    }
}
