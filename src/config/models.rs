//! Configuration data structures for Portcullis.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that a minimal config only has
//! to name its sites. Durations are human readable strings (`"30s"`, `"12h"`) parsed with
//! `humantime`; use the accessor methods to obtain `std::time::Duration` values.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory (rate-limit friendly).
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

/// What the plaintext listener does with ordinary (non-challenge) requests.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaintextPolicy {
    /// Permanent redirect to the same URL on the TLS port.
    #[default]
    Redirect,
    /// Refuse with `403 Forbidden`.
    Reject,
}

/// How a site obtains its certificate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SiteTls {
    /// Automatic issuance and renewal through ACME.
    #[default]
    Acme,
    /// Operator supplied PEM files, loaded into the certificate store at startup.
    Manual { cert_path: String, key_path: String },
}

/// A hostname served by the proxy and the single upstream it forwards to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub hostname: String,
    /// `host:port` of the application, e.g. `backend:5000`
    pub upstream: String,
    #[serde(default)]
    pub tls: SiteTls,
}

/// The two durable volumes the proxy relies on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Certificate records and ACME account state
    pub data_dir: PathBuf,
    /// Proxy working state (autosaved effective configuration)
    pub config_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            config_dir: PathBuf::from("/config"),
        }
    }
}

/// ACME (e.g. Let's Encrypt) certificate management configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AcmeConfig {
    /// Contact email for the ACME account
    pub email: Option<String>,
    /// Custom CA directory URL; overrides `staging`
    pub directory_url: Option<String>,
    /// Use the Let's Encrypt staging environment
    pub staging: bool,
    /// Days before expiry at which a certificate is renewed
    pub renew_before_days: u32,
    /// How often the background scheduler scans for due renewals
    pub check_interval: String,
    /// Longest a handshake waits on certificate issuance
    pub issuance_timeout: String,
    /// First backoff delay after a failed issuance
    pub retry_base: String,
    /// Backoff ceiling
    pub retry_max: String,
    /// Issuance attempts made inline when no valid certificate exists
    pub max_attempts: u32,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: None,
            staging: false,
            renew_before_days: 30,
            check_interval: "12h".to_string(),
            issuance_timeout: "90s".to_string(),
            retry_base: "5s".to_string(),
            retry_max: "1h".to_string(),
            max_attempts: 3,
        }
    }
}

impl AcmeConfig {
    /// Effective directory URL after applying `staging`.
    pub fn directory(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }

    pub fn renewal_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renew_before_days))
    }

    pub fn check_interval(&self) -> Duration {
        parse_duration_or(&self.check_interval, Duration::from_secs(12 * 3600))
    }

    pub fn issuance_timeout(&self) -> Duration {
        parse_duration_or(&self.issuance_timeout, Duration::from_secs(90))
    }

    pub fn retry_base(&self) -> Duration {
        parse_duration_or(&self.retry_base, Duration::from_secs(5))
    }

    pub fn retry_max(&self) -> Duration {
        parse_duration_or(&self.retry_max, Duration::from_secs(3600))
    }
}

/// Client-facing connection deadlines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TLS handshake (excluding time spent waiting on issuance)
    pub handshake: String,
    /// Time allowed for a client to send a full request head
    pub header_read: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: "10s".to_string(),
            header_read: "30s".to_string(),
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        parse_duration_or(&self.handshake, Duration::from_secs(10))
    }

    pub fn header_read(&self) -> Duration {
        parse_duration_or(&self.header_read, Duration::from_secs(30))
    }
}

/// Upstream connection pool and deadlines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout: String,
    /// Wait for the upstream's response head
    pub response_timeout: String,
    /// Maximum silence while streaming a body in either direction
    pub idle_timeout: String,
    pub pool_idle_timeout: String,
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "5s".to_string(),
            response_timeout: "60s".to_string(),
            idle_timeout: "60s".to_string(),
            pool_idle_timeout: "90s".to_string(),
            pool_max_idle_per_host: 32,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(5))
    }

    pub fn response_timeout(&self) -> Duration {
        parse_duration_or(&self.response_timeout, Duration::from_secs(60))
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration_or(&self.idle_timeout, Duration::from_secs(60))
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        parse_duration_or(&self.pool_idle_timeout, Duration::from_secs(90))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Plaintext listener (challenges, redirects)
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// TLS listener
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Port used in redirect URLs when the proxy sits behind a port mapping
    #[serde(default)]
    pub public_https_port: Option<u16>,
    #[serde(default)]
    pub plaintext: PlaintextPolicy,
    #[serde(default)]
    pub hsts_max_age_secs: Option<u64>,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Port placed in redirect URLs.
    pub fn redirect_port(&self) -> u16 {
        self.public_https_port.unwrap_or_else(|| {
            self.https_addr
                .parse::<std::net::SocketAddr>()
                .map(|addr| addr.port())
                .unwrap_or(443)
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        parse_duration_or(&self.shutdown_timeout, Duration::from_secs(30))
    }

    /// Whether any site relies on ACME issuance.
    pub fn uses_acme(&self) -> bool {
        self.sites.iter().any(|site| site.tls == SiteTls::Acme)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            public_https_port: None,
            plaintext: PlaintextPolicy::default(),
            hsts_max_age_secs: None,
            shutdown_timeout: default_shutdown_timeout(),
            sites: Vec::new(),
            storage: StorageConfig::default(),
            acme: AcmeConfig::default(),
            timeouts: TimeoutConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.http_addr = addr.into();
        self
    }

    pub fn https_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.https_addr = addr.into();
        self
    }

    pub fn plaintext(mut self, policy: PlaintextPolicy) -> Self {
        self.config.plaintext = policy;
        self
    }

    /// Add an ACME-managed site
    pub fn site(mut self, hostname: impl Into<String>, upstream: impl Into<String>) -> Self {
        self.config.sites.push(SiteConfig {
            hostname: hostname.into(),
            upstream: upstream.into(),
            tls: SiteTls::Acme,
        });
        self
    }

    /// Add a site served with an operator supplied certificate
    pub fn manual_site(
        mut self,
        hostname: impl Into<String>,
        upstream: impl Into<String>,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        self.config.sites.push(SiteConfig {
            hostname: hostname.into(),
            upstream: upstream.into(),
            tls: SiteTls::Manual {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            },
        });
        self
    }

    pub fn acme_email(mut self, email: impl Into<String>) -> Self {
        self.config.acme.email = Some(email.into());
        self
    }

    pub fn acme(mut self, acme: AcmeConfig) -> Self {
        self.config.acme = acme;
        self
    }

    pub fn storage(mut self, data_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        self.config.storage = StorageConfig {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
        };
        self
    }

    pub fn upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.config.upstream = upstream;
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.config.sites.is_empty() {
            return Err("At least one site must be configured".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_selection() {
        let mut acme = AcmeConfig::default();
        assert_eq!(acme.directory(), LETS_ENCRYPT_PRODUCTION);

        acme.staging = true;
        assert_eq!(acme.directory(), LETS_ENCRYPT_STAGING);

        acme.directory_url = Some("https://pebble:14000/dir".to_string());
        assert_eq!(acme.directory(), "https://pebble:14000/dir");
    }

    #[test]
    fn test_duration_accessors_fall_back_on_garbage() {
        let upstream = UpstreamConfig {
            connect_timeout: "not a duration".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(upstream.connect_timeout(), Duration::from_secs(5));
        assert_eq!(upstream.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_redirect_port() {
        let mut config = ServerConfig::default();
        assert_eq!(config.redirect_port(), 443);

        config.https_addr = "0.0.0.0:8443".to_string();
        assert_eq!(config.redirect_port(), 8443);

        config.public_https_port = Some(443);
        assert_eq!(config.redirect_port(), 443);
    }

    #[test]
    fn test_builder_requires_site() {
        assert!(ServerConfig::builder().build().is_err());

        let config = ServerConfig::builder()
            .site("example.com", "backend:5000")
            .acme_email("ops@example.com")
            .build()
            .unwrap();
        assert!(config.uses_acme());
        assert_eq!(config.sites[0].tls, SiteTls::Acme);
    }
}
