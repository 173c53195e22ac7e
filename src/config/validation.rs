#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr, path::Path};

use eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::models::{AcmeConfig, ServerConfig, SiteConfig, SiteTls};

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?)*$")
        .expect("invalid hostname regex")
});

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Site conflict detected: {message}")]
    SiteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, address) in [
            ("http_addr", &config.http_addr),
            ("https_addr", &config.https_addr),
        ] {
            if let Err(e) = Self::validate_listen_address(field, address) {
                errors.push(e);
            }
        }

        if config.sites.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "sites".to_string(),
            });
        } else {
            for site in &config.sites {
                if let Err(mut site_errors) = Self::validate_site(site) {
                    errors.append(&mut site_errors);
                }
            }
        }

        if let Err(conflicts) = Self::check_site_conflicts(&config.sites) {
            errors.extend(conflicts);
        }

        if config.uses_acme() {
            if let Err(mut acme_errors) = Self::validate_acme(&config.acme) {
                errors.append(&mut acme_errors);
            }
        }

        let durations = [
            ("shutdown_timeout", &config.shutdown_timeout),
            ("timeouts.handshake", &config.timeouts.handshake),
            ("timeouts.header_read", &config.timeouts.header_read),
            ("upstream.connect_timeout", &config.upstream.connect_timeout),
            ("upstream.response_timeout", &config.upstream.response_timeout),
            ("upstream.idle_timeout", &config.upstream.idle_timeout),
            (
                "upstream.pool_idle_timeout",
                &config.upstream.pool_idle_timeout,
            ),
        ];
        for (field, value) in durations {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(field: &str, address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: format!(
                    "{field} must be in format 'IP:PORT' (e.g., '0.0.0.0:443' or '127.0.0.1:8080')"
                ),
            });
        }
        Ok(())
    }

    fn validate_site(site: &SiteConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_hostname(&site.hostname) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_upstream(&site.hostname, &site.upstream) {
            errors.push(e);
        }

        if let SiteTls::Manual {
            cert_path,
            key_path,
        } = &site.tls
        {
            for (kind, path) in [("certificate", cert_path), ("private key", key_path)] {
                if !Path::new(path).exists() {
                    errors.push(ValidationError::InvalidTls {
                        message: format!(
                            "site '{}': {kind} file '{path}' does not exist",
                            site.hostname
                        ),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Hostnames must be concrete, lower-case DNS names.
    fn validate_hostname(host: &str) -> ValidationResult<()> {
        let field = format!("site '{host}' hostname");
        if host.is_empty() {
            return Err(ValidationError::InvalidField {
                field,
                message: "Hostname cannot be empty".to_string(),
            });
        }

        if host.contains("://") {
            return Err(ValidationError::InvalidField {
                field,
                message: "Hostname should not contain protocol (e.g., use 'example.com' not 'https://example.com')".to_string(),
            });
        }

        if host.contains('*') {
            return Err(ValidationError::InvalidField {
                field,
                message: "Wildcard hostnames cannot be issued over HTTP-01".to_string(),
            });
        }

        if host != host.to_ascii_lowercase() {
            return Err(ValidationError::InvalidField {
                field,
                message: format!("Hostname must be lower-case: '{host}'"),
            });
        }

        if host.len() > 253 || !HOSTNAME_REGEX.is_match(host) {
            return Err(ValidationError::InvalidField {
                field,
                message: format!("Invalid hostname format: '{host}'"),
            });
        }

        Ok(())
    }

    /// Upstreams are `host:port` with an explicit, non-zero port.
    fn validate_upstream(site: &str, upstream: &str) -> ValidationResult<()> {
        let field = format!("site '{site}' upstream");
        if upstream.contains("://") {
            return Err(ValidationError::InvalidField {
                field,
                message: "Upstream must be 'host:port' without a scheme".to_string(),
            });
        }

        if upstream.parse::<SocketAddr>().is_ok() {
            return Ok(());
        }

        match upstream.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                match port.parse::<u16>() {
                    Ok(0) | Err(_) => Err(ValidationError::InvalidField {
                        field,
                        message: format!("Invalid upstream port in '{upstream}'"),
                    }),
                    Ok(_) => Ok(()),
                }
            }
            _ => Err(ValidationError::InvalidField {
                field,
                message: format!("Upstream '{upstream}' must include an explicit port"),
            }),
        }
    }

    fn validate_acme(acme: &AcmeConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        match &acme.email {
            None => errors.push(ValidationError::MissingField {
                field: "acme.email".to_string(),
            }),
            Some(email) if !email.contains('@') => errors.push(ValidationError::InvalidField {
                field: "acme.email".to_string(),
                message: format!("'{email}' is not an email address"),
            }),
            Some(_) => {}
        }

        if let Some(url) = &acme.directory_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                errors.push(ValidationError::InvalidField {
                    field: "acme.directory_url".to_string(),
                    message: format!("URL scheme must be 'http' or 'https', got '{url}'"),
                });
            }
        }

        if acme.renew_before_days == 0 || acme.renew_before_days >= 90 {
            errors.push(ValidationError::InvalidField {
                field: "acme.renew_before_days".to_string(),
                message: "Renewal threshold must be between 1 and 89 days".to_string(),
            });
        }

        if acme.max_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "acme.max_attempts".to_string(),
                message: "At least one issuance attempt is required".to_string(),
            });
        }

        for (field, value) in [
            ("acme.check_interval", &acme.check_interval),
            ("acme.issuance_timeout", &acme.issuance_timeout),
            ("acme.retry_base", &acme.retry_base),
            ("acme.retry_max", &acme.retry_max),
        ] {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Duration must be greater than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            }),
        }
    }

    fn check_site_conflicts(sites: &[SiteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();

        for site in sites {
            let key = site.hostname.to_ascii_lowercase();
            if !seen.insert(key) {
                errors.push(ValidationError::SiteConflict {
                    message: format!("hostname '{}' is configured more than once", site.hostname),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
