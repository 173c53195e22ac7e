//! Hostname → upstream routing over an atomically swapped snapshot.
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::config::models::{SiteConfig, SiteTls};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("No such site: {0}")]
    NotFound(String),

    #[error("Invalid upstream '{upstream}' for site '{hostname}'")]
    InvalidUpstream { hostname: String, upstream: String },

    #[error("Hostname '{0}' is configured more than once")]
    Duplicate(String),
}

/// Address of the application behind a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn parse(value: &str) -> Option<Self> {
        if let Ok(addr) = value.parse::<SocketAddr>() {
            let host = match addr {
                SocketAddr::V4(v4) => v4.ip().to_string(),
                SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
            };
            return Some(Self {
                host,
                port: addr.port(),
            });
        }

        let (host, port) = value.rsplit_once(':')?;
        let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
        if host.is_empty() || host.contains(':') || host.contains('/') {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` as used in URIs
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One served hostname. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub hostname: String,
    pub upstream: Upstream,
    pub tls: SiteTls,
}

/// A versioned, read-only hostname table.
#[derive(Debug, Default)]
pub struct RoutingTable {
    version: u64,
    entries: HashMap<String, Arc<DomainEntry>>,
}

impl RoutingTable {
    pub fn from_sites(version: u64, sites: &[SiteConfig]) -> Result<Self, RouteError> {
        let mut entries = HashMap::with_capacity(sites.len());
        for site in sites {
            let hostname = normalize_hostname(&site.hostname);
            let upstream =
                Upstream::parse(&site.upstream).ok_or_else(|| RouteError::InvalidUpstream {
                    hostname: hostname.clone(),
                    upstream: site.upstream.clone(),
                })?;
            let entry = Arc::new(DomainEntry {
                hostname: hostname.clone(),
                upstream,
                tls: site.tls.clone(),
            });
            if entries.insert(hostname.clone(), entry).is_some() {
                return Err(RouteError::Duplicate(hostname));
            }
        }
        Ok(Self { version, entries })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<DomainEntry>> {
        self.entries.get(&normalize_hostname(hostname)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<DomainEntry>> {
        self.entries.values()
    }
}

/// Lower-case, strip a port suffix and any trailing dot.
pub fn normalize_hostname(raw: &str) -> String {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        // IPv6 literal, keep the brackets and drop the port
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Shared router handle. Lookups never block a reload and always see one whole snapshot.
pub struct SiteRouter {
    table: ArcSwap<RoutingTable>,
    next_version: AtomicU64,
}

impl SiteRouter {
    pub fn new(sites: &[SiteConfig]) -> Result<Self, RouteError> {
        let table = RoutingTable::from_sites(1, sites)?;
        Ok(Self {
            table: ArcSwap::from_pointee(table),
            next_version: AtomicU64::new(2),
        })
    }

    pub fn resolve(&self, hostname: &str) -> Result<Arc<DomainEntry>, RouteError> {
        self.table
            .load()
            .get(hostname)
            .ok_or_else(|| RouteError::NotFound(normalize_hostname(hostname)))
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Build and install a new snapshot. The old one stays if the sites are invalid.
    pub fn replace(&self, sites: &[SiteConfig]) -> Result<u64, RouteError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let table = RoutingTable::from_sites(version, sites)?;
        self.table.store(Arc::new(table));
        Ok(version)
    }
}
