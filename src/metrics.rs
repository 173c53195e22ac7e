//! Lightweight metrics helpers for Portcullis.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. No exporter is embedded; the
//! application can install any compatible recorder. Names are described once
//! when [`init_metrics`] forces the description block.
//!
//! Provided metrics (labels vary by family):
//! * `portcullis_requests_total` (counter, `host`, `status`)
//! * `portcullis_upstream_request_duration_seconds` (histogram, `host`)
//! * `portcullis_upstream_errors_total` (counter, `host`, `kind`)
//! * `portcullis_handshakes_total` (counter, `outcome`)
//! * `portcullis_certificates_issued_total` (counter, `host`, `outcome`)
//! * `portcullis_certificate_expiry_seconds` (gauge per host)
//! * `portcullis_active_connections` (gauge)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const PORTCULLIS_REQUESTS_TOTAL: &str = "portcullis_requests_total";
pub const PORTCULLIS_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "portcullis_upstream_request_duration_seconds";
pub const PORTCULLIS_UPSTREAM_ERRORS_TOTAL: &str = "portcullis_upstream_errors_total";
pub const PORTCULLIS_HANDSHAKES_TOTAL: &str = "portcullis_handshakes_total";
pub const PORTCULLIS_CERTIFICATES_ISSUED_TOTAL: &str = "portcullis_certificates_issued_total";
pub const PORTCULLIS_CERTIFICATE_EXPIRY_SECONDS: &str = "portcullis_certificate_expiry_seconds";
pub const PORTCULLIS_ACTIVE_CONNECTIONS: &str = "portcullis_active_connections";

/// `host` label for requests naming no configured site, so client input cannot mint series.
pub const UNKNOWN_HOST: &str = "unknown";

/// Last reported seconds-until-expiry per hostname
pub static CERTIFICATE_EXPIRY_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        PORTCULLIS_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTPS requests answered, by site and status."
    );
    describe_histogram!(
        PORTCULLIS_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time until the upstream returned response headers."
    );
    describe_counter!(
        PORTCULLIS_UPSTREAM_ERRORS_TOTAL,
        Unit::Count,
        "Upstream failures by kind (unreachable, timeout, invalid)."
    );
    describe_counter!(
        PORTCULLIS_HANDSHAKES_TOTAL,
        Unit::Count,
        "TLS handshakes by outcome."
    );
    describe_counter!(
        PORTCULLIS_CERTIFICATES_ISSUED_TOTAL,
        Unit::Count,
        "Certificate issuance attempts by outcome."
    );
    describe_gauge!(
        PORTCULLIS_CERTIFICATE_EXPIRY_SECONDS,
        Unit::Seconds,
        "Seconds until the active certificate for a site expires."
    );
    describe_gauge!(
        PORTCULLIS_ACTIVE_CONNECTIONS,
        "Number of currently open client connections."
    );

    Mutex::new(HashMap::new())
});

/// Record the remaining lifetime of the active certificate for `host`.
pub fn set_certificate_expiry(host: &str, seconds_remaining: f64) {
    if let Ok(mut gauges) = CERTIFICATE_EXPIRY_GAUGES.lock() {
        gauges.insert(host.to_string(), seconds_remaining);
    } else {
        tracing::error!("Failed to acquire lock for certificate expiry gauges");
        return;
    }

    gauge!(PORTCULLIS_CERTIFICATE_EXPIRY_SECONDS, "host" => host.to_string())
        .set(seconds_remaining);
}

/// Count one issuance attempt (`outcome`: issued, transient, permanent, store_failed).
pub fn increment_certificates_issued(host: &str, outcome: &str) {
    counter!(
        PORTCULLIS_CERTIFICATES_ISSUED_TOTAL,
        "host" => host.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Count one handshake (`outcome`: established, no_sni, unknown_host, no_certificate, ...).
pub fn increment_handshakes(outcome: &str) {
    counter!(PORTCULLIS_HANDSHAKES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn increment_request_total(host: &str, status: u16) {
    counter!(
        PORTCULLIS_REQUESTS_TOTAL,
        "host" => host.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn increment_upstream_errors(host: &str, kind: &str) {
    counter!(
        PORTCULLIS_UPSTREAM_ERRORS_TOTAL,
        "host" => host.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_upstream_duration(host: &str, duration: std::time::Duration) {
    histogram!(PORTCULLIS_UPSTREAM_REQUEST_DURATION_SECONDS, "host" => host.to_string())
        .record(duration.as_secs_f64());
}

/// Set current active connection count.
pub fn set_active_connections(count: usize) {
    gauge!(PORTCULLIS_ACTIVE_CONNECTIONS).set(count as f64);
}

/// RAII helper measuring time to upstream response headers.
pub struct UpstreamTimer {
    start: Instant,
    host: String,
}

impl UpstreamTimer {
    pub fn new(host: &str) -> Self {
        Self {
            start: Instant::now(),
            host: host.to_string(),
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        record_upstream_duration(&self.host, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&CERTIFICATE_EXPIRY_GAUGES);
    tracing::debug!("Portcullis metric descriptions registered");
    Ok(())
}

/// Snapshot of certificate expiry gauges, keyed by hostname.
pub fn certificate_expiry_snapshot() -> HashMap<String, f64> {
    CERTIFICATE_EXPIRY_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}
