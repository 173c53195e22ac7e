//! Portcullis - an edge reverse proxy with automatic TLS.
//!
//! Portcullis terminates TLS for a set of configured hostnames, obtains and renews their
//! certificates through ACME (HTTP-01) and forwards each request to the single plain
//! HTTP/1.1 upstream configured for the hostname. Certificate and account state lives in
//! a persistent store, so a restarted process serves what it already has without asking
//! the CA again.
//!
//! # Architecture
//! The crate follows a **hexagonal** layout: `ports` holds the traits the core depends on
//! (certificate store, certificate authority, upstream client, config provider), `adapters`
//! holds their implementations plus the listeners, and `core` holds the certificate
//! lifecycle, the routing snapshot and the renewal scheduler.
//!
//! # Handshake flow
//! 1. The ClientHello is read without committing to a certificate.
//! 2. The SNI name is resolved against the routing snapshot; unknown names are refused.
//! 3. [`core::CertificateManager::ensure_site`] returns a valid certificate, issuing one
//!    if needed, under an explicit deadline.
//! 4. The handshake completes and HTTP/1.1 or HTTP/2 requests are forwarded.
//!
//! # Error Handling
//! Domain errors are `thiserror` enums; the binary and configuration loading use
//! `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; the routing table is an `ArcSwap` snapshot replaced
//! atomically on reload.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileCertificateStore, Forwarder, HttpHandler, TlsServer, TlsTerminator},
    core::{CertificateManager, ChallengeManager, SiteRouter},
    utils::{ConnectionTracker, GracefulShutdown},
};
