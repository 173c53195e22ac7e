pub mod acme_authority;
pub mod config_providers;
pub mod file_store;
pub mod forwarder;
pub mod http_handler;
pub mod plaintext;
pub mod server;
pub mod tls_terminator;

/// Re-export commonly used types from adapters
pub use acme_authority::{AcmeAuthority, AcmeSettings};
pub use config_providers::FileConfigProvider;
pub use file_store::FileCertificateStore;
pub use forwarder::Forwarder;
pub use http_handler::{HttpHandler, RequestContext};
pub use plaintext::{PlaintextState, plaintext_router};
pub use server::TlsServer;
pub use tls_terminator::{ConnectionSession, HandshakeState, TerminatorTimeouts, TlsTerminator};
