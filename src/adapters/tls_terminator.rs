//! TLS termination with certificate selection after the ClientHello.
//!
//! The handshake is driven with `LazyConfigAcceptor`: the ClientHello is read first, the
//! SNI name is resolved against the routing snapshot, the certificate is obtained through
//! [`CertificateManager::ensure_site`] under an explicit deadline, and only then is the
//! handshake completed with a `ServerConfig` for that certificate. Unknown or missing
//! names abort the handshake before any certificate work happens.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use rustls::{ProtocolVersion, ServerConfig, server::Acceptor};
use scc::HashMap;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tokio_rustls::{LazyConfigAcceptor, server::TlsStream};

use crate::{
    config::models::TimeoutConfig,
    core::{
        certificate::{CertificateError, CertificateRecord},
        certificate_manager::{CertificateManager, EnsureError},
        router::{DomainEntry, SiteRouter, normalize_hostname},
    },
    metrics,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Install the process-wide rustls crypto provider (idempotent).
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Lifecycle of one client connection's TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Listening,
    HandshakeInProgress,
    Established,
    Failed,
    Closed,
}

impl HandshakeState {
    pub fn can_transition_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (Listening, HandshakeInProgress)
                | (HandshakeInProgress, Established)
                | (HandshakeInProgress, Failed)
                | (Established, Closed)
                | (Failed, Closed)
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Listening => "listening",
            HandshakeState::HandshakeInProgress => "handshake_in_progress",
            HandshakeState::Established => "established",
            HandshakeState::Failed => "failed",
            HandshakeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake did not complete within {0:?}")]
    Timeout(Duration),

    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("ClientHello carried no server name")]
    NoServerName,

    #[error("No site configured for '{0}'")]
    UnknownHost(String),

    #[error("Certificate for '{hostname}' not available: {source}")]
    Certificate {
        hostname: String,
        #[source]
        source: EnsureError,
    },

    #[error("Certificate for '{0}' not ready within the issuance deadline")]
    IssuanceTimeout(String),

    #[error("Stored certificate for '{hostname}' cannot be served: {reason}")]
    Unservable { hostname: String, reason: String },

    #[error("Invalid handshake transition {from} -> {to}")]
    InvalidTransition {
        from: HandshakeState,
        to: HandshakeState,
    },
}

impl HandshakeError {
    /// Label for `portcullis_handshakes_total`.
    pub fn outcome(&self) -> &'static str {
        match self {
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::Io(_) => "io_error",
            HandshakeError::NoServerName => "no_sni",
            HandshakeError::UnknownHost(_) => "unknown_host",
            HandshakeError::Certificate { .. } => "no_certificate",
            HandshakeError::IssuanceTimeout(_) => "issuance_timeout",
            HandshakeError::Unservable { .. } => "unservable_certificate",
            HandshakeError::InvalidTransition { .. } => "internal",
        }
    }
}

/// Per-connection state. Owned by the connection task and never shared.
#[derive(Debug)]
pub struct ConnectionSession {
    pub id: u64,
    pub peer: SocketAddr,
    state: HandshakeState,
    server_name: Option<String>,
    entry: Option<Arc<DomainEntry>>,
    protocol: Option<ProtocolVersion>,
    alpn: Option<Vec<u8>>,
}

impl ConnectionSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            state: HandshakeState::Listening,
            server_name: None,
            entry: None,
            protocol: None,
            alpn: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        if !self.state.can_transition_to(next) {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(session = self.id, from = %self.state, to = %next, "Handshake state");
        self.state = next;
        Ok(())
    }

    /// Close the session from whatever terminal state it reached.
    pub fn close(&mut self) {
        if self.state.can_transition_to(HandshakeState::Closed) {
            self.state = HandshakeState::Closed;
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// The site selected by SNI, once the handshake is established.
    pub fn entry(&self) -> Option<&Arc<DomainEntry>> {
        self.entry.as_ref()
    }

    pub fn protocol(&self) -> Option<ProtocolVersion> {
        self.protocol
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }
}

/// Deadlines for [`TlsTerminator`].
#[derive(Debug, Clone)]
pub struct TerminatorTimeouts {
    /// Reading the ClientHello, and separately finishing the handshake
    pub handshake: Duration,
    /// Waiting on `ensure`
    pub issuance: Duration,
}

impl TerminatorTimeouts {
    pub fn new(timeouts: &TimeoutConfig, issuance: Duration) -> Self {
        Self {
            handshake: timeouts.handshake(),
            issuance,
        }
    }
}

pub struct TlsTerminator {
    router: Arc<SiteRouter>,
    certificates: Arc<CertificateManager>,
    timeouts: TerminatorTimeouts,
    configs: HashMap<String, (Arc<CertificateRecord>, Arc<ServerConfig>)>,
}

impl TlsTerminator {
    pub fn new(
        router: Arc<SiteRouter>,
        certificates: Arc<CertificateManager>,
        timeouts: TerminatorTimeouts,
    ) -> Self {
        install_crypto_provider();
        Self {
            router,
            certificates,
            timeouts,
            configs: HashMap::new(),
        }
    }

    /// Run the handshake for `stream`, advancing `session` to `Established` or `Failed`.
    pub async fn accept<IO>(
        &self,
        stream: IO,
        session: &mut ConnectionSession,
    ) -> Result<TlsStream<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        session.advance(HandshakeState::HandshakeInProgress)?;
        match self.handshake(stream, session).await {
            Ok(tls) => {
                session.advance(HandshakeState::Established)?;
                metrics::increment_handshakes("established");
                Ok(tls)
            }
            Err(e) => {
                session.advance(HandshakeState::Failed)?;
                metrics::increment_handshakes(e.outcome());
                Err(e)
            }
        }
    }

    async fn handshake<IO>(
        &self,
        stream: IO,
        session: &mut ConnectionSession,
    ) -> Result<TlsStream<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake_timeout = self.timeouts.handshake;
        let start = timeout(
            handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| HandshakeError::Timeout(handshake_timeout))??;

        let hostname = start
            .client_hello()
            .server_name()
            .map(normalize_hostname)
            .ok_or(HandshakeError::NoServerName)?;
        session.server_name = Some(hostname.clone());

        let entry = self
            .router
            .resolve(&hostname)
            .map_err(|_| HandshakeError::UnknownHost(hostname.clone()))?;

        // bounds only this client's wait; the issuance itself runs to completion
        let record = timeout(self.timeouts.issuance, self.certificates.ensure_site(&entry))
            .await
            .map_err(|_| HandshakeError::IssuanceTimeout(hostname.clone()))?
            .map_err(|source| HandshakeError::Certificate {
                hostname: hostname.clone(),
                source,
            })?;

        if !record.is_valid_at(Utc::now()) {
            return Err(HandshakeError::Unservable {
                hostname,
                reason: format!(
                    "outside validity window {} .. {}",
                    record.not_before, record.not_after
                ),
            });
        }

        let config = self.server_config(&record).await?;
        let tls = timeout(handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| HandshakeError::Timeout(handshake_timeout))??;

        let (_, connection) = tls.get_ref();
        session.protocol = connection.protocol_version();
        session.alpn = connection.alpn_protocol().map(<[u8]>::to_vec);
        session.entry = Some(entry);

        tracing::debug!(
            session = session.id,
            peer = %session.peer,
            hostname = %hostname,
            protocol = ?session.protocol,
            "TLS session established"
        );
        Ok(tls)
    }

    /// Reuse the `ServerConfig` built for this exact record, or build one.
    async fn server_config(
        &self,
        record: &Arc<CertificateRecord>,
    ) -> Result<Arc<ServerConfig>, HandshakeError> {
        let cached = self
            .configs
            .read_async(&record.hostname, |_, (built_for, config)| {
                Arc::ptr_eq(built_for, record).then(|| config.clone())
            })
            .await
            .flatten();
        if let Some(config) = cached {
            return Ok(config);
        }

        let config = build_server_config(record).map_err(|e| HandshakeError::Unservable {
            hostname: record.hostname.clone(),
            reason: e.to_string(),
        })?;
        let _ = self
            .configs
            .upsert_async(record.hostname.clone(), (record.clone(), config.clone()))
            .await;
        Ok(config)
    }
}

#[derive(Error, Debug)]
pub enum ServerConfigError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// rustls server configuration serving `record`, advertising h2 and http/1.1.
pub fn build_server_config(
    record: &CertificateRecord,
) -> Result<Arc<ServerConfig>, ServerConfigError> {
    install_crypto_provider();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(record.certificate_chain()?, record.private_key()?)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use HandshakeState::*;
        assert!(Listening.can_transition_to(HandshakeInProgress));
        assert!(HandshakeInProgress.can_transition_to(Established));
        assert!(HandshakeInProgress.can_transition_to(Failed));
        assert!(Established.can_transition_to(Closed));
        assert!(Failed.can_transition_to(Closed));

        assert!(!Listening.can_transition_to(Established));
        assert!(!Failed.can_transition_to(Established));
        assert!(!Closed.can_transition_to(Listening));
    }

    #[test]
    fn test_session_rejects_invalid_transition() {
        let mut session = ConnectionSession::new("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            session.advance(HandshakeState::Established),
            Err(HandshakeError::InvalidTransition { .. })
        ));

        session.advance(HandshakeState::HandshakeInProgress).unwrap();
        session.advance(HandshakeState::Failed).unwrap();
        session.close();
        assert_eq!(session.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        let a = ConnectionSession::new("127.0.0.1:1".parse().unwrap());
        let b = ConnectionSession::new("127.0.0.1:1".parse().unwrap());
        assert_ne!(a.id, b.id);
    }
}
