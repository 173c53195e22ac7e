// Shared harness for integration tests: fake CA, tiny upstreams, a running TLS listener
// and a TLS client that records the certificate it was shown.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, http::HeaderMap};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use portcullis::{
    adapters::{
        FileCertificateStore, Forwarder, HttpHandler, TerminatorTimeouts, TlsServer, TlsTerminator,
    },
    config::models::{SiteConfig, SiteTls, UpstreamConfig},
    core::{CertificateManager, ManagerSettings, SiteRouter},
    ports::certificate_authority::{CertificateAuthority, IssuanceError, IssuedCertificate},
    utils::{ConnectionTracker, GracefulShutdown},
};
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsConnector, client::TlsStream};

/// Issues self-signed certificates and counts how often it was asked.
pub struct FakeAuthority {
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeAuthority {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, IssuanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let key = rcgen::KeyPair::generate().map_err(|e| IssuanceError::Permanent(e.to_string()))?;
        let params = rcgen::CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| IssuanceError::Permanent(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| IssuanceError::Permanent(e.to_string()))?;
        Ok(IssuedCertificate {
            certificate_chain_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
        })
    }

    fn directory_url(&self) -> &str {
        "https://fake-ca.test/directory"
    }
}

/// Axum upstream on an ephemeral port that echoes forwarding headers and counts requests.
pub async fn spawn_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().fallback(move |headers: HeaderMap| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            format!(
                "host={} proto={} forwarded_host={}",
                header("host"),
                header("x-forwarded-proto"),
                header("x-forwarded-host")
            )
        }
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Upstream that sends response headers and part of the body, then either closes the
/// connection or goes silent.
pub async fn spawn_truncating_upstream(close: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial body")
                    .await;
                let _ = stream.flush().await;
                if close {
                    drop(stream);
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn acme_site(hostname: &str, upstream: SocketAddr) -> SiteConfig {
    SiteConfig {
        hostname: hostname.to_string(),
        upstream: upstream.to_string(),
        tls: SiteTls::Acme,
    }
}

/// A TLS listener wired the way the binary wires it, over a temporary store.
pub struct Proxy {
    pub addr: SocketAddr,
    pub authority: Arc<FakeAuthority>,
    pub certificates: Arc<CertificateManager>,
    pub router: Arc<SiteRouter>,
    shutdown: GracefulShutdown,
    _dir: TempDir,
}

impl Proxy {
    pub async fn start(sites: &[SiteConfig], authority: Arc<FakeAuthority>) -> Self {
        Self::start_with(sites, authority, UpstreamConfig::default()).await
    }

    pub async fn start_with(
        sites: &[SiteConfig],
        authority: Arc<FakeAuthority>,
        upstream: UpstreamConfig,
    ) -> Self {
        Self::start_full(sites, authority, upstream, Duration::from_secs(10)).await
    }

    pub async fn start_full(
        sites: &[SiteConfig],
        authority: Arc<FakeAuthority>,
        upstream: UpstreamConfig,
        issuance_timeout: Duration,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCertificateStore::open(dir.path()).await.unwrap());
        let certificates = Arc::new(CertificateManager::new(
            store,
            Some(authority.clone() as Arc<dyn CertificateAuthority>),
            ManagerSettings::default(),
        ));
        let router = Arc::new(SiteRouter::new(sites).unwrap());

        let terminator = Arc::new(TlsTerminator::new(
            router.clone(),
            certificates.clone(),
            TerminatorTimeouts {
                handshake: Duration::from_secs(5),
                issuance: issuance_timeout,
            },
        ));
        let handler = HttpHandler::new(
            router.clone(),
            Arc::new(Forwarder::new(&upstream)),
            Some(3600),
        );
        let server = TlsServer::new(
            terminator,
            handler,
            ConnectionTracker::new(),
            Duration::from_secs(5),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = GracefulShutdown::new();
        let token = shutdown.shutdown_token();
        tokio::spawn(async move {
            server.run(listener, token).await.unwrap();
        });

        Self {
            addr,
            authority,
            certificates,
            router,
            shutdown,
            _dir: dir,
        }
    }

    pub fn shutdown(&self) -> &GracefulShutdown {
        &self.shutdown
    }
}

/// Accepts any server certificate and remembers the leaf it was shown.
#[derive(Debug, Default)]
pub struct RecordingVerifier {
    pub presented: Mutex<Option<Vec<u8>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.presented.lock().unwrap() = Some(end_entity.as_ref().to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Open a TLS connection to `addr` presenting `server_name` as SNI.
pub async fn connect(
    addr: SocketAddr,
    server_name: &str,
) -> std::io::Result<(TlsStream<TcpStream>, Arc<RecordingVerifier>)> {
    portcullis::adapters::tls_terminator::install_crypto_provider();
    let verifier = Arc::new(RecordingVerifier::default());
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let tcp = TcpStream::connect(addr).await?;
    let tls = TlsConnector::from(Arc::new(config)).connect(name, tcp).await?;
    Ok((tls, verifier))
}

/// Send one HTTP/1.1 GET over `tls` and return status plus body.
pub async fn get(tls: TlsStream<TcpStream>, host: &str, path: &str) -> (StatusCode, HeaderMap, String) {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

/// Send one GET and return the status plus the body outcome, without panicking on a
/// broken body.
pub async fn get_body_result(
    tls: TlsStream<TcpStream>,
    host: &str,
    path: &str,
) -> (StatusCode, Result<Bytes, hyper::Error>) {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.map(|b| b.to_bytes());
    (status, body)
}

/// DNS names carried by a DER certificate.
pub fn dns_names(der: &[u8]) -> Vec<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).unwrap();
    cert.subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `now` falls within the DER certificate's validity window.
pub fn valid_now(der: &[u8]) -> bool {
    let (_, cert) = x509_parser::parse_x509_certificate(der).unwrap();
    cert.validity().is_valid()
}
