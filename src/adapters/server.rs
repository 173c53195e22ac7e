//! TLS listener: accept loop, per-connection handshake and HTTP/1.1 + HTTP/2 serving.
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr};
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::{
    adapters::{
        http_handler::{HttpHandler, RequestContext},
        tls_terminator::{ConnectionSession, HandshakeError, TlsTerminator},
    },
    tracing_setup::{create_connection_span, create_request_span},
    utils::{ConnectionInfo, ConnectionTracker, ShutdownToken},
};

/// Shared pieces every connection task needs.
#[derive(Clone)]
pub struct TlsServer {
    terminator: Arc<TlsTerminator>,
    handler: HttpHandler,
    tracker: ConnectionTracker,
    header_read_timeout: Duration,
}

impl TlsServer {
    pub fn new(
        terminator: Arc<TlsTerminator>,
        handler: HttpHandler,
        tracker: ConnectionTracker,
        header_read_timeout: Duration,
    ) -> Self {
        Self {
            terminator,
            handler,
            tracker,
            header_read_timeout,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until shutdown starts. Each connection runs on its own task.
    pub async fn run(&self, listener: TcpListener, mut shutdown: ShutdownToken) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read TLS listener address")?;
        tracing::info!(addr = %local_addr, "TLS listener started");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, peer, token).await;
                        });
                    }
                    Err(e) => {
                        // typically EMFILE
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                reason = shutdown.wait_for_shutdown() => {
                    tracing::info!(addr = %local_addr, reason = ?reason, "TLS listener stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: ShutdownToken,
    ) {
        let _ = stream.set_nodelay(true);
        let info = self.tracker.register_connection(peer).await;
        let mut session = ConnectionSession::new(peer);
        let span = create_connection_span(session.id, &peer.to_string());

        async {
            let accepted = tokio::select! {
                result = self.terminator.accept(stream, &mut session) => Some(result),
                _ = shutdown.wait_for_shutdown() => None,
            };

            match accepted {
                Some(Ok(tls)) => {
                    if let Some(entry) = session.entry().cloned() {
                        info.set_server_name(&entry.hostname);
                        tracing::Span::current().record("tls.server_name", entry.hostname.as_str());
                        if let Some(alpn) = session.alpn() {
                            tracing::Span::current()
                                .record("tls.alpn", String::from_utf8_lossy(alpn).as_ref());
                        }

                        let ctx = RequestContext {
                            peer,
                            sni_entry: entry,
                        };
                        self.serve_http(TokioIo::new(tls), ctx, info.clone(), &mut shutdown)
                            .await;
                    }
                }
                Some(Err(e)) => log_handshake_failure(&e, peer),
                None => tracing::debug!(peer = %peer, "Shutdown during handshake"),
            }
        }
        .instrument(span)
        .await;

        session.close();
        self.tracker.unregister_connection(info.id).await;
    }

    async fn serve_http<IO>(
        &self,
        io: IO,
        ctx: RequestContext,
        info: Arc<ConnectionInfo>,
        shutdown: &mut ShutdownToken,
    ) where
        IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let peer = ctx.peer;
        let handler = self.handler.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let ctx = ctx.clone();
            let guard = info.begin_request();
            async move {
                let request_id = uuid::Uuid::new_v4().to_string();
                let host = req
                    .headers()
                    .get(hyper::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .or_else(|| req.uri().host())
                    .unwrap_or_default()
                    .to_string();
                let span =
                    create_request_span(req.method().as_str(), &host, req.uri().path(), &request_id);
                let started = std::time::Instant::now();

                let response = handler
                    .handle_request(req.map(AxumBody::new), &ctx)
                    .instrument(span.clone())
                    .await;

                span.record("http.status_code", response.status().as_u16());
                span.record("duration_ms", started.elapsed().as_millis() as u64);
                drop(guard);
                Ok::<_, Infallible>(response)
            }
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout);
        builder.http2().timer(TokioTimer::new());

        let connection = builder.serve_connection(io, service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            }
            _ = shutdown.wait_for_shutdown() => {
                connection.as_mut().graceful_shutdown();
                if let Err(e) = connection.as_mut().await {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended during shutdown");
                }
            }
        }
    }
}

fn log_handshake_failure(error: &HandshakeError, peer: SocketAddr) {
    match error {
        HandshakeError::Certificate { .. }
        | HandshakeError::IssuanceTimeout(_)
        | HandshakeError::Unservable { .. } => {
            tracing::warn!(peer = %peer, error = %error, "TLS handshake aborted")
        }
        _ => tracing::debug!(peer = %peer, error = %error, "TLS handshake failed"),
    }
}
