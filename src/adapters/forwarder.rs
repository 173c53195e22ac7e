#![allow(clippy::collapsible_if)]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Uri, Version, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::models::UpstreamConfig,
    ports::upstream::{ForwardError, ForwardResult, UpstreamClient},
    tracing_setup::create_upstream_span,
    utils::timeout_body::IdleTimeoutBody,
};

/// Deadlines applied to every forwarded request.
#[derive(Debug, Clone)]
pub struct ForwarderTimeouts {
    pub connect: Duration,
    /// Until the upstream's response head arrives
    pub response: Duration,
    /// Longest silence while streaming a body in either direction
    pub idle: Duration,
}

impl From<&UpstreamConfig> for ForwarderTimeouts {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            response: config.response_timeout(),
            idle: config.idle_timeout(),
        }
    }
}

/// Plain HTTP/1.1 upstream client over hyper's pooled legacy client.
///
/// Each request checks a connection out of the pool exclusively; it goes back to the pool
/// only once the response body has been fully read, or is closed if the body is dropped
/// early.
pub struct Forwarder {
    client: Client<HttpConnector, AxumBody>,
    timeouts: ForwarderTimeouts,
}

impl Forwarder {
    pub fn new(config: &UpstreamConfig) -> Self {
        let timeouts = ForwarderTimeouts::from(config);

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeouts.connect));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_idle_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build::<_, AxumBody>(connector);

        tracing::debug!(
            connect_timeout = ?timeouts.connect,
            response_timeout = ?timeouts.response,
            idle_timeout = ?timeouts.idle,
            "Created upstream client"
        );
        Self { client, timeouts }
    }

    fn upstream_uri(upstream: &str, original: &Uri) -> ForwardResult<Uri> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{upstream}{path_and_query}")
            .parse()
            .map_err(|e| ForwardError::InvalidRequest(format!("bad upstream URI: {e}")))
    }
}

#[async_trait]
impl UpstreamClient for Forwarder {
    async fn send(
        &self,
        upstream: &str,
        req: Request<AxumBody>,
    ) -> ForwardResult<Response<AxumBody>> {
        let (mut parts, body) = req.into_parts();
        parts.uri = Self::upstream_uri(upstream, &parts.uri)?;
        parts.version = Version::HTTP_11;

        let span = create_upstream_span(upstream, parts.method.as_str(), parts.uri.path());

        let body = AxumBody::new(IdleTimeoutBody::new(body, self.timeouts.idle));
        let outgoing = Request::from_parts(parts, body);

        let started = Instant::now();
        let result = timeout(
            self.timeouts.response,
            self.client.request(outgoing).instrument(span.clone()),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, incoming) = response.into_parts();
                // framing is re-done by the client-facing connection
                parts.headers.remove(header::TRANSFER_ENCODING);
                let body = AxumBody::new(IdleTimeoutBody::new(incoming, self.timeouts.idle));
                Ok(Response::from_parts(parts, body))
            }
            Ok(Err(e)) => {
                span.record("http.status_code", 502u16);
                tracing::warn!(upstream = %upstream, error = %e, "Upstream request failed");
                if e.is_connect() && is_connect_timeout(&e) {
                    return Err(ForwardError::Timeout {
                        upstream: upstream.to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                Err(ForwardError::Unreachable {
                    upstream: upstream.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                span.record("http.status_code", 504u16);
                tracing::warn!(upstream = %upstream, timeout = ?self.timeouts.response, "Upstream response timed out");
                Err(ForwardError::Timeout {
                    upstream: upstream.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

/// The connector reports its own deadline as an I/O `TimedOut` somewhere in the source chain.
fn is_connect_timeout(error: &hyper_util::client::legacy::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}
