use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version, header},
};
use hyper::{Request, Response};

use crate::{
    core::router::{DomainEntry, SiteRouter, normalize_hostname},
    metrics,
    ports::upstream::{ForwardError, UpstreamClient},
};

const VIA_TOKEN: &str = "portcullis";

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// What the connection knows about a request besides the request itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    /// Site selected by SNI during the handshake
    pub sni_entry: Arc<DomainEntry>,
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

fn append_via(headers: &mut HeaderMap, version: Version) {
    let value = format!("{} {VIA_TOKEN}", version_label(version));
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.append(header::VIA, value);
    }
}

/// Host the client asked for: the `Host` header, else the URI authority (HTTP/2).
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// HTTPS request handler: routes by Host, then forwards to the site's upstream.
#[derive(Clone)]
pub struct HttpHandler {
    router: Arc<SiteRouter>,
    upstream: Arc<dyn UpstreamClient>,
    hsts: Option<HeaderValue>,
}

impl HttpHandler {
    pub fn new(
        router: Arc<SiteRouter>,
        upstream: Arc<dyn UpstreamClient>,
        hsts_max_age_secs: Option<u64>,
    ) -> Self {
        let hsts = hsts_max_age_secs
            .and_then(|age| HeaderValue::from_str(&format!("max-age={age}")).ok());
        Self {
            router,
            upstream,
            hsts,
        }
    }

    /// Answer one request. Never fails; upstream trouble becomes a 502 or 504.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        ctx: &RequestContext,
    ) -> Response<AxumBody> {
        let host = request_host(&req)
            .map(|h| normalize_hostname(&h))
            .unwrap_or_else(|| ctx.sni_entry.hostname.clone());

        let resolved = self.router.resolve(&host).ok();
        let mut response = match &resolved {
            None => {
                tracing::debug!(peer = %ctx.peer, host = %host, "Request for unknown site");
                plain_response(StatusCode::NOT_FOUND, "no such site\n")
            }
            Some(entry) if entry.hostname != ctx.sni_entry.hostname => {
                tracing::debug!(
                    peer = %ctx.peer,
                    host = %host,
                    sni = %ctx.sni_entry.hostname,
                    "Host does not match TLS server name"
                );
                plain_response(StatusCode::MISDIRECTED_REQUEST, "misdirected request\n")
            }
            Some(entry) => self.forward(req, entry, &host, ctx).await,
        };

        if let Some(hsts) = &self.hsts {
            response
                .headers_mut()
                .insert(header::STRICT_TRANSPORT_SECURITY, hsts.clone());
        }
        let site = resolved
            .as_ref()
            .map_or(metrics::UNKNOWN_HOST, |entry| entry.hostname.as_str());
        metrics::increment_request_total(site, response.status().as_u16());
        response
    }

    async fn forward(
        &self,
        mut req: Request<AxumBody>,
        entry: &DomainEntry,
        host: &str,
        ctx: &RequestContext,
    ) -> Response<AxumBody> {
        let version = req.version();
        let original_host = request_host(&req);
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);

        if !headers.contains_key(header::HOST) {
            if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
                headers.insert(header::HOST, value);
            }
        }

        let client_ip = ctx.peer.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {client_ip}"),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        append_via(headers, version);

        let upstream = entry.upstream.authority();
        let timer = metrics::UpstreamTimer::new(&entry.hostname);
        let result = self.upstream.send(&upstream, req).await;
        drop(timer);

        match result {
            Ok(mut response) => {
                let headers = response.headers_mut();
                strip_hop_by_hop(headers);
                append_via(headers, Version::HTTP_11);
                response
            }
            Err(e) => {
                let (status, kind, message) = match &e {
                    ForwardError::Unreachable { .. } => {
                        (StatusCode::BAD_GATEWAY, "unreachable", "bad gateway\n")
                    }
                    ForwardError::Timeout { .. } => {
                        (StatusCode::GATEWAY_TIMEOUT, "timeout", "gateway timeout\n")
                    }
                    _ => (StatusCode::BAD_REQUEST, "invalid", "bad request\n"),
                };
                tracing::warn!(
                    peer = %ctx.peer,
                    hostname = %entry.hostname,
                    upstream = %upstream,
                    error = %e,
                    "Forwarding failed"
                );
                metrics::increment_upstream_errors(&entry.hostname, kind);
                plain_response(status, message)
            }
        }
    }
}
