//! Plaintext HTTP listener.
//!
//! Answers HTTP-01 challenge fetches for any hostname. Every other request is redirected
//! to HTTPS or refused, depending on policy; nothing on this port reaches an upstream.
use std::sync::Arc;

use axum::{
    Router,
    body::Body as AxumBody,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::trace::TraceLayer;

use crate::{
    config::models::PlaintextPolicy,
    core::{
        challenge::{ChallengeManager, token_from_path},
        router::{SiteRouter, normalize_hostname},
    },
    metrics,
};

#[derive(Clone)]
pub struct PlaintextState {
    pub challenges: ChallengeManager,
    pub router: Arc<SiteRouter>,
    pub policy: PlaintextPolicy,
    /// Port written into redirect locations
    pub https_port: u16,
}

pub fn plaintext_router(state: PlaintextState) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
        .fallback(redirect_or_reject)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve_challenge(State(state): State<PlaintextState>, uri: Uri) -> Response {
    let Some(token) = token_from_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.challenges.respond(token).await {
        Some(key_authorization) => {
            tracing::info!(token = %token, "Served HTTP-01 challenge");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                key_authorization,
            )
                .into_response()
        }
        None => {
            tracing::debug!(token = %token, "Unknown challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// `https://host[:port]/path?query`, omitting the default port.
pub fn https_location(host: &str, port: u16, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{port}{path_and_query}")
    }
}

async fn redirect_or_reject(
    State(state): State<PlaintextState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(normalize_hostname)
        .unwrap_or_default();

    let resolved = state.router.resolve(&host).ok();
    let response = match &resolved {
        None => (StatusCode::NOT_FOUND, "no such site\n").into_response(),
        Some(_) if state.policy == PlaintextPolicy::Reject => {
            (StatusCode::FORBIDDEN, "https required\n").into_response()
        }
        Some(entry) => {
            let location = https_location(&entry.hostname, state.https_port, &uri);
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    let mut response = Response::new(AxumBody::empty());
                    *response.status_mut() = StatusCode::PERMANENT_REDIRECT;
                    response.headers_mut().insert(header::LOCATION, value);
                    response
                }
                Err(_) => StatusCode::BAD_REQUEST.into_response(),
            }
        }
    };

    tracing::debug!(
        host = %host,
        path = %uri.path(),
        status = response.status().as_u16(),
        "Plaintext request"
    );
    let site = resolved
        .as_ref()
        .map_or(metrics::UNKNOWN_HOST, |entry| entry.hostname.as_str());
    metrics::increment_request_total(site, response.status().as_u16());
    response
}
