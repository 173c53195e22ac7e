use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors from forwarding a request to an upstream.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    /// The upstream refused or could not be reached
    #[error("Upstream {upstream} unreachable: {message}")]
    Unreachable { upstream: String, message: String },

    /// The connect or response-header deadline elapsed
    #[error("Upstream {upstream} timed out after {elapsed:?}")]
    Timeout { upstream: String, elapsed: Duration },

    /// The request could not be rewritten for the upstream
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type ForwardResult<T> = Result<T, ForwardError>;

/// UpstreamClient defines the port for sending one request to one upstream.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Send `req` to `upstream` (`host:port`) and return the streaming response.
    ///
    /// The request URI is rewritten to the upstream authority; headers and body are sent
    /// as given.
    async fn send(&self, upstream: &str, req: Request<AxumBody>) -> ForwardResult<Response<AxumBody>>;
}
