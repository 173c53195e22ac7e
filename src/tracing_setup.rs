use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging from the configured level and format.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing_with_config(level: &str, json_format: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = if json_format {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(false))
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    result.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level = %level, json = json_format, "Portcullis logging initialized");
    Ok(())
}

/// Span covering one accepted TLS connection.
pub fn create_connection_span(connection_id: u64, peer: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        connection.id = connection_id,
        peer = peer,
        tls.server_name = tracing::field::Empty,
        tls.alpn = tracing::field::Empty,
    )
}

/// Span covering one proxied request.
pub fn create_request_span(method: &str, host: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request.id = request_id,
        http.method = method,
        http.host = host,
        http.path = path,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span covering one request sent to an upstream.
pub fn create_upstream_span(upstream: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        upstream = upstream,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let result = init_tracing_with_config("portcullis=loudest", true);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "example.com", "/api/test", "req-123");
        // no subscriber is installed, so the span may be disabled
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "request");
        }
    }

    #[test]
    fn test_create_upstream_span() {
        let span = create_upstream_span("backend:5000", "POST", "/data");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "upstream_request");
        }
    }

    #[test]
    fn test_create_connection_span() {
        let span = create_connection_span(7, "127.0.0.1:4000");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "connection");
        }
    }
}
