// Integration tests for the plaintext listener: redirects, rejection and HTTP-01 responses
mod common;

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};
    use hyper::{Request, StatusCode, header};
    use hyper_util::{client::legacy::Client, rt::TokioExecutor};
    use portcullis::{
        adapters::{PlaintextState, plaintext_router},
        config::models::PlaintextPolicy,
        core::{ChallengeManager, SiteRouter},
    };
    use tokio::net::TcpListener;

    use crate::common::{acme_site, spawn_upstream};

    async fn spawn_plaintext(
        policy: PlaintextPolicy,
        upstream: SocketAddr,
    ) -> (SocketAddr, ChallengeManager) {
        let challenges = ChallengeManager::new();
        let router = Arc::new(SiteRouter::new(&[acme_site("example.com", upstream)]).unwrap());
        let app = plaintext_router(PlaintextState {
            challenges: challenges.clone(),
            router,
            policy,
            https_port: 443,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, challenges)
    }

    async fn send(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, Option<String>, Bytes) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let request = Request::builder()
            .uri(format!("http://{addr}{path}"))
            .header(header::HOST, host)
            .body(Empty::new())
            .unwrap();
        let response = client.request(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, location, body)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plaintext_redirects_and_never_forwards() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(hits.clone()).await;
        let (addr, _) = spawn_plaintext(PlaintextPolicy::Redirect, upstream).await;

        let (status, location, _) = send(addr, "example.com", "/login?next=/home").await;
        assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
        assert_eq!(location.as_deref(), Some("https://example.com/login?next=/home"));

        let (status, location, _) = send(addr, "unknown.example.net", "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(location.is_none());

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plaintext_reject_policy() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(hits.clone()).await;
        let (addr, _) = spawn_plaintext(PlaintextPolicy::Reject, upstream).await;

        let (status, _, _) = send(addr, "example.com", "/").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_challenge_token_is_served() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(hits).await;
        let (addr, challenges) = spawn_plaintext(PlaintextPolicy::Reject, upstream).await;

        challenges
            .publish("abc-DEF_123", "example.com", "abc-DEF_123.thumbprint")
            .await;
        let (status, _, body) = send(addr, "example.com", "/.well-known/acme-challenge/abc-DEF_123").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"abc-DEF_123.thumbprint");

        challenges.withdraw_host("example.com").await;
        let (status, _, _) = send(addr, "example.com", "/.well-known/acme-challenge/abc-DEF_123").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
