//! Connection tracking & graceful draining utilities.
//!
//! Each accepted TLS connection is registered with a small record holding its peer, the
//! server name it negotiated and its in-flight request count. During shutdown the tracker
//! waits for open connections to finish, bounded by a timeout.
use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::time::sleep;

use crate::metrics;

pub type ConnectionId = u64;

#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
    server_name: OnceLock<String>,
    active_requests: AtomicU64,
    tracker_requests: Arc<AtomicU64>,
}

impl ConnectionInfo {
    /// Record the SNI name once the handshake has chosen a site.
    pub fn set_server_name(&self, name: &str) {
        let _ = self.server_name.set(name.to_string());
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.get().map(String::as_str)
    }

    /// Count a request as in flight until the guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        self.tracker_requests.fetch_add(1, Ordering::AcqRel);
        RequestGuard { info: self.clone() }
    }

    pub fn active_request_count(&self) -> u64 {
        self.active_requests.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.active_request_count() == 0
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Marks one request in flight on a connection.
#[derive(Debug)]
pub struct RequestGuard {
    info: Arc<ConnectionInfo>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.info.active_requests.fetch_sub(1, Ordering::AcqRel);
        self.info.tracker_requests.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of open connections shared by the accept loop and shutdown logic.
#[derive(Clone)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
    active_requests: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            active_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new connection and return its record.
    pub async fn register_connection(&self, remote_addr: SocketAddr) -> Arc<ConnectionInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnectionInfo {
            id,
            remote_addr,
            established_at: Instant::now(),
            server_name: OnceLock::new(),
            active_requests: AtomicU64::new(0),
            tracker_requests: self.active_requests.clone(),
        });

        let _ = self.connections.insert_async(id, info.clone()).await;
        let total = self.connections.len();
        metrics::set_active_connections(total);

        tracing::debug!(
            connection_id = id,
            peer = %remote_addr,
            total_connections = total,
            "Connection registered"
        );
        info
    }

    pub async fn unregister_connection(&self, connection_id: ConnectionId) {
        if let Some((_, info)) = self.connections.remove_async(&connection_id).await {
            let total = self.connections.len();
            metrics::set_active_connections(total);
            tracing::debug!(
                connection_id,
                peer = %info.remote_addr,
                server_name = info.server_name().unwrap_or("-"),
                age = ?info.age(),
                total_connections = total,
                "Connection unregistered"
            );
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sum of in-flight requests across all connections.
    pub fn total_active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Acquire)
    }

    /// Wait until every registered connection has closed or the timeout elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(25);

        loop {
            if self.connections.is_empty() {
                tracing::info!(elapsed = ?start.elapsed(), "All connections drained");
                return true;
            }
            if start.elapsed() >= timeout {
                break;
            }

            tracing::debug!(
                connections = self.active_connection_count(),
                active_requests = self.total_active_requests(),
                elapsed = ?start.elapsed(),
                "Waiting for connections to drain"
            );
            sleep(check_interval.min(timeout.saturating_sub(start.elapsed()))).await;
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }

        tracing::warn!(
            connections = self.active_connection_count(),
            active_requests = self.total_active_requests(),
            timeout = ?timeout,
            "Drain timeout exceeded"
        );
        false
    }

    /// Snapshot of every open connection.
    pub async fn get_all_connections(&self) -> Vec<Arc<ConnectionInfo>> {
        let mut connections = Vec::new();
        self.connections
            .retain_async(|_, info| {
                connections.push(info.clone());
                true
            })
            .await;
        connections
    }

    pub async fn get_stats(&self) -> ConnectionStats {
        let all_connections = self.get_all_connections().await;
        let total_connections = all_connections.len();
        let idle_connections = all_connections.iter().filter(|c| c.is_idle()).count();
        let oldest_connection_age = all_connections
            .iter()
            .map(|c| c.age())
            .max()
            .unwrap_or_default();

        ConnectionStats {
            total_connections,
            active_connections: total_connections - idle_connections,
            idle_connections,
            total_active_requests: self.total_active_requests(),
            oldest_connection_age,
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_active_requests: u64,
    pub oldest_connection_age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_registration() {
        let tracker = ConnectionTracker::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let conn = tracker.register_connection(addr).await;
        assert_eq!(conn.remote_addr, addr);
        assert_eq!(tracker.active_connection_count(), 1);

        conn.set_server_name("example.com");
        let all = tracker.get_all_connections().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].server_name(), Some("example.com"));

        tracker.unregister_connection(conn.id).await;
        assert_eq!(tracker.active_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_request_guard() {
        let tracker = ConnectionTracker::new();
        let conn = tracker
            .register_connection("127.0.0.1:8080".parse().unwrap())
            .await;
        assert!(conn.is_idle());

        let guard = conn.begin_request();
        assert_eq!(conn.active_request_count(), 1);
        assert_eq!(tracker.total_active_requests(), 1);

        drop(guard);
        assert!(conn.is_idle());
        assert_eq!(tracker.total_active_requests(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_connections() {
        let tracker = ConnectionTracker::new();
        let conn = tracker
            .register_connection("127.0.0.1:8080".parse().unwrap())
            .await;

        assert!(!tracker.wait_for_drain(Duration::from_millis(50)).await);

        let closer = tracker.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            closer.unregister_connection(conn.id).await;
        });
        assert!(tracker.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let tracker = ConnectionTracker::new();
        let conn1 = tracker
            .register_connection("127.0.0.1:8080".parse().unwrap())
            .await;
        let _conn2 = tracker
            .register_connection("127.0.0.1:8081".parse().unwrap())
            .await;

        let _guard = conn1.begin_request();

        let stats = tracker.get_stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_active_requests, 1);
    }
}
