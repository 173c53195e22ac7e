pub mod connection_tracker;
pub mod graceful_shutdown;
pub mod timeout_body;

pub use connection_tracker::{ConnectionInfo, ConnectionStats, ConnectionTracker, RequestGuard};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken};
pub use timeout_body::IdleTimeoutBody;
