use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use tokio_util::task::TaskTracker;

use crate::credentials::CredentialStore;
use crate::events::EventPublisher;
use crate::queue::WorkQueue;
use crate::registry::ConnectionRegistry;

/// Tunables resolved once at startup from args.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Interval relayers are told to heartbeat at.
    pub heartbeat_interval_ms: i64,
    /// Heartbeat age past which a cluster counts as stale.
    pub stale_threshold: Duration,
    /// Health monitor period.
    pub sweep_interval: Duration,
    /// Session no-progress bound.
    pub idle_timeout: Duration,
    /// Bounded wait of one send-loop dequeue cycle.
    pub dequeue_wait: Duration,
    /// Bound on a single stream write.
    pub send_timeout: Duration,
    /// Outbound channel depth per cluster.
    pub send_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            stale_threshold: Duration::from_millis(120_000),
            sweep_interval: Duration::from_millis(30_000),
            idle_timeout: Duration::from_millis(300_000),
            dequeue_wait: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            send_channel_capacity: 64,
        }
    }
}

/// Shared application state; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub queue: Arc<dyn WorkQueue>,
    pub registry: ConnectionRegistry,
    pub credentials: CredentialStore,
    pub events: EventPublisher,
    /// Live session-driver tasks; shutdown waits for their drains.
    pub sessions: TaskTracker,
    pub config: RuntimeConfig,
}
