//! Centralized configuration for the RPC runtime.
//!
//! [`RpcDefaults`] holds the compiled-in constants; [`RpcConfig`] is the
//! per-endpoint runtime configuration built from them.

use crate::{Result, RpcError};
use std::time::Duration;

/// Default values for transport, liveness and worker settings.
pub struct RpcDefaults;

impl RpcDefaults {
    // Liveness
    pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    // Worker pool
    pub const WORKER_THREADS: usize = 10;
    pub const WORKER_QUEUE_CAPACITY: usize = 1000;
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

    // Transport
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;

    // Built-in services
    pub const HEARTBEAT_SERVICE: &'static str = "ping";
}

/// Runtime configuration shared by clients and servers.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Interval between heartbeats. Liveness expires after twice this.
    pub heartbeat_period: Duration,
    /// Delay before a client retries a failed or dropped connection.
    pub reconnect_delay: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Number of worker tasks executing service handlers.
    pub worker_threads: usize,
    /// Jobs that may wait for a worker before the caller runs them itself.
    pub worker_queue_capacity: usize,
    /// Messages that may wait for the connection writer.
    pub outbound_queue_capacity: usize,
    /// Largest accepted frame body, in bytes.
    pub max_frame_size: usize,
    /// Concurrent connections a server accepts.
    pub max_connections: usize,
    /// How long shutdown waits for queued handlers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: RpcDefaults::HEARTBEAT_PERIOD,
            reconnect_delay: RpcDefaults::RECONNECT_DELAY,
            connect_timeout: RpcDefaults::CONNECT_TIMEOUT,
            worker_threads: RpcDefaults::WORKER_THREADS,
            worker_queue_capacity: RpcDefaults::WORKER_QUEUE_CAPACITY,
            outbound_queue_capacity: RpcDefaults::OUTBOUND_QUEUE_CAPACITY,
            max_frame_size: RpcDefaults::MAX_FRAME_SIZE,
            max_connections: RpcDefaults::MAX_CONNECTIONS,
            shutdown_grace: RpcDefaults::SHUTDOWN_GRACE,
        }
    }
}

impl RpcConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat period.
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Set the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the connection attempt timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the number of worker tasks.
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Set the worker queue capacity.
    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the maximum number of concurrent server connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Read timeout applied to every connection: two heartbeat periods.
    pub fn read_timeout(&self) -> Duration {
        self.heartbeat_period * 2
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(RpcError::Config {
                message: message.to_string(),
            })
        };

        if self.heartbeat_period.is_zero() {
            return invalid("heartbeat_period must be greater than zero");
        }
        if self.worker_threads == 0 {
            return invalid("worker_threads must be at least 1");
        }
        if self.worker_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            return invalid("queue capacities must be at least 1");
        }
        if self.max_frame_size == 0 || self.max_connections == 0 {
            return invalid("max_frame_size and max_connections must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_is_twice_heartbeat() {
        let config = RpcConfig::new().with_heartbeat_period(Duration::from_secs(3));
        assert_eq!(config.read_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RpcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.worker_queue_capacity, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(RpcConfig::new()
            .with_heartbeat_period(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RpcConfig::new().with_worker_threads(0).validate().is_err());
        assert!(RpcConfig::new()
            .with_worker_queue_capacity(0)
            .validate()
            .is_err());
    }
}
