//! RPC client: one named endpoint holding a single connection to a server.
//!
//! The client keeps its connection alive on its own:
//! - A failed or dropped connection is retried after the reconnect delay,
//!   until [`RpcClient::disconnect`] is called.
//! - A heartbeat carrying the client's name is sent every heartbeat period
//!   and once right after each connect, which is how the server learns the
//!   client's name.
//!
//! # Example
//!
//! ```rust,ignore
//! use pylon_core::{Payload, Response, RpcClient, ServiceContext};
//!
//! let client = RpcClient::builder("agent1", "127.0.0.1:9000")
//!     .register_service("status", |_ctx: ServiceContext, _payload: Payload| async move {
//!         Ok(Response::ok_with("up"))
//!     })
//!     .build()?;
//! client.connect();
//! client.await_connected().await?;
//! ```

use crate::config::RpcConfig;
use crate::connection;
use crate::message::Payload;
use crate::registry::{ServiceHandler, ServiceRegistry};
use crate::response::Response;
use crate::router::ClientRouter;
use crate::{Result, RpcError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Where the client is in its connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    name: String,
    server_addr: String,
    config: RpcConfig,
    registry: ServiceRegistry,
}

impl RpcClientBuilder {
    pub fn new(name: impl Into<String>, server_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_addr: server_addr.into(),
            config: RpcConfig::default(),
            registry: ServiceRegistry::new(),
        }
    }

    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve `kind` requests sent by the server.
    pub fn register_service(mut self, kind: impl Into<String>, handler: impl ServiceHandler) -> Self {
        self.registry.register(kind, handler);
        self
    }

    /// Build the client without connecting it.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<RpcClient> {
        self.config.validate()?;
        if self.name.is_empty() {
            return Err(RpcError::Config {
                message: "client name must not be empty".to_string(),
            });
        }

        let router = Arc::new(ClientRouter::new(
            self.name.clone(),
            self.server_addr.clone(),
            &self.config,
            self.registry,
        ));
        let (connected, _) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            name: self.name,
            server_addr: self.server_addr,
            config: self.config,
            router,
            state: Mutex::new(ConnectionState::Disconnected),
            stopped: AtomicBool::new(false),
            connected,
            shutdown,
            heartbeat_task: Mutex::new(None),
        });

        let task = tokio::spawn(heartbeat_loop(Arc::downgrade(&inner), shutdown_rx));
        *inner.heartbeat_task.lock() = Some(task);

        Ok(RpcClient {
            _stop_on_drop: Arc::new(StopOnDrop(inner.clone())),
            inner,
        })
    }
}

/// Cloneable handle to a client endpoint.
///
/// Dropping the last clone stops the client as [`RpcClient::disconnect`]
/// would, without waiting for running handlers.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
    _stop_on_drop: Arc<StopOnDrop>,
}

/// Shared by every [`RpcClient`] clone; the connect and reconnect tasks hold
/// only [`ClientInner`].
struct StopOnDrop(Arc<ClientInner>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.0.stop() {
            return;
        }
        debug!(client = %self.0.name, "Client dropped, stopping");

        let router = self.0.router.clone();
        let grace = self.0.config.shutdown_grace;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { router.shutdown(grace).await });
        }
    }
}

struct ClientInner {
    name: String,
    server_addr: String,
    config: RpcConfig,
    router: Arc<ClientRouter>,
    state: Mutex<ConnectionState>,
    stopped: AtomicBool,
    /// Flips to true on the first successful connection and stays there.
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    pub fn builder(name: impl Into<String>, server_addr: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder::new(name, server_addr)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_addr(&self) -> &str {
        &self.inner.server_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether calls to the server would currently be attempted.
    pub fn is_live(&self) -> bool {
        self.inner.router.is_live()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Start connecting in the background.
    ///
    /// No-op while already connecting or connected, and after
    /// [`disconnect`](Self::disconnect).
    pub fn connect(&self) {
        ClientInner::connect(&self.inner);
    }

    /// Wait until the first connection has been established.
    ///
    /// Fails with [`RpcError::Stopped`] if the client is disconnected first.
    pub async fn await_connected(&self) -> Result<()> {
        let mut connected = self.inner.connected.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *connected.borrow_and_update() {
                return Ok(());
            }
            if *shutdown.borrow_and_update() {
                return Err(RpcError::Stopped);
            }
            tokio::select! {
                changed = connected.changed() => {
                    if changed.is_err() {
                        return Err(RpcError::Stopped);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Call `kind` on the server and wait for its response.
    pub async fn send_to_server(&self, kind: &str, payload: Payload) -> Result<Response> {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }
        self.inner.router.send(kind, &payload).await
    }

    /// Send one heartbeat now, outside the periodic schedule.
    pub async fn heartbeat(&self) -> Result<()> {
        self.inner.router.heartbeat().await
    }

    /// Stop reconnecting, close the connection and fail outstanding calls.
    pub async fn disconnect(&self) {
        if !self.inner.stop() {
            return;
        }
        info!(client = %self.inner.name, "Disconnecting from {}", self.inner.server_addr);

        self.inner
            .router
            .shutdown(self.inner.config.shutdown_grace)
            .await;
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.inner.name)
            .field("server_addr", &self.inner.server_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop reconnecting and heartbeats and close the live connection.
    ///
    /// Returns false if the client was already stopped.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
        self.router.close();
        true
    }

    fn connect(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Connecting;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.run_connection().await });
    }

    async fn run_connection(self: Arc<Self>) {
        debug!(client = %self.name, "Connecting to {}", self.server_addr);

        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.server_addr)).await {
            Ok(Ok(stream)) if !self.is_stopped() => {
                *self.state.lock() = ConnectionState::Connected;
                self.connected.send_replace(true);
                info!(client = %self.name, "Connect to server {} success", self.server_addr);

                connection::drive(stream, self.router.clone(), &self.config).await;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(client = %self.name, "Connect to server {} failed: {}", self.server_addr, e);
            }
            Err(_) => {
                error!(
                    client = %self.name,
                    "Connect to server {} timed out after {:?}",
                    self.server_addr,
                    self.config.connect_timeout
                );
            }
        }

        *self.state.lock() = ConnectionState::Disconnected;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        debug!(
            client = %self.name,
            "Reconnecting to {} in {:?}",
            self.server_addr,
            self.config.reconnect_delay
        );

        let inner = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.reconnect_delay) => inner.connect(),
                _ = shutdown.changed() => {}
            }
        });
    }
}

async fn heartbeat_loop(inner: std::sync::Weak<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    let (router, period) = match inner.upgrade() {
        Some(inner) => (inner.router.clone(), inner.config.heartbeat_period),
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = router.heartbeat_requested() => {}
            _ = shutdown.changed() => break,
        }

        let connected = match inner.upgrade() {
            Some(inner) => *inner.state.lock() == ConnectionState::Connected,
            None => break,
        };
        if connected {
            let _ = router.heartbeat().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_build_rejects_empty_name() {
        assert!(matches!(
            RpcClient::builder("", "127.0.0.1:1").build(),
            Err(RpcError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_not_active() {
        let client = RpcClient::builder("agent1", "127.0.0.1:1").build().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let result = client.send_to_server("status", Payload::new()).await;
        assert!(matches!(result, Err(RpcError::ConnectionNotActive { .. })));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_await_connected_fails_after_disconnect() {
        let client = RpcClient::builder("agent1", "127.0.0.1:1")
            .config(RpcConfig::default().with_shutdown_grace(Duration::from_millis(10)))
            .build()
            .unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.await_connected().await })
        };
        client.disconnect().await;

        assert!(matches!(waiter.await.unwrap(), Err(RpcError::Stopped)));
        assert!(matches!(
            client.send_to_server("status", Payload::new()).await,
            Err(RpcError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_client() {
        let client = RpcClient::builder("agent1", "127.0.0.1:1")
            .config(RpcConfig::default().with_reconnect_delay(Duration::from_millis(10)))
            .build()
            .unwrap();
        let inner = client.inner.clone();
        let copy = client.clone();

        client.connect();
        drop(client);
        assert!(!inner.is_stopped());

        drop(copy);
        assert!(inner.is_stopped());
        assert!(*inner.shutdown.borrow());
        assert!(inner.heartbeat_task.lock().is_none());
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_is_noop() {
        let client = RpcClient::builder("agent1", "127.0.0.1:1").build().unwrap();
        client.disconnect().await;
        client.connect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
