//! RPC server: accepts named clients and calls services on them.
//!
//! Clients are known only by the name they send in heartbeats. The built-in
//! `ping` service records that name against the connection it arrived on;
//! [`RpcServer::send_to_client`] looks the connection up by name.
//!
//! # Thread Safety
//!
//! The accept loop and every connection run in their own spawned tasks.
//! [`RpcServer`] itself is `Send + Sync` and may be shared behind an `Arc`.

use crate::config::{RpcConfig, RpcDefaults};
use crate::connection;
use crate::message::Payload;
use crate::registry::{ServiceHandler, ServiceRegistry};
use crate::response::Response;
use crate::router::server::ping_service;
use crate::router::{PeerTable, ServerRouter};
use crate::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    name: String,
    bind_addr: String,
    config: RpcConfig,
    registry: ServiceRegistry,
}

impl RpcServerBuilder {
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            config: RpcConfig::default(),
            registry: ServiceRegistry::new(),
        }
    }

    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve `kind` requests sent by clients.
    ///
    /// `ping` is reserved for heartbeats and cannot be replaced.
    pub fn register_service(mut self, kind: impl Into<String>, handler: impl ServiceHandler) -> Self {
        self.registry.register(kind, handler);
        self
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(mut self) -> Result<RpcServer> {
        self.config.validate()?;

        if self.registry.contains(RpcDefaults::HEARTBEAT_SERVICE) {
            warn!(
                "Service [{}] is reserved for heartbeats, ignoring the registered handler",
                RpcDefaults::HEARTBEAT_SERVICE
            );
        }
        let peers = Arc::new(PeerTable::new(self.config.heartbeat_period));
        self.registry
            .register(RpcDefaults::HEARTBEAT_SERVICE, ping_service(peers.clone()));

        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let router = Arc::new(ServerRouter::new(
            self.name.clone(),
            &self.config,
            self.registry,
            peers,
        ));

        info!(server = %self.name, "Rpc server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            router.clone(),
            self.config.clone(),
            shutdown_rx,
        ));

        Ok(RpcServer {
            name: self.name,
            local_addr,
            config: self.config,
            router,
            stopped: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

/// Handle to a running server. Dropping it stops accepting connections.
pub struct RpcServer {
    name: String,
    local_addr: SocketAddr,
    config: RpcConfig,
    router: Arc<ServerRouter>,
    stopped: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn builder(name: impl Into<String>, bind_addr: impl Into<String>) -> RpcServerBuilder {
        RpcServerBuilder::new(name, bind_addr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Names of clients with a live connection and a fresh heartbeat, sorted.
    pub fn active_clients(&self) -> Vec<String> {
        self.router.active_clients()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.router.is_active(name)
    }

    /// Call `kind` on client `name` and wait for its response.
    pub async fn send_to_client(&self, name: &str, kind: &str, payload: Payload) -> Result<Response> {
        self.router.send_to_client(name, kind, &payload).await
    }

    /// Drop the connection of client `name`. The client reconnects on its own.
    pub fn disconnect_client(&self, name: &str) -> bool {
        self.router.disconnect_client(name)
    }

    /// Stop accepting, close every connection and fail outstanding calls.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(server = %self.name, "Rpc server shutting down");

        self.signal_shutdown();
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                debug!("Accept loop ended abnormally: {}", e);
            }
        }
        self.router.shutdown(self.config.shutdown_grace).await;
    }

    fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

/// Accept connections until shutdown, handing each to [`connection::drive`].
///
/// A permit is held for the life of each connection; a connection arriving
/// with no permit left is closed at once.
async fn accept_loop(
    listener: TcpListener,
    router: Arc<ServerRouter>,
    config: RpcConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let config = Arc::new(config);
    let permits = Arc::new(Semaphore::new(config.max_connections));

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(server = %router.name(), "Accept failed: {}", e);
                    continue;
                }
            },
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!(
                server = %router.name(),
                "Refusing {}: {} connections already open",
                peer_addr,
                config.max_connections
            );
            drop(stream);
            continue;
        };

        debug!(server = %router.name(), "Accepted {}", peer_addr);
        let router = router.clone();
        let config = config.clone();
        tokio::spawn(async move {
            connection::drive(stream, router, &config).await;
            drop(permit);
        });
    }
    debug!(server = %router.name(), "Accept loop stopped");
}
