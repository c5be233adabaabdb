//! Server side of the dispatch router.
//!
//! Clients announce themselves by name through heartbeats; the [`PeerTable`]
//! maps each name to the connection it last pinged on.

use super::{Dispatcher, MessageRouter};
use crate::config::RpcConfig;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::liveness::LivenessContext;
use crate::message::{Message, Payload};
use crate::registry::{ServiceContext, ServiceRegistry};
use crate::response::Response;
use crate::{Result, RpcError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Client name to liveness context.
pub struct PeerTable {
    peers: DashMap<String, LivenessContext>,
    heartbeat_period: Duration,
}

impl PeerTable {
    pub fn new(heartbeat_period: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            heartbeat_period,
        }
    }

    /// Record a heartbeat from `name` arriving on `conn`.
    ///
    /// A ping on a different connection than the recorded one rebinds the
    /// name to it.
    pub fn record_heartbeat(&self, name: &str, conn: &ConnectionHandle) {
        let mut context = self.peers.entry(name.to_string()).or_default();
        let bound = context.handle().map(|h| h.id()) == Some(conn.id());
        if bound {
            context.touch();
        } else {
            context.attach(conn.clone());
            info!(client = %name, "Client bound to {}", conn);
        }
    }

    /// Unbind every name still bound to `connection`. Returns those names.
    pub fn detach_connection(&self, connection: ConnectionId) -> Vec<String> {
        let mut detached = Vec::new();
        for mut entry in self.peers.iter_mut() {
            if entry.value_mut().detach(connection) {
                detached.push(entry.key().clone());
            }
        }
        detached
    }

    /// Names of live clients, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_live(self.heartbeat_period))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.live_handle(name).is_some()
    }

    pub fn live_handle(&self, name: &str) -> Option<ConnectionHandle> {
        self.peers
            .get(name)
            .and_then(|context| context.live_handle(self.heartbeat_period).cloned())
    }

    /// Handle bound to `name`, live or not.
    pub fn handle(&self, name: &str) -> Option<ConnectionHandle> {
        self.peers
            .get(name)
            .and_then(|context| context.handle().cloned())
    }

    pub fn get(&self, name: &str) -> Option<LivenessContext> {
        self.peers.get(name).map(|context| context.value().clone())
    }
}

/// Service answering client heartbeats. Expects `{"name": <client name>}`.
pub fn ping_service(
    peers: Arc<PeerTable>,
) -> impl Fn(ServiceContext, Payload) -> futures::future::Ready<anyhow::Result<Response>>
       + Send
       + Sync
       + 'static {
    move |ctx: ServiceContext, payload: Payload| {
        let result = match payload.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => {
                peers.record_heartbeat(name, ctx.connection());
                Ok(Response::ok())
            }
            _ => Err(anyhow::anyhow!("ping requires a client name")),
        };
        futures::future::ready(result)
    }
}

/// Router for every connection accepted by a server.
pub struct ServerRouter {
    name: String,
    dispatcher: Dispatcher,
    peers: Arc<PeerTable>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    stopped: AtomicBool,
}

impl ServerRouter {
    /// `registry` must already carry the ping service bound to `peers`.
    /// Must be called within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: &RpcConfig,
        registry: ServiceRegistry,
        peers: Arc<PeerTable>,
    ) -> Self {
        let name = name.into();
        Self {
            dispatcher: Dispatcher::new(
                format!("server-{}", name),
                registry,
                config.worker_threads,
                config.worker_queue_capacity,
            ),
            name,
            peers,
            connections: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn active_clients(&self) -> Vec<String> {
        self.peers.active()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.peers.is_active(name)
    }

    /// Call a service on the client registered as `name`.
    pub async fn send_to_client(&self, name: &str, kind: &str, payload: &Payload) -> Result<Response> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::Stopped);
        }
        let conn = self
            .peers
            .live_handle(name)
            .ok_or_else(|| RpcError::not_active(name))?;

        let message = Message::request(kind, payload)?;
        self.dispatcher.call(&conn, name, message).await
    }

    /// Close the connection bound to `name`. Returns false if there is none.
    pub fn disconnect_client(&self, name: &str) -> bool {
        match self.peers.handle(name) {
            Some(conn) => {
                info!(server = %self.name, client = %name, "Closing client connection {}", conn);
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Close every connection and stop the worker pool.
    pub async fn shutdown(&self, grace: Duration) {
        self.stopped.store(true, Ordering::Release);
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.dispatcher.shutdown(grace).await;
    }
}

#[async_trait::async_trait]
impl MessageRouter for ServerRouter {
    async fn on_active(&self, conn: &ConnectionHandle) {
        if self.stopped.load(Ordering::Acquire) {
            conn.close();
            return;
        }
        self.connections.insert(conn.id(), conn.clone());
        debug!(server = %self.name, "Connection {} active", conn);
    }

    async fn on_message(&self, conn: &ConnectionHandle, message: Message) {
        self.dispatcher.dispatch(conn, message).await;
    }

    async fn on_inactive(&self, conn: &ConnectionHandle) {
        self.connections.remove(&conn.id());
        for name in self.peers.detach_connection(conn.id()) {
            info!(server = %self.name, client = %name, "Client connection {} inactive", conn);
        }
        self.dispatcher.pending().fail_connection(conn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcDefaults;
    use serde_json::json;
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(5);

    fn connection() -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx, None), rx)
    }

    fn router() -> ServerRouter {
        let config = RpcConfig::default().with_worker_threads(1);
        let peers = Arc::new(PeerTable::new(config.heartbeat_period));
        let mut registry = ServiceRegistry::new();
        registry.register(RpcDefaults::HEARTBEAT_SERVICE, ping_service(peers.clone()));
        ServerRouter::new("test", &config, registry, peers)
    }

    fn ping(name: Option<&str>) -> Message {
        let mut payload = Payload::new();
        if let Some(name) = name {
            payload.insert("name".into(), json!(name));
        }
        Message::request("ping", &payload).unwrap()
    }

    #[tokio::test]
    async fn test_ping_registers_client() {
        let router = router();
        let (conn, mut outbound) = connection();
        router.on_active(&conn).await;
        assert!(router.active_clients().is_empty());

        router.on_message(&conn, ping(Some("agent1"))).await;
        let reply = outbound.recv().await.unwrap();
        assert!(reply.response().unwrap().is_success());

        assert_eq!(router.active_clients(), vec!["agent1".to_string()]);
        assert!(router.is_active("agent1"));
        assert!(!router.is_active("agent2"));
    }

    #[tokio::test]
    async fn test_ping_without_name_is_an_error_response() {
        let router = router();
        let (conn, mut outbound) = connection();
        router.on_active(&conn).await;

        router.on_message(&conn, ping(None)).await;
        let response = outbound.recv().await.unwrap().response().unwrap();
        assert!(!response.is_success());
        assert!(router.active_clients().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_connection_unbinds_client() {
        let router = router();
        let (conn, mut outbound) = connection();
        router.on_active(&conn).await;
        router.on_message(&conn, ping(Some("agent1"))).await;
        outbound.recv().await.unwrap();

        conn.close();
        router.on_inactive(&conn).await;

        assert!(router.active_clients().is_empty());
        assert!(matches!(
            router.send_to_client("agent1", "execute", &Payload::new()).await,
            Err(RpcError::ConnectionNotActive { peer }) if peer == "agent1"
        ));
    }

    #[tokio::test]
    async fn test_reconnected_client_survives_stale_inactive() {
        let peers = PeerTable::new(PERIOD);
        let (old, _old_rx) = connection();
        let (new, _new_rx) = connection();

        peers.record_heartbeat("agent1", &old);
        peers.record_heartbeat("agent1", &new);

        assert!(peers.detach_connection(old.id()).is_empty());
        assert!(peers.is_active("agent1"));
        assert_eq!(peers.live_handle("agent1").map(|h| h.id()), Some(new.id()));

        assert_eq!(peers.detach_connection(new.id()), vec!["agent1".to_string()]);
        assert!(!peers.is_active("agent1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_client_not_active() {
        let peers = PeerTable::new(PERIOD);
        let (conn, _rx) = connection();
        peers.record_heartbeat("agent1", &conn);
        peers.record_heartbeat("agent2", &conn);

        tokio::time::advance(PERIOD).await;
        peers.record_heartbeat("agent2", &conn);
        tokio::time::advance(PERIOD + Duration::from_millis(1)).await;

        assert_eq!(peers.active(), vec!["agent2".to_string()]);
        assert!(peers.live_handle("agent1").is_none());
        assert!(peers.handle("agent1").is_some());
    }

    #[tokio::test]
    async fn test_active_clients_sorted() {
        let peers = PeerTable::new(PERIOD);
        for name in ["zeta", "alpha", "mid"] {
            let (conn, _rx) = connection();
            peers.record_heartbeat(name, &conn);
        }
        assert_eq!(peers.active(), vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_refused() {
        let router = router();
        router.shutdown(Duration::from_millis(10)).await;
        assert!(matches!(
            router.send_to_client("agent1", "execute", &Payload::new()).await,
            Err(RpcError::Stopped)
        ));
    }
}
