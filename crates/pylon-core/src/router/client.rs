//! Client side of the dispatch router.
//!
//! Tracks the single server connection in a [`LivenessContext`] and keeps it
//! fresh with heartbeats.

use super::{Dispatcher, MessageRouter};
use crate::config::{RpcConfig, RpcDefaults};
use crate::connection::ConnectionHandle;
use crate::liveness::LivenessContext;
use crate::message::{Message, Payload};
use crate::registry::ServiceRegistry;
use crate::response::Response;
use crate::{Result, RpcError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Router for a client's connection to its server.
pub struct ClientRouter {
    name: String,
    server: String,
    heartbeat_period: Duration,
    dispatcher: Dispatcher,
    liveness: Mutex<LivenessContext>,
    heartbeat_now: Notify,
    /// Set by [`close`](ClientRouter::close); later connections are refused.
    closed: AtomicBool,
}

impl ClientRouter {
    /// `name` is announced in heartbeats; `server` labels the remote side in
    /// errors. Must be called within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        config: &RpcConfig,
        registry: ServiceRegistry,
    ) -> Self {
        let name = name.into();
        Self {
            dispatcher: Dispatcher::new(
                format!("client-{}", name),
                registry,
                config.worker_threads,
                config.worker_queue_capacity,
            ),
            name,
            server: server.into(),
            heartbeat_period: config.heartbeat_period,
            liveness: Mutex::new(LivenessContext::new()),
            heartbeat_now: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Snapshot of the server's liveness context.
    pub fn liveness(&self) -> LivenessContext {
        self.liveness.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        self.liveness.lock().is_live(self.heartbeat_period)
    }

    /// Call a service on the server.
    ///
    /// Refused with [`RpcError::ConnectionNotActive`] unless the connection is
    /// up and a heartbeat succeeded within two heartbeat periods.
    pub async fn send(&self, kind: &str, payload: &Payload) -> Result<Response> {
        let conn = self
            .liveness
            .lock()
            .live_handle(self.heartbeat_period)
            .cloned()
            .ok_or_else(|| RpcError::not_active(self.server.clone()))?;

        let message = Message::request(kind, payload)?;
        self.dispatcher.call(&conn, &self.server, message).await
    }

    /// Send one heartbeat and refresh liveness on success.
    ///
    /// Failures are logged only; the read timeout and reconnect loop deal
    /// with a dead link.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut payload = Payload::new();
        payload.insert("name".into(), Value::String(self.name.clone()));

        let result = match self.send(RpcDefaults::HEARTBEAT_SERVICE, &payload).await {
            Ok(response) => response.into_result().map(|_| ()),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.liveness.lock().touch();
                debug!(client = %self.name, "Heartbeat acknowledged");
            }
            Err(e) => warn!(client = %self.name, "Heartbeat to {} failed: {}", self.server, e),
        }
        result
    }

    /// Resolves when a freshly activated connection wants an immediate
    /// heartbeat.
    pub fn heartbeat_requested(&self) -> Notified<'_> {
        self.heartbeat_now.notified()
    }

    /// Close the current connection, if any, and refuse any connection that
    /// activates afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = self.liveness.lock().clear() {
            conn.close();
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        self.dispatcher.shutdown(grace).await;
    }
}

#[async_trait::async_trait]
impl MessageRouter for ClientRouter {
    async fn on_active(&self, conn: &ConnectionHandle) {
        {
            let mut liveness = self.liveness.lock();
            if self.closed.load(Ordering::Acquire) {
                drop(liveness);
                debug!(client = %self.name, "Router closed, dropping connection {}", conn);
                conn.close();
                return;
            }
            liveness.attach(conn.clone());
        }
        self.heartbeat_now.notify_one();
        info!(client = %self.name, "Connected to server {} over {}", self.server, conn);
    }

    async fn on_message(&self, conn: &ConnectionHandle, message: Message) {
        self.dispatcher.dispatch(conn, message).await;
    }

    async fn on_inactive(&self, conn: &ConnectionHandle) {
        self.liveness.lock().detach(conn.id());
        self.dispatcher.pending().fail_connection(conn.id());
        info!(client = %self.name, "Connection {} to server {} inactive", conn, self.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn router() -> ClientRouter {
        let config = RpcConfig::default().with_worker_threads(1);
        ClientRouter::new("agent1", "server", &config, ServiceRegistry::new())
    }

    fn connection() -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx, None), rx)
    }

    #[tokio::test]
    async fn test_send_without_connection_is_refused() {
        let router = router();
        let result = router.send("execute", &Payload::new()).await;
        assert!(matches!(
            result,
            Err(RpcError::ConnectionNotActive { peer }) if peer == "server"
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_names_the_client_and_refreshes_liveness() {
        let router = std::sync::Arc::new(router());
        let (conn, mut outbound) = connection();
        router.on_active(&conn).await;
        assert!(router.is_live());

        let heartbeat = {
            let router = router.clone();
            tokio::spawn(async move { router.heartbeat().await })
        };

        let ping = outbound.recv().await.unwrap();
        assert_eq!(ping.kind, "ping");
        assert_eq!(ping.payload_map().unwrap()["name"], "agent1");

        router
            .on_message(&conn, ping.respond(&Response::ok()).unwrap())
            .await;
        heartbeat.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inactive_fails_pending_and_detaches() {
        let router = std::sync::Arc::new(router());
        let (conn, mut outbound) = connection();
        router.on_active(&conn).await;

        let call = {
            let router = router.clone();
            tokio::spawn(async move { router.send("status", &Payload::new()).await })
        };
        outbound.recv().await.unwrap();

        conn.close();
        router.on_inactive(&conn).await;

        assert!(matches!(
            call.await.unwrap(),
            Err(RpcError::ConnectionNotActive { .. })
        ));
        assert!(!router.is_live());
        assert!(router.liveness().handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_refused_once_heartbeats_stop() {
        let router = router();
        let (conn, _outbound) = connection();
        router.on_active(&conn).await;
        assert!(router.is_live());

        tokio::time::advance(RpcDefaults::HEARTBEAT_PERIOD * 2 + Duration::from_millis(1)).await;

        assert!(!conn.is_closed());
        assert!(router.liveness().handle().is_some());
        assert!(matches!(
            router.send("execute", &Payload::new()).await,
            Err(RpcError::ConnectionNotActive { peer }) if peer == "server"
        ));
    }

    #[tokio::test]
    async fn test_connection_after_close_is_dropped() {
        let router = router();
        router.close();

        let (conn, _outbound) = connection();
        router.on_active(&conn).await;

        assert!(conn.is_closed());
        assert!(router.liveness().handle().is_none());
        assert!(!router.is_live());
    }

    #[tokio::test]
    async fn test_stale_inactive_keeps_newer_connection() {
        let router = router();
        let (old, _old_rx) = connection();
        let (new, _new_rx) = connection();

        router.on_active(&old).await;
        router.on_active(&new).await;
        router.on_inactive(&old).await;

        assert!(router.is_live());
        assert_eq!(router.liveness().handle().map(|h| h.id()), Some(new.id()));
    }
}
