//! Service handlers and the table mapping message types to them.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::message::Payload;
use crate::response::Response;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// What a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    kind: String,
    request_id: String,
    connection: ConnectionHandle,
}

impl ServiceContext {
    pub(crate) fn new(kind: String, request_id: String, connection: ConnectionHandle) -> Self {
        Self {
            kind,
            request_id,
            connection,
        }
    }

    /// The message type being served.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    pub(crate) fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

/// Handler invoked for inbound requests of one message type.
///
/// An `Err` is reported to the caller as an error [`Response`] carrying the
/// error's message. Any `Fn(ServiceContext, Payload) -> Future` closure is a
/// handler.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: ServiceContext, payload: Payload) -> anyhow::Result<Response>;
}

#[async_trait::async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(ServiceContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn handle(&self, ctx: ServiceContext, payload: Payload) -> anyhow::Result<Response> {
        (self)(ctx, payload).await
    }
}

/// Message type to handler. Frozen once an endpoint starts.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl ServiceHandler) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered message types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait::async_trait]
    impl ServiceHandler for Echo {
        async fn handle(&self, _ctx: ServiceContext, payload: Payload) -> anyhow::Result<Response> {
            Ok(Response::ok_with(serde_json::Value::Object(payload)))
        }
    }

    fn context(kind: &str) -> ServiceContext {
        let (tx, _rx) = mpsc::channel(1);
        ServiceContext::new(kind.into(), "r1".into(), ConnectionHandle::new(tx, None))
    }

    #[tokio::test]
    async fn test_struct_and_closure_handlers() {
        let mut registry = ServiceRegistry::new();
        registry.register("echo", Echo);
        registry.register("fail", |_ctx: ServiceContext, _payload: Payload| async move {
            Err::<Response, _>(anyhow::anyhow!("boom"))
        });

        assert_eq!(registry.kinds(), vec!["echo".to_string(), "fail".to_string()]);

        let mut payload = Payload::new();
        payload.insert("x".into(), json!(1));
        let echo = registry.get("echo").unwrap();
        let response = echo.handle(context("echo"), payload).await.unwrap();
        assert_eq!(response.data, Some(json!({"x": 1})));

        let fail = registry.get("fail").unwrap();
        let err = fail.handle(context("fail"), Payload::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_missing_service() {
        let registry = ServiceRegistry::new();
        assert!(registry.get("no-such-service").is_none());
        assert!(!registry.contains("no-such-service"));
    }
}
