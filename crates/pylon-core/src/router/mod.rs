//! Inbound message routing.
//!
//! A [`MessageRouter`] receives the lifecycle events of every connection it
//! serves. Both the client and the server variant delegate the per-message
//! work to a shared [`Dispatcher`]:
//!
//! - **Responses** complete the matching pending call.
//! - **Requests** run their registered handler on the worker pool and always
//!   produce exactly one response on the same connection.

pub mod client;
pub mod server;

pub use client::ClientRouter;
pub use server::{PeerTable, ServerRouter};

use crate::connection::ConnectionHandle;
use crate::message::Message;
use crate::pending::PendingCalls;
use crate::registry::{ServiceContext, ServiceHandler, ServiceRegistry};
use crate::response::Response;
use crate::worker::WorkerPool;
use crate::{Result, RpcError};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receiver of connection lifecycle events.
#[async_trait::async_trait]
pub trait MessageRouter: Send + Sync + 'static {
    /// The connection is established and ready for writes.
    async fn on_active(&self, conn: &ConnectionHandle);

    /// A frame was decoded from the connection.
    async fn on_message(&self, conn: &ConnectionHandle, message: Message);

    /// The connection failed. The connection is closed afterwards either way.
    async fn on_error(&self, conn: &ConnectionHandle, error: &RpcError) {
        match error {
            RpcError::ReadTimeout(_) => warn!("Connection {} timed out: {}", conn, error),
            _ => error!("Connection {} error: {}", conn, error),
        }
        conn.close();
    }

    /// The connection is gone; nothing more can be written to it.
    async fn on_inactive(&self, conn: &ConnectionHandle);
}

/// Shared classification, execution and correlation logic.
pub struct Dispatcher {
    endpoint: String,
    registry: Arc<ServiceRegistry>,
    pool: WorkerPool,
    pending: PendingCalls,
}

impl Dispatcher {
    /// Must be called within a Tokio runtime: it spawns the worker pool.
    pub fn new(
        endpoint: impl Into<String>,
        registry: ServiceRegistry,
        worker_threads: usize,
        worker_queue_capacity: usize,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            pool: WorkerPool::new(endpoint.clone(), worker_threads, worker_queue_capacity),
            endpoint,
            registry: Arc::new(registry),
            pending: PendingCalls::new(),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Route one inbound message.
    pub async fn dispatch(&self, conn: &ConnectionHandle, message: Message) {
        if message.is_response {
            self.complete(message);
        } else {
            self.serve(conn, message).await;
        }
    }

    fn complete(&self, message: Message) {
        if !self.pending.contains(&message.request_id) {
            warn!(
                endpoint = %self.endpoint,
                request_id = %message.request_id,
                kind = %message.kind,
                "No pending call for response, dropping"
            );
            return;
        }

        let result = message.response();
        if let Err(e) = &result {
            error!(endpoint = %self.endpoint, kind = %message.kind, "Handle response message error: {}", e);
        }
        self.pending.complete(&message.request_id, result);
    }

    async fn serve(&self, conn: &ConnectionHandle, message: Message) {
        let Some(handler) = self.registry.get(&message.kind) else {
            debug!(endpoint = %self.endpoint, kind = %message.kind, "No service registered");
            let response = Response::error(RpcError::ServiceNotFound(message.kind.clone()).to_string());
            reply(conn, &message, &response).await;
            return;
        };

        let request = message.clone();
        let job_conn = conn.clone();
        let job = async move {
            let response = invoke(handler, &job_conn, &message).await;
            reply(&job_conn, &message, &response).await;
        }
        .boxed();

        if let Err(e) = self.pool.execute(job).await {
            warn!(endpoint = %self.endpoint, kind = %request.kind, "Rejecting request: {}", e);
            reply(conn, &request, &Response::error(e.to_string())).await;
        }
    }

    /// Write `message` to `conn` and wait for the correlated response.
    ///
    /// `peer` names the remote side in errors and logs.
    pub async fn call(&self, conn: &ConnectionHandle, peer: &str, message: Message) -> Result<Response> {
        let request_id = message.request_id.clone();
        let rx = self
            .pending
            .register(&request_id, &message.kind, peer, conn.id())?;
        let mut guard = CancelOnDrop {
            pending: &self.pending,
            request_id: &request_id,
        };

        conn.send(message).await?;

        // The connection may have been swept between registration and the
        // write; if so nobody else will resolve the call.
        if conn.is_closed() && self.pending.cancel(&request_id) {
            return Err(RpcError::not_active(peer));
        }

        let result = rx.await.map_err(|_| RpcError::not_active(peer))?;
        guard.disarm();
        result
    }

    /// Stop the worker pool and fail every call still waiting.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
        let failed = self.pending.fail_all();
        if failed > 0 {
            debug!(endpoint = %self.endpoint, failed, "Failed pending calls on shutdown");
        }
    }
}

/// Removes a pending call if the caller stops waiting before it resolves.
struct CancelOnDrop<'a> {
    pending: &'a PendingCalls,
    request_id: &'a str,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.request_id = "";
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if !self.request_id.is_empty() {
            self.pending.cancel(self.request_id);
        }
    }
}

async fn invoke(handler: Arc<dyn ServiceHandler>, conn: &ConnectionHandle, message: &Message) -> Response {
    let payload = match message.payload_map() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(kind = %message.kind, "Invalid request payload: {}", e);
            return Response::error(format!("invalid payload for [{}]: {}", message.kind, e));
        }
    };
    let ctx = ServiceContext::new(message.kind.clone(), message.request_id.clone(), conn.clone());

    match AssertUnwindSafe(handler.handle(ctx, payload)).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(kind = %message.kind, "Handle service error: {:#}", e);
            Response::error(e.to_string())
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(kind = %message.kind, "Service panicked: {}", reason);
            Response::error(reason)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "service panicked".to_string()
    }
}

async fn reply(conn: &ConnectionHandle, request: &Message, response: &Response) {
    let message = match request.respond(response) {
        Ok(message) => message,
        Err(e) => {
            error!(kind = %request.kind, "Failed to encode response: {}", e);
            match request.respond(&Response::error(format!("failed to encode response: {}", e))) {
                Ok(message) => message,
                Err(_) => return,
            }
        }
    };

    let error = match conn.send(message).await {
        Ok(()) => return,
        Err(e @ RpcError::Protocol { .. }) => e,
        Err(e) => {
            debug!(kind = %request.kind, "Could not write response to {}: {}", conn, e);
            return;
        }
    };

    // The reply does not fit in a frame; tell the caller instead of
    // leaving it waiting.
    warn!(kind = %request.kind, "Response to {} rejected: {}", conn, error);
    let fallback = Response::error(format!("response too large: {}", error));
    let sent = match request.respond(&fallback) {
        Ok(message) => conn.send(message).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        debug!(kind = %request.kind, "Could not write response to {}: {}", conn, e);
    }
}
