//! Correlation table for in-flight calls.
//!
//! Flow:
//! 1. A caller registers a request id and receives a [`PendingReceiver`]
//! 2. The request is written to the connection recorded in the entry
//! 3. The router calls [`PendingCalls::complete`] when the response arrives,
//!    or [`PendingCalls::fail_connection`] when the connection is lost
//! 4. The caller awaits the receiver
//!
//! Each entry is removed before it is resolved, so it resolves exactly once.

use crate::connection::ConnectionId;
use crate::response::Response;
use crate::{Result, RpcError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Receiving side of a pending call.
pub type PendingReceiver = oneshot::Receiver<Result<Response>>;

struct PendingCall {
    sender: oneshot::Sender<Result<Response>>,
    connection: ConnectionId,
    peer: String,
    kind: String,
    created_at: Instant,
}

/// Request id to unresolved call.
#[derive(Default)]
pub struct PendingCalls {
    pending: DashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call about to be written to `connection`.
    ///
    /// Fails if the request id is already pending.
    pub fn register(
        &self,
        request_id: &str,
        kind: &str,
        peer: &str,
        connection: ConnectionId,
    ) -> Result<PendingReceiver> {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            sender: tx,
            connection,
            peer: peer.to_string(),
            kind: kind.to_string(),
            created_at: Instant::now(),
        };

        match self.pending.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(RpcError::Other(format!(
                "request id {} is already pending",
                request_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(call);
                debug!(request_id, kind, peer, %connection, "Registered pending call");
                Ok(rx)
            }
        }
    }

    /// Resolve a call. Returns false if the id was unknown or already resolved.
    pub fn complete(&self, request_id: &str, result: Result<Response>) -> bool {
        let Some((_, call)) = self.pending.remove(request_id) else {
            warn!(request_id, "Response for unknown or already completed call");
            return false;
        };

        debug!(
            request_id,
            kind = %call.kind,
            peer = %call.peer,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "Completed pending call"
        );
        if call.sender.send(result).is_err() {
            debug!(request_id, "Caller stopped waiting for response");
        }
        true
    }

    /// Remove a call without resolving it through the table.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Fail every call written to `connection`. Returns how many were failed.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let request_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for request_id in request_ids {
            if let Some((_, call)) = self.pending.remove(&request_id) {
                let _ = call.sender.send(Err(RpcError::not_active(call.peer)));
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(%connection, failed, "Failed pending calls on inactive connection");
        }
        failed
    }

    /// Fail every call, whatever its connection.
    pub fn fail_all(&self) -> usize {
        let request_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for request_id in request_ids {
            if let Some((_, call)) = self.pending.remove(&request_id) {
                let _ = call.sender.send(Err(RpcError::Stopped));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }
}
