//! Heartbeat-driven liveness of a remote peer.
//!
//! A peer is live while it has a connection handle and its last heartbeat is
//! no older than two heartbeat periods. Sends are gated on this rather than
//! on socket state, so a silently dead link is refused before the transport
//! notices it.

use crate::connection::{ConnectionHandle, ConnectionId};
use std::time::Duration;
use tokio::time::Instant;

/// Connection handle plus last heartbeat time for one peer.
#[derive(Debug, Clone, Default)]
pub struct LivenessContext {
    handle: Option<ConnectionHandle>,
    last_heartbeat_at: Option<Instant>,
}

impl LivenessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new connection and stamp a heartbeat.
    pub fn attach(&mut self, handle: ConnectionHandle) {
        self.handle = Some(handle);
        self.touch();
    }

    /// Record a heartbeat at the current instant.
    pub fn touch(&mut self) {
        self.last_heartbeat_at = Some(Instant::now());
    }

    /// Clear the handle if it still refers to `connection`.
    ///
    /// Returns whether the handle was cleared. A context that has already
    /// moved on to a newer connection is left untouched.
    pub fn detach(&mut self, connection: ConnectionId) -> bool {
        match &self.handle {
            Some(handle) if handle.id() == connection => {
                self.handle = None;
                true
            }
            _ => false,
        }
    }

    /// Clear the handle unconditionally.
    pub fn clear(&mut self) -> Option<ConnectionHandle> {
        self.handle.take()
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    /// True when no heartbeat was seen within two heartbeat periods.
    pub fn is_expired(&self, heartbeat_period: Duration) -> bool {
        match self.last_heartbeat_at {
            Some(at) => at.elapsed() > heartbeat_period * 2,
            None => true,
        }
    }

    /// True when attached to an open connection with a fresh heartbeat.
    pub fn is_live(&self, heartbeat_period: Duration) -> bool {
        self.live_handle(heartbeat_period).is_some()
    }

    /// The handle to send on, if the peer is live.
    pub fn live_handle(&self, heartbeat_period: Duration) -> Option<&ConnectionHandle> {
        if self.is_expired(heartbeat_period) {
            return None;
        }
        self.handle.as_ref().filter(|handle| !handle.is_closed())
    }
}
