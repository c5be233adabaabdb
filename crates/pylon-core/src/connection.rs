//! Per-connection I/O.
//!
//! [`drive`] owns one TCP stream for its whole life: it spawns a writer task
//! that is the only holder of the write half, runs the read loop on the
//! calling task, and reports lifecycle events to a [`MessageRouter`].

use crate::codec::{body_len, read_message, write_message};
use crate::config::{RpcConfig, RpcDefaults};
use crate::message::Message;
use crate::router::MessageRouter;
use crate::{Result, RpcError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable handle used to write to, or close, a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    max_frame_size: usize,
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(outbound: mpsc::Sender<Message>, peer_addr: Option<SocketAddr>) -> Self {
        Self::with_frame_limit(outbound, peer_addr, RpcDefaults::MAX_FRAME_SIZE)
    }

    pub(crate) fn with_frame_limit(
        outbound: mpsc::Sender<Message>,
        peer_addr: Option<SocketAddr>,
        max_frame_size: usize,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::next(),
                peer_addr,
                max_frame_size,
                outbound,
                closed,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Queue a message for the writer task.
    ///
    /// A message that cannot be framed within the frame size limit is
    /// rejected with [`RpcError::Protocol`] and the connection stays open.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::not_active(self.to_string()));
        }
        let len = body_len(&message)?;
        if len > self.inner.max_frame_size {
            return Err(RpcError::protocol(format!(
                "frame size {} exceeds maximum {}",
                len, self.inner.max_frame_size
            )));
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| RpcError::not_active(self.to_string()))
    }

    /// Request the connection to close. Idempotent.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peer_addr {
            Some(addr) => write!(f, "{}@{}", self.inner.id, addr),
            None => write!(f, "{}", self.inner.id),
        }
    }
}

/// Run a connection until it closes, then report it inactive.
///
/// The handle is marked closed before `on_inactive` runs, so anything that
/// registers work against it afterwards can observe the closure.
pub async fn drive<R: MessageRouter + ?Sized>(stream: TcpStream, router: Arc<R>, config: &RpcConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let peer_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_capacity);
    let handle = ConnectionHandle::with_frame_limit(outbound_tx, peer_addr, config.max_frame_size);

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, handle.clone()));

    router.on_active(&handle).await;

    if let Err(e) = read_loop(reader, &handle, &*router, config).await {
        router.on_error(&handle, &e).await;
    }

    handle.close();
    if let Err(e) = writer_task.await {
        warn!("Writer task for {} ended abnormally: {}", handle, e);
    }

    router.on_inactive(&handle).await;
    debug!("Connection {} inactive", handle);
}

async fn read_loop<R: MessageRouter + ?Sized>(
    mut reader: OwnedReadHalf,
    handle: &ConnectionHandle,
    router: &R,
    config: &RpcConfig,
) -> Result<()> {
    let read_timeout = config.read_timeout();
    let mut closed = handle.closed_signal();

    loop {
        if *closed.borrow() {
            return Ok(());
        }

        let message = tokio::select! {
            _ = closed.changed() => return Ok(()),
            result = tokio::time::timeout(read_timeout, read_message(&mut reader, config.max_frame_size)) => {
                match result {
                    Err(_) => return Err(RpcError::ReadTimeout(read_timeout)),
                    Ok(Ok(Some(message))) => message,
                    Ok(Ok(None)) => return Ok(()), // Clean disconnect
                    Ok(Err(e)) => return Err(e),
                }
            }
        };

        router.on_message(handle, message).await;
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Message>,
    handle: ConnectionHandle,
) {
    let mut closed = handle.closed_signal();

    loop {
        let message = tokio::select! {
            _ = closed.changed() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Write to {} failed: {}", handle, e);
            handle.close();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let (tx, _rx) = mpsc::channel(1);
        let a = ConnectionHandle::new(tx.clone(), None);
        let b = ConnectionHandle::new(tx, None);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(tx, None);

        let message = Message::request("ping", &Default::default()).unwrap();
        handle.send(message.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(message.clone()));

        handle.close();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(message).await,
            Err(RpcError::ConnectionNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_without_closing() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::with_frame_limit(tx, None, 256);

        let mut big = Message::request("execute", &Default::default()).unwrap();
        big.payload = bytes::Bytes::from(vec![b'x'; 512]);
        assert!(matches!(
            handle.send(big).await,
            Err(RpcError::Protocol { .. })
        ));
        assert!(!handle.is_closed());

        let small = Message::request("execute", &Default::default()).unwrap();
        handle.send(small.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(small));
    }

    #[tokio::test]
    async fn test_clones_share_closed_state() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(tx, None);
        let clone = handle.clone();
        clone.close();
        assert!(handle.is_closed());
    }
}
