//! Live connection objects.
//!
//! A connection is the hub's view of one client socket: an id, the user it
//! belongs to, a lifecycle state and a bounded outbound queue of encoded
//! frames. The transport owns the [`ConnectionHandle`] and drains it.

use bytes::Bytes;
use pulse_chat_protocol::{codec, Event, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use uuid::Uuid;

use super::{Hub, HubInner};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Connection lifecycle.
///
/// `Connecting -> Registered -> (Active | Draining) -> Closed`. States only
/// move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, not yet in any channel.
    Connecting = 0,
    /// In the fan-out set of at least one registration call.
    Registered = 1,
    /// Has received at least one frame.
    Active = 2,
    /// Removed from the hub; the queue is closed for writes and drains.
    Draining = 3,
    /// The receiver observed the end of the stream or was dropped.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Active,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the hub may still enqueue frames.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        *self < ConnectionState::Draining
    }
}

/// State shared between the hub and the handle.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) user_id: Uuid,
    state: AtomicU8,
    delivered: AtomicU64,
}

impl ConnectionShared {
    pub(crate) fn new(id: ConnectionId, user_id: Uuid) -> Self {
        Self {
            id,
            user_id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            delivered: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if it is ahead of the current state. Returns whether
    /// the state changed.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }

    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.advance(ConnectionState::Active);
    }
}

/// The receiving end of a connection's outbound queue.
///
/// Dropping the handle closes the connection and unregisters it from the
/// hub, if the hub is still alive.
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    receiver: mpsc::Receiver<Bytes>,
    hub: Weak<HubInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        receiver: mpsc::Receiver<Bytes>,
        hub: Weak<HubInner>,
    ) -> Self {
        Self {
            shared,
            receiver,
            hub,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.shared.user_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Frames enqueued for this connection so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Wait for the next encoded frame.
    ///
    /// Returns `None` once the connection has been unregistered and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let frame = self.receiver.recv().await;
        if frame.is_none() {
            self.shared.advance(ConnectionState::Closed);
        }
        frame
    }

    /// Take a frame if one is ready.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if nothing is queued, `Disconnected` once the
    /// connection is closed and drained.
    pub fn try_recv(&mut self) -> Result<Bytes, TryRecvError> {
        let frame = self.receiver.try_recv();
        if matches!(frame, Err(TryRecvError::Disconnected)) {
            self.shared.advance(ConnectionState::Closed);
        }
        frame
    }

    /// Wait for the next frame and decode it.
    pub async fn recv_event(&mut self) -> Option<Result<Event, ProtocolError>> {
        self.recv().await.map(|frame| codec::decode(&frame))
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            Hub { inner }.unregister(self.shared.id);
        }
        self.shared.advance(ConnectionState::Closed);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("user_id", &self.shared.user_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        let shared = ConnectionShared::new(ConnectionId::generate(), Uuid::new_v4());
        assert_eq!(shared.state(), ConnectionState::Connecting);

        assert!(shared.advance(ConnectionState::Registered));
        assert!(shared.advance(ConnectionState::Active));
        assert!(!shared.advance(ConnectionState::Registered));
        assert_eq!(shared.state(), ConnectionState::Active);

        assert!(shared.advance(ConnectionState::Closed));
        assert!(!shared.advance(ConnectionState::Draining));
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_writable_states() {
        assert!(ConnectionState::Registered.is_writable());
        assert!(ConnectionState::Active.is_writable());
        assert!(!ConnectionState::Draining.is_writable());
        assert!(!ConnectionState::Closed.is_writable());
    }

    #[tokio::test]
    async fn test_handle_closes_on_end_of_stream() {
        let shared = Arc::new(ConnectionShared::new(ConnectionId::generate(), Uuid::new_v4()));
        let (tx, rx) = mpsc::channel(4);
        let mut handle = ConnectionHandle::new(Arc::clone(&shared), rx, Weak::new());

        tx.send(Bytes::from_static(b"frame")).await.unwrap();
        drop(tx);

        assert_eq!(handle.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert!(handle.recv().await.is_none());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::generate();
        assert!(id.to_string().starts_with("conn_"));
    }
}
