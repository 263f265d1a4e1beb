//! Per-connection state shared between a connection's actor(s) and the
//! dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_core::{ConnectionId, EnqueueError, Identity};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Transport shape of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bidirectional socket; the client sends control frames.
    Duplex,
    /// One-way server push; subscriptions are managed out of band.
    Stream,
}

impl TransportKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Stream => "stream",
        }
    }
}

/// A connected push client.
///
/// The dispatcher only ever calls [`try_enqueue`](Self::try_enqueue); every
/// other mutation belongs to the connection's own actor or to hub teardown.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    identity: Identity,
    kind: TransportKind,
    /// Outbound queue; the receiving half lives in the actor.
    tx: mpsc::Sender<Arc<Message>>,
    /// Shared by the actor units; firing it starts teardown.
    cancel: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the peer has shown activity since the last heartbeat check.
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    torn_down: AtomicBool,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        kind: TransportKind,
        tx: mpsc::Sender<Arc<Message>>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            kind,
            tx,
            cancel,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Owning identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Owning user ID.
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Transport shape.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue a message without waiting.
    ///
    /// A full queue drops the message and bumps the drop counter. A closed
    /// queue means the connection is already being torn down.
    pub fn try_enqueue(&self, message: Arc<Message>) -> Result<(), EnqueueError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Cancellation signal shared by this connection's actor units.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether teardown has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the teardown. Returns `true` for exactly one caller.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Whether teardown has already run (or is running).
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Record confirmed peer activity (any frame, including pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the peer was active since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last peer activity (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("kind", &self.kind)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn make_connection(
        id: &str,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(
            ConnectionId::from(id),
            Identity::new(format!("user_{id}")),
            TransportKind::Duplex,
            tx,
            CancellationToken::new(),
        );
        (Arc::new(conn), rx)
    }

    fn msg(n: u32) -> Arc<Message> {
        Arc::new(Message::new("t", json!({ "n": n })))
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection("c1", 4);
        assert_eq!(conn.id.as_str(), "c1");
        assert_eq!(conn.user_id(), "user_c1");
        assert_eq!(conn.kind(), TransportKind::Duplex);
        assert!(!conn.is_cancelled());
        assert!(!conn.is_torn_down());
    }

    #[tokio::test]
    async fn enqueue_preserves_order() {
        let (conn, mut rx) = make_connection("c1", 8);
        for i in 0..5 {
            conn.try_enqueue(msg(i)).unwrap();
        }
        for i in 0..5 {
            let m = rx.recv().await.unwrap();
            assert_eq!(m.payload["n"], i);
        }
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (conn, _rx) = make_connection("c1", 1);
        assert!(conn.try_enqueue(msg(1)).is_ok());
        assert_eq!(conn.try_enqueue(msg(2)), Err(EnqueueError::Full));
        assert_eq!(conn.try_enqueue(msg(3)), Err(EnqueueError::Full));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_queue_reports_closed_without_counting() {
        let (conn, mut rx) = make_connection("c1", 4);
        rx.close();
        assert_eq!(conn.try_enqueue(msg(1)), Err(EnqueueError::Closed));
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn teardown_claimed_once() {
        let (conn, _rx) = make_connection("c1", 1);
        assert!(conn.begin_teardown());
        assert!(!conn.begin_teardown());
        assert!(conn.is_torn_down());
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection("c1", 1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(TransportKind::Duplex.as_str(), "duplex");
        assert_eq!(TransportKind::Stream.as_str(), "stream");
    }

    #[test]
    fn debug_names_user() {
        let (conn, _rx) = make_connection("c9", 1);
        let dbg = format!("{conn:?}");
        assert!(dbg.contains("c9"));
        assert!(dbg.contains("user_c9"));
    }
}
