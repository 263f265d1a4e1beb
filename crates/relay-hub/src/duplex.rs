//! Bidirectional connection actor.
//!
//! One session is a reader unit (this task) and a writer unit (spawned)
//! sharing the connection's cancellation token:
//!
//! - reader: applies `{"action": "subscribe" | "unsubscribe", "channel": ..}`
//!   control frames, records peer activity, exits on close or error
//! - writer: drains the outbound queue into the socket, sends heartbeat
//!   pings, exits on cancellation, write failure, or a dead peer
//!
//! Whichever unit finishes first runs hub teardown, which cancels the other.
//! Every write races the cancellation token and is bounded by one ping
//! interval; a peer that stops draining its socket counts as a failed write.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use relay_core::{ProtocolError, TransportError};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::hub::{Admission, Hub};
use crate::message::Message;
use crate::metrics::{HEARTBEAT_TIMEOUTS_TOTAL, PROTOCOL_ERRORS_TOTAL};
use crate::protocol::{ClientAction, parse_control_frame};

/// Upper bound on the close handshake, and on waiting for the writer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a duplex session until the peer goes away or the hub closes it.
///
/// `socket` is any WebSocket-shaped transport: axum's `WebSocket`, or an
/// in-memory pair in tests.
#[instrument(skip_all, fields(conn_id = %admission.connection.id, user_id = %admission.connection.user_id()))]
pub async fn run_duplex_session<S, E>(hub: Hub, admission: Admission, socket: S)
where
    S: Stream<Item = Result<WsMessage, E>> + Sink<WsMessage> + Send + 'static,
    <S as Sink<WsMessage>>::Error: Display + Send,
    E: Display + Send,
{
    let Admission {
        connection,
        outbound,
    } = admission;
    let (sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(run_writer(
        hub.clone(),
        connection.clone(),
        sink,
        outbound,
    ));

    let cancel = connection.cancel_token().clone();
    let max_malformed = hub.settings().max_malformed_frames;
    let mut malformed = 0u32;

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %TransportError::Receive(e.to_string()), "reader stopping");
                break;
            }
            None => {
                debug!("transport ended");
                break;
            }
        };
        connection.mark_alive();

        let text = match frame {
            WsMessage::Text(text) => Ok(text.as_str().to_owned()),
            WsMessage::Binary(data) => std::str::from_utf8(&data)
                .map(str::to_owned)
                .map_err(|_| ProtocolError::NonText),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => {
                info!("peer closed");
                break;
            }
        };

        let well_formed = match text {
            Ok(text) => apply_control_frame(&hub, &connection, &text),
            Err(e) => {
                record_malformed(e.code(), &e);
                false
            }
        };
        if well_formed {
            malformed = 0;
            continue;
        }
        malformed += 1;
        if max_malformed > 0 && malformed >= max_malformed {
            warn!(malformed, "too many malformed frames, closing");
            break;
        }
    }

    let _ = hub.teardown(&connection);
    match time::timeout(CLOSE_TIMEOUT * 2, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "writer task failed"),
        Err(_) => {
            warn!("writer stuck, aborting");
            writer.abort();
        }
    }
}

/// Apply one text control frame. Returns whether it was well formed.
fn apply_control_frame(hub: &Hub, connection: &ClientConnection, text: &str) -> bool {
    match parse_control_frame(text) {
        Ok(ClientAction::Subscribe(channel)) => {
            if let Err(e) = hub.subscribe_channel(&connection.id, &channel) {
                debug!(error = %e, channel, "subscribe after close ignored");
            }
            true
        }
        Ok(ClientAction::Unsubscribe(channel)) => {
            if let Err(e) = hub.unsubscribe_channel(&connection.id, &channel) {
                debug!(error = %e, channel, "unsubscribe after close ignored");
            }
            true
        }
        Ok(ClientAction::Unrecognized(action)) => {
            record_malformed("UNKNOWN_ACTION", &format!("unknown action {action:?}"));
            false
        }
        Err(e) => {
            record_malformed(e.code(), &e);
            false
        }
    }
}

fn record_malformed(code: &'static str, error: &dyn Display) {
    counter!(PROTOCOL_ERRORS_TOTAL, "code" => code).increment(1);
    warn!(code, error = %error, "malformed control frame");
}

async fn run_writer<W>(
    hub: Hub,
    connection: Arc<ClientConnection>,
    mut sink: W,
    mut outbound: mpsc::Receiver<Arc<Message>>,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display + Send,
{
    let cancel = connection.cancel_token().clone();
    let period = hub.settings().ping_interval().max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor = HeartbeatMonitor::new(hub.settings().max_missed_pongs);

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break "cancelled",
            next = outbound.recv() => {
                let Some(message) = next else { break "queue closed" };
                let text = match message.to_duplex_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(topic = %message.topic, error = %e, "unserializable message skipped");
                        continue;
                    }
                };
                let frame = WsMessage::Text(text.into());
                if let Err(reason) = send_frame(&mut sink, frame, &cancel, period).await {
                    break reason;
                }
            }
            _ = ticker.tick() => match monitor.on_tick(&connection) {
                HeartbeatVerdict::Probe => {
                    let frame = WsMessage::Ping(Bytes::new());
                    if let Err(reason) = send_frame(&mut sink, frame, &cancel, period).await {
                        break reason;
                    }
                }
                HeartbeatVerdict::Dead => {
                    counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    warn!(
                        missed = monitor.missed(),
                        idle_secs = connection.last_seen_elapsed().as_secs(),
                        "peer unresponsive, disconnecting"
                    );
                    break "heartbeat timeout";
                }
            },
        }
    };
    debug!(reason, "writer stopping");

    let _ = hub.teardown(&connection);
    outbound.close();
    let closed = time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
    if closed.is_err() {
        debug!("close handshake timed out");
    }
}

/// Write one frame unless the connection is cancelled first or the peer
/// does not accept it within `deadline`.
async fn send_frame<W>(
    sink: &mut W,
    frame: WsMessage,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<(), &'static str>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err("cancelled"),
        sent = time::timeout(deadline, sink.send(frame)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %TransportError::Send(e.to_string()), "send failed");
                Err("send failed")
            }
            Err(_) => {
                debug!(error = %TransportError::Send("write deadline exceeded".into()), "send failed");
                Err("send timed out")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Identity;
    use relay_settings::HubSettings;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// In-memory WebSocket: frames pushed into `incoming`, frames the server
    /// writes come out of `outgoing`.
    struct MockSocket {
        rx: mpsc::UnboundedReceiver<Result<WsMessage, String>>,
        tx: mpsc::UnboundedSender<WsMessage>,
    }

    struct Peer {
        incoming: mpsc::UnboundedSender<Result<WsMessage, String>>,
        outgoing: mpsc::UnboundedReceiver<WsMessage>,
    }

    fn mock_socket() -> (MockSocket, Peer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            MockSocket {
                rx: in_rx,
                tx: out_tx,
            },
            Peer {
                incoming: in_tx,
                outgoing: out_rx,
            },
        )
    }

    impl Stream for MockSocket {
        type Item = Result<WsMessage, String>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.get_mut().rx.poll_recv(cx)
        }
    }

    impl Sink<WsMessage> for MockSocket {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), String> {
            self.get_mut().tx.send(item).map_err(|e| e.to_string())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A peer that stopped reading: every write and flush stays pending.
    struct StalledSocket {
        rx: mpsc::UnboundedReceiver<Result<WsMessage, String>>,
    }

    impl Stream for StalledSocket {
        type Item = Result<WsMessage, String>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.get_mut().rx.poll_recv(cx)
        }
    }

    impl Sink<WsMessage> for StalledSocket {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: WsMessage) -> Result<(), String> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }
    }

    fn start_stalled(
        settings: HubSettings,
    ) -> (
        Hub,
        Arc<ClientConnection>,
        mpsc::UnboundedSender<Result<WsMessage, String>>,
        tokio::task::JoinHandle<()>,
    ) {
        let hub = Hub::new(settings);
        let admission = hub.admit_duplex(Identity::new("u1")).unwrap();
        let connection = admission.connection.clone();
        let (incoming, rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(run_duplex_session(
            hub.clone(),
            admission,
            StalledSocket { rx },
        ));
        (hub, connection, incoming, session)
    }

    fn text(s: &str) -> Result<WsMessage, String> {
        Ok(WsMessage::Text(s.to_owned().into()))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    fn start(
        settings: HubSettings,
    ) -> (Hub, Arc<ClientConnection>, Peer, tokio::task::JoinHandle<()>) {
        let hub = Hub::new(settings);
        let admission = hub.admit_duplex(Identity::new("u1")).unwrap();
        let connection = admission.connection.clone();
        let (socket, peer) = mock_socket();
        let session = tokio::spawn(run_duplex_session(hub.clone(), admission, socket));
        (hub, connection, peer, session)
    }

    #[tokio::test]
    async fn subscribe_frame_then_receive() {
        let (hub, conn, mut peer, _session) = start(HubSettings::default());
        peer.incoming
            .send(text(r#"{"action":"subscribe","channel":"room:1"}"#))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("room:1") == 1).await;

        let _ = hub.broadcast("room:1", json!({"hi": true}));
        let frame = peer.outgoing.recv().await.unwrap();
        let WsMessage::Text(body) = frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let value: serde_json::Value = serde_json::from_str(body.as_str()).unwrap();
        assert_eq!(value, json!({"channel": "room:1", "payload": {"hi": true}}));
        assert!(!conn.is_cancelled());
    }

    #[tokio::test]
    async fn unsubscribe_frame() {
        let (hub, _conn, peer, _session) = start(HubSettings::default());
        peer.incoming
            .send(text(r#"{"action":"subscribe","channel":"room:1"}"#))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("room:1") == 1).await;
        peer.incoming
            .send(text(r#"{"action":"unsubscribe","channel":"room:1"}"#))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("room:1") == 0).await;
    }

    #[tokio::test]
    async fn binary_control_frames_accepted() {
        let (hub, _conn, peer, _session) = start(HubSettings::default());
        let body = br#"{"action":"subscribe","channel":"bin"}"#;
        peer.incoming
            .send(Ok(WsMessage::Binary(Bytes::from_static(body))))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("bin") == 1).await;
    }

    #[tokio::test]
    async fn malformed_frames_tolerated_below_limit() {
        let (hub, conn, peer, _session) = start(HubSettings {
            max_malformed_frames: 3,
            ..HubSettings::default()
        });
        for frame in ["nope", r#"{"action":"dance","channel":"x"}"#] {
            peer.incoming.send(text(frame)).unwrap();
        }
        peer.incoming
            .send(text(r#"{"action":"subscribe","channel":"ok"}"#))
            .unwrap();
        for frame in ["{", r#"{"action":"subscribe"}"#] {
            peer.incoming.send(text(frame)).unwrap();
        }
        peer.incoming
            .send(text(r#"{"action":"subscribe","channel":"still-ok"}"#))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("still-ok") == 1).await;
        assert!(!conn.is_cancelled());
    }

    #[tokio::test]
    async fn consecutive_malformed_frames_disconnect() {
        let (hub, conn, mut peer, session) = start(HubSettings {
            max_malformed_frames: 3,
            ..HubSettings::default()
        });
        for _ in 0..3 {
            peer.incoming.send(text("garbage")).unwrap();
        }
        time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_torn_down());
        assert_eq!(hub.stats().connections, 0);
        assert!(matches!(peer.outgoing.recv().await, Some(WsMessage::Close(_))));
    }

    #[tokio::test]
    async fn unlimited_malformed_when_zero() {
        let (hub, conn, peer, _session) = start(HubSettings {
            max_malformed_frames: 0,
            ..HubSettings::default()
        });
        for _ in 0..50 {
            peer.incoming.send(text("garbage")).unwrap();
        }
        peer.incoming
            .send(text(r#"{"action":"subscribe","channel":"alive"}"#))
            .unwrap();
        wait_until(|| hub.registry().subscriber_count("alive") == 1).await;
        assert!(!conn.is_cancelled());
    }

    #[tokio::test]
    async fn peer_close_tears_down() {
        let (hub, conn, peer, session) = start(HubSettings::default());
        peer.incoming.send(Ok(WsMessage::Close(None))).unwrap();
        time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_torn_down());
        assert_eq!(hub.registry().subscriber_count("user:u1"), 0);
    }

    #[tokio::test]
    async fn transport_error_tears_down() {
        let (hub, _conn, peer, session) = start(HubSettings::default());
        peer.incoming.send(Err("reset by peer".into())).unwrap();
        time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test]
    async fn close_connection_ends_session() {
        let (hub, conn, mut peer, session) = start(HubSettings::default());
        assert!(hub.close_connection(&conn.id));
        time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(peer.outgoing.recv().await, Some(WsMessage::Close(_))));
        assert!(!hub.close_connection(&conn.id));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (hub, conn, mut peer, session) = start(HubSettings {
            ping_interval_ms: 30_000,
            max_missed_pongs: 2,
            ..HubSettings::default()
        });
        time::timeout(Duration::from_secs(120), session)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_torn_down());
        assert_eq!(hub.registry().subscriber_count("user:u1"), 0);

        let mut pings = 0;
        while let Ok(frame) = peer.outgoing.try_recv() {
            if matches!(frame, WsMessage::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_stays_connected() {
        let (hub, conn, peer, _session) = start(HubSettings {
            ping_interval_ms: 30_000,
            max_missed_pongs: 2,
            ..HubSettings::default()
        });
        for _ in 0..10 {
            time::sleep(Duration::from_secs(20)).await;
            peer.incoming
                .send(Ok(WsMessage::Pong(Bytes::new())))
                .unwrap();
        }
        assert!(!conn.is_cancelled());
        assert_eq!(hub.stats().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_connection_ends_session_blocked_on_write() {
        let (hub, conn, _incoming, session) = start_stalled(HubSettings {
            ping_interval_ms: 30_000,
            ..HubSettings::default()
        });
        let report = hub.broadcast("user:u1", json!({"n": 1}));
        assert_eq!(report.delivered, 1);
        time::sleep(Duration::from_millis(10)).await;

        assert!(hub.close_connection(&conn.id));
        time::timeout(Duration::from_secs(60), session)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_torn_down());
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_is_torn_down() {
        let (hub, conn, _incoming, session) = start_stalled(HubSettings {
            ping_interval_ms: 30_000,
            max_missed_pongs: 2,
            ..HubSettings::default()
        });
        let _ = hub.broadcast("user:u1", json!({"n": 1}));

        time::timeout(Duration::from_secs(120), session)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_torn_down());
        assert_eq!(hub.stats().connections, 0);
        assert_eq!(hub.registry().subscriber_count("user:u1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_without_traffic_still_times_out() {
        let (hub, _conn, _incoming, session) = start_stalled(HubSettings {
            ping_interval_ms: 30_000,
            max_missed_pongs: 2,
            ..HubSettings::default()
        });
        time::timeout(Duration::from_secs(600), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.stats().connections, 0);
    }
}
