//! Lifecycle manager: admission, administrative operations, teardown and
//! process shutdown.
//!
//! Every terminal path of a connection (transport error, peer close,
//! heartbeat timeout, [`Hub::close_connection`], stream replacement,
//! [`Hub::shutdown`]) goes through the same idempotent teardown, which
//! removes the connection from the registry before anything else so the
//! dispatcher can never observe a half-closed subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use relay_core::{AdmissionError, ConnectionId, HubError, Identity, NodeId};
use relay_settings::HubSettings;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::bus::MessageBus;
use crate::connection::{ClientConnection, TransportKind};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::message::Message;
use crate::metrics::{
    ADMISSION_REJECTED_TOTAL, CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL,
    DISCONNECTIONS_TOTAL,
};
use crate::registry::TopicRegistry;

/// A freshly admitted connection and the receiving half of its queue.
///
/// Hand both to the matching actor (`duplex::run_duplex_session` or
/// `stream::push_stream`).
#[derive(Debug)]
pub struct Admission {
    /// Shared connection state, already registered and subscribed.
    pub connection: Arc<ClientConnection>,
    /// Outbound queue drained by the actor.
    pub outbound: mpsc::Receiver<Arc<Message>>,
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Live connections of any kind.
    pub connections: usize,
    /// Live duplex connections.
    pub duplex: usize,
    /// Live push streams.
    pub streams: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Messages dropped on full queues, summed over live connections.
    pub dropped_total: u64,
    /// Whether the bus bridge holds a live subscription.
    pub bridge_enabled: bool,
}

struct HubInner {
    settings: HubSettings,
    registry: Arc<TopicRegistry>,
    dispatcher: Dispatcher,
    bridge: Bridge,
    /// user ID → that user's single active push stream.
    streams: Mutex<HashMap<String, Arc<ClientConnection>>>,
    shutdown: CancellationToken,
    node_id: NodeId,
}

/// The relay hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Single-process hub with no bus.
    pub fn new(settings: HubSettings) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        Self::assemble(
            settings,
            registry,
            dispatcher,
            Bridge::disabled(),
            NodeId::new(),
            CancellationToken::new(),
        )
    }

    /// Hub that replicates global broadcasts over `bus` on `channel`.
    ///
    /// If the bus cannot be subscribed to, the hub still starts and serves
    /// local subscribers only.
    pub async fn with_bus(
        settings: HubSettings,
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
    ) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let shutdown = CancellationToken::new();
        let node_id = NodeId::new();
        let bridge = Bridge::start(
            bus,
            channel,
            node_id.clone(),
            dispatcher.clone(),
            shutdown.child_token(),
        )
        .await;
        Self::assemble(settings, registry, dispatcher, bridge, node_id, shutdown)
    }

    fn assemble(
        settings: HubSettings,
        registry: Arc<TopicRegistry>,
        dispatcher: Dispatcher,
        bridge: Bridge,
        node_id: NodeId,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                settings,
                registry,
                dispatcher,
                bridge,
                streams: Mutex::new(HashMap::new()),
                shutdown,
                node_id,
            }),
        }
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Admit a connection for `identity`.
    ///
    /// The connection is registered and subscribed to the identity's
    /// default topics (`user:<id>`, `org:<id>`...) before this returns, so
    /// broadcasts issued afterwards reach it even before its actor runs.
    pub fn admit(
        &self,
        identity: Identity,
        kind: TransportKind,
    ) -> Result<Admission, AdmissionError> {
        if identity.is_empty() {
            return Err(reject(AdmissionError::MissingIdentity));
        }
        if self.is_shutting_down() {
            return Err(reject(AdmissionError::ShuttingDown));
        }

        let (tx, outbound) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
        let topics = identity.default_topics();
        let connection = Arc::new(ClientConnection::new(
            ConnectionId::new(),
            identity,
            kind,
            tx,
            self.inner.shutdown.child_token(),
        ));

        let max = self.inner.settings.max_connections;
        if !self.inner.registry.try_register(connection.clone(), max) {
            return Err(reject(AdmissionError::AtCapacity { max }));
        }
        let _ = self.inner.registry.subscribe(&connection.id, &topics);

        counter!(CONNECTIONS_TOTAL, "transport" => kind.as_str()).increment(1);
        gauge!(CONNECTIONS_ACTIVE, "transport" => kind.as_str()).increment(1.0);
        info!(
            conn_id = %connection.id,
            user_id = %connection.user_id(),
            transport = kind.as_str(),
            topics = ?topics,
            "connection admitted"
        );
        Ok(Admission {
            connection,
            outbound,
        })
    }

    /// Admit a duplex connection.
    pub fn admit_duplex(&self, identity: Identity) -> Result<Admission, AdmissionError> {
        self.admit(identity, TransportKind::Duplex)
    }

    /// Admit a push stream, closing any stream the same user already has.
    ///
    /// At most one stream per user ID is active at any time.
    pub fn admit_stream(&self, identity: Identity) -> Result<Admission, AdmissionError> {
        let user_id = identity.user_id.clone();
        let mut streams = self.inner.streams.lock();
        if let Some(previous) = streams.remove(&user_id) {
            info!(
                conn_id = %previous.id,
                user_id = %user_id,
                "replacing existing stream"
            );
            let _ = self.release(&previous);
        }
        let admission = self.admit(identity, TransportKind::Stream)?;
        let _ = streams.insert(user_id, admission.connection.clone());
        Ok(admission)
    }

    // ── Broadcast ───────────────────────────────────────────────────

    /// Deliver `payload` to local subscribers of `topic`.
    pub fn broadcast(&self, topic: impl Into<String>, payload: Value) -> DispatchReport {
        self.broadcast_message(Message::new(topic, payload))
    }

    /// Deliver a named event to local subscribers of `topic`.
    pub fn broadcast_event(
        &self,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> DispatchReport {
        self.broadcast_message(Message::new(topic, payload).with_event(event))
    }

    /// Deliver a prepared message to local subscribers.
    pub fn broadcast_message(&self, message: Message) -> DispatchReport {
        self.inner.dispatcher.dispatch(Arc::new(message))
    }

    /// Deliver locally, then replicate to the other processes on the bus.
    ///
    /// Bus failures are logged only; local delivery has already happened.
    pub async fn broadcast_global(&self, topic: impl Into<String>, payload: Value) -> DispatchReport {
        self.broadcast_global_message(Message::new(topic, payload)).await
    }

    /// [`broadcast_global`](Self::broadcast_global) with an event tag.
    pub async fn broadcast_global_event(
        &self,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> DispatchReport {
        self.broadcast_global_message(Message::new(topic, payload).with_event(event))
            .await
    }

    /// Deliver a prepared message locally, then publish it to the bus.
    pub async fn broadcast_global_message(&self, message: Message) -> DispatchReport {
        let message = Arc::new(message);
        let report = self.inner.dispatcher.dispatch(message.clone());
        let _ = self.inner.bridge.publish(&message).await;
        report
    }

    // ── Administration ──────────────────────────────────────────────

    /// Subscribe a live connection to `topic`.
    pub fn subscribe_channel(&self, id: &ConnectionId, topic: &str) -> Result<(), HubError> {
        if self.inner.registry.subscribe(id, [topic]) {
            debug!(conn_id = %id, topic, "subscribed");
            Ok(())
        } else {
            Err(HubError::no_connection(id.as_str()))
        }
    }

    /// Unsubscribe a live connection from `topic`.
    pub fn unsubscribe_channel(&self, id: &ConnectionId, topic: &str) -> Result<(), HubError> {
        if self.inner.registry.unsubscribe(id, topic) {
            debug!(conn_id = %id, topic, "unsubscribed");
            Ok(())
        } else {
            Err(HubError::no_connection(id.as_str()))
        }
    }

    /// Force a connection closed. Returns `false` if it was not live.
    /// Safe to call any number of times.
    pub fn close_connection(&self, id: &ConnectionId) -> bool {
        match self.inner.registry.get(id) {
            Some(connection) => self.teardown(&connection),
            None => false,
        }
    }

    /// The user's active push stream, if any.
    pub fn active_stream(&self, user_id: &str) -> Option<Arc<ClientConnection>> {
        self.inner.streams.lock().get(user_id).cloned()
    }

    /// Subscribe the user's active stream to `topic`.
    pub fn subscribe_stream(&self, user_id: &str, topic: &str) -> Result<(), HubError> {
        let stream = self
            .active_stream(user_id)
            .ok_or_else(|| HubError::no_connection(user_id))?;
        self.subscribe_channel(&stream.id, topic)
            .map_err(|_| HubError::no_connection(user_id))
    }

    /// Unsubscribe the user's active stream from `topic`.
    pub fn unsubscribe_stream(&self, user_id: &str, topic: &str) -> Result<(), HubError> {
        let stream = self
            .active_stream(user_id)
            .ok_or_else(|| HubError::no_connection(user_id))?;
        self.unsubscribe_channel(&stream.id, topic)
            .map_err(|_| HubError::no_connection(user_id))
    }

    /// Close the user's active stream. Returns `false` if there was none.
    pub fn close_stream(&self, user_id: &str) -> bool {
        match self.active_stream(user_id) {
            Some(stream) => self.teardown(&stream),
            None => false,
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Run the single teardown path for `connection`. Only the first call
    /// per connection does anything; it returns `true`.
    pub(crate) fn teardown(&self, connection: &Arc<ClientConnection>) -> bool {
        if !self.release(connection) {
            return false;
        }
        if connection.kind() == TransportKind::Stream {
            let mut streams = self.inner.streams.lock();
            if streams
                .get(connection.user_id())
                .is_some_and(|current| current.id == connection.id)
            {
                let _ = streams.remove(connection.user_id());
            }
        }
        true
    }

    /// Registry removal, then cancellation. Does not touch the stream map.
    fn release(&self, connection: &ClientConnection) -> bool {
        if !connection.begin_teardown() {
            return false;
        }
        let _ = self.inner.registry.unsubscribe_all(&connection.id);
        connection.cancel_token().cancel();

        let kind = connection.kind().as_str();
        gauge!(CONNECTIONS_ACTIVE, "transport" => kind).decrement(1.0);
        counter!(DISCONNECTIONS_TOTAL, "transport" => kind).increment(1);
        histogram!(CONNECTION_DURATION_SECONDS, "transport" => kind)
            .record(connection.age().as_secs_f64());
        info!(
            conn_id = %connection.id,
            user_id = %connection.user_id(),
            transport = kind,
            dropped = connection.drop_count(),
            "connection closed"
        );
        true
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Refuse new admissions, stop the bridge, and tear down every live
    /// connection. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("hub shutting down");
        self.inner.shutdown.cancel();
        self.inner.bridge.stop();
        for connection in self.inner.registry.connections() {
            let _ = self.teardown(&connection);
        }
        let remaining = self.inner.registry.connection_count();
        if remaining > 0 {
            warn!(remaining, "connections still registered after shutdown");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the hub shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Current counters.
    pub fn stats(&self) -> HubStats {
        let connections = self.inner.registry.connections();
        let streams = connections
            .iter()
            .filter(|c| c.kind() == TransportKind::Stream)
            .count();
        HubStats {
            connections: connections.len(),
            duplex: connections.len() - streams,
            streams,
            topics: self.inner.registry.topic_count(),
            dropped_total: connections.iter().map(|c| c.drop_count()).sum(),
            bridge_enabled: self.inner.bridge.is_listening(),
        }
    }

    /// The topic registry.
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.inner.registry
    }

    /// This process's node ID on the bus.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Hub settings in effect.
    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Whether a bus bridge is attached. See [`HubStats::bridge_enabled`]
    /// for whether it currently holds a subscription.
    pub fn bridge_enabled(&self) -> bool {
        self.inner.bridge.is_enabled()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("node_id", &self.inner.node_id)
            .field("bridge", &self.inner.bridge)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

fn reject(error: AdmissionError) -> AdmissionError {
    counter!(ADMISSION_REJECTED_TOTAL, "reason" => error.code()).increment(1);
    warn!(code = error.code(), "admission refused");
    error
}
