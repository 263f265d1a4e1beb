//! Cross-process bridge: replicates global broadcasts over a [`MessageBus`].
//!
//! Outbound, [`Bridge::publish`] wraps a message in an [`Envelope`] and
//! publishes it. Inbound, one listener task decodes envelopes from the bus
//! channel and hands them to the local [`Dispatcher`]. The listener never
//! publishes, so a message crosses the bus at most once. When the bus drops
//! the subscription, the listener resubscribes with capped backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use parking_lot::Mutex;
use relay_core::{BridgeError, NodeId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{BusStream, MessageBus};
use crate::dispatcher::Dispatcher;
use crate::message::{Envelope, Message};
use crate::metrics::{BRIDGE_ERRORS_TOTAL, BRIDGE_PUBLISHED_TOTAL, BRIDGE_RECEIVED_TOTAL};

const RESUBSCRIBE_MIN: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Handle to the bus bridge. Disabled bridges are no-ops.
pub struct Bridge {
    bus: Option<Arc<dyn MessageBus>>,
    channel: String,
    node_id: NodeId,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    subscribed: Arc<AtomicBool>,
}

impl Bridge {
    /// A bridge that never publishes and never listens.
    pub fn disabled() -> Self {
        Self {
            bus: None,
            channel: String::new(),
            node_id: NodeId::new(),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to `channel` and spawn the inbound listener.
    ///
    /// An unreachable bus yields a disabled bridge: the process keeps
    /// serving its local subscribers.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        node_id: NodeId,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        let channel = channel.into();
        let stream = match bus.subscribe(&channel).await {
            Ok(stream) => stream,
            Err(e) => {
                record_error(&e);
                warn!(
                    channel = %channel,
                    error = %e,
                    "bus unreachable, running single-process"
                );
                return Self::disabled();
            }
        };

        let subscribed = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_listener(
            Listener {
                bus: bus.clone(),
                channel: channel.clone(),
                node_id: node_id.clone(),
                dispatcher,
                cancel: cancel.clone(),
                subscribed: subscribed.clone(),
            },
            stream,
        ));
        info!(channel = %channel, node_id = %node_id, "bridge listening");

        Self {
            bus: Some(bus),
            channel,
            node_id,
            cancel,
            listener: Mutex::new(Some(handle)),
            subscribed,
        }
    }

    /// Whether a bus is attached.
    pub fn is_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Bus channel, empty when disabled.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Node ID stamped on every published envelope.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Publish `message` to the bus. Failures are logged and counted, never
    /// returned. Returns whether the envelope reached the bus.
    pub async fn publish(&self, message: &Message) -> bool {
        let Some(bus) = &self.bus else {
            return false;
        };
        if self.cancel.is_cancelled() {
            debug!(topic = %message.topic, "bridge stopped, not publishing");
            return false;
        }

        let result = match Envelope::from_message(message, &self.node_id).encode() {
            Ok(text) => bus.publish(&self.channel, text).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                counter!(BRIDGE_PUBLISHED_TOTAL).increment(1);
                debug!(topic = %message.topic, "published to bus");
                true
            }
            Err(e) => {
                record_error(&e);
                warn!(topic = %message.topic, error = %e, "bus publish failed");
                false
            }
        }
    }

    /// Stop the listener. Does not wait for it.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.subscribed.store(false, Ordering::Release);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Whether the listener is running and currently holds a bus
    /// subscription. False while it is resubscribing.
    pub fn is_listening(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
            && self
                .listener
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("enabled", &self.is_enabled())
            .field("listening", &self.is_listening())
            .field("channel", &self.channel)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

fn record_error(error: &BridgeError) {
    counter!(BRIDGE_ERRORS_TOTAL, "kind" => error.code()).increment(1);
}

struct Listener {
    bus: Arc<dyn MessageBus>,
    channel: String,
    node_id: NodeId,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    subscribed: Arc<AtomicBool>,
}

#[instrument(skip_all, name = "bridge_listener", fields(node_id = %listener.node_id))]
async fn run_listener(listener: Listener, mut stream: BusStream) {
    loop {
        if !listener.drain(&mut stream).await {
            break;
        }
        listener.subscribed.store(false, Ordering::Release);
        warn!(channel = %listener.channel, "bus subscription ended, resubscribing");
        match listener.resubscribe().await {
            Some(next) => stream = next,
            None => break,
        }
        listener.subscribed.store(true, Ordering::Release);
        info!(channel = %listener.channel, "bus resubscribed");
    }
    listener.subscribed.store(false, Ordering::Release);
    info!("bridge listener stopped");
}

impl Listener {
    /// Dispatch envelopes until the stream ends (true) or the bridge is
    /// cancelled (false).
    async fn drain(&self, stream: &mut BusStream) -> bool {
        loop {
            let raw = tokio::select! {
                () = self.cancel.cancelled() => return false,
                next = stream.next() => match next {
                    Some(raw) => raw,
                    None => return true,
                },
            };

            let envelope = match Envelope::decode(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    record_error(&e);
                    warn!(error = %e, "undecodable envelope on bus, skipping");
                    continue;
                }
            };
            if envelope.is_from(&self.node_id) {
                continue;
            }

            counter!(BRIDGE_RECEIVED_TOTAL).increment(1);
            let report = self.dispatcher.dispatch(Arc::new(envelope.into_message()));
            debug!(delivered = report.delivered, "bus message dispatched locally");
        }
    }

    /// Retry the subscription with doubling delay. `None` once cancelled.
    async fn resubscribe(&self) -> Option<BusStream> {
        let mut delay = RESUBSCRIBE_MIN;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            match self.bus.subscribe(&self.channel).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    record_error(&e);
                    warn!(error = %e, retry_ms = delay.as_millis() as u64, "bus resubscribe failed");
                    delay = (delay * 2).min(RESUBSCRIBE_MAX);
                }
            }
        }
    }
}
