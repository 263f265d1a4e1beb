//! Local fan-out.

use std::sync::Arc;

use metrics::counter;
use relay_core::EnqueueError;
use tracing::{debug, warn};

use crate::message::Message;
use crate::metrics::{DISPATCH_DROPS_TOTAL, DISPATCH_TOTAL};
use crate::registry::TopicRegistry;

/// Outcome of one dispatch. Callers are free to ignore it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers the message was queued for.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers already mid-teardown.
    pub closed: usize,
}

/// Delivers messages to the local subscribers of a topic.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TopicRegistry>,
}

impl Dispatcher {
    /// Dispatch over the given registry.
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher reads from.
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Queue `message` for every current subscriber of its topic.
    ///
    /// Never blocks: a full subscriber queue drops the message for that
    /// subscriber only.
    pub fn dispatch(&self, message: Arc<Message>) -> DispatchReport {
        let subscribers = self.registry.snapshot(&message.topic);
        let mut report = DispatchReport::default();
        if subscribers.is_empty() {
            debug!(topic = %message.topic, "no local subscribers");
            return report;
        }

        for conn in &subscribers {
            match conn.try_enqueue(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(EnqueueError::Full) => {
                    report.dropped += 1;
                    counter!(DISPATCH_DROPS_TOTAL).increment(1);
                    warn!(
                        conn_id = %conn.id,
                        topic = %message.topic,
                        dropped_total = conn.drop_count(),
                        "outbound queue full, dropping message"
                    );
                }
                Err(EnqueueError::Closed) => {
                    report.closed += 1;
                    debug!(conn_id = %conn.id, topic = %message.topic, "subscriber closing, skipped");
                }
            }
        }

        counter!(DISPATCH_TOTAL).increment(report.delivered as u64);
        debug!(
            topic = %message.topic,
            delivered = report.delivered,
            dropped = report.dropped,
            "dispatched"
        );
        report
    }
}
