//! Unidirectional push-stream actor.
//!
//! A single loop over the outbound queue, a keepalive timer and the
//! connection's cancellation token, producing `text/event-stream` bytes.
//! Subscriptions for streams are managed out of band through
//! [`Hub::subscribe_stream`] and friends.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::hub::{Admission, Hub};
use crate::message::{Message, keepalive_frame};

enum Step {
    Deliver(Arc<Message>),
    Keepalive,
    Stop(&'static str),
}

/// Tears the connection down when the stream is dropped, which is how the
/// HTTP layer reports a client that went away.
struct StreamGuard {
    hub: Hub,
    connection: Arc<ClientConnection>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let _ = self.hub.teardown(&self.connection);
    }
}

/// Turn an admitted stream connection into a body stream of push frames.
///
/// The stream ends when the hub closes the connection (explicit close,
/// replacement by a newer stream, shutdown). Dropping it tears the
/// connection down.
pub fn push_stream(
    hub: Hub,
    admission: Admission,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let Admission {
        connection,
        mut outbound,
    } = admission;
    let cancel = connection.cancel_token().clone();
    let period = hub.settings().stream_keepalive().max(Duration::from_millis(1));
    let guard = StreamGuard {
        hub,
        connection: connection.clone(),
    };

    async_stream::stream! {
        let guard = guard;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(conn_id = %connection.id, user_id = %connection.user_id(), "stream opened");

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Stop("cancelled"),
                next = outbound.recv() => match next {
                    Some(message) => Step::Deliver(message),
                    None => Step::Stop("queue closed"),
                },
                _ = keepalive.tick() => Step::Keepalive,
            };
            match step {
                Step::Deliver(message) => match message.to_stream_frame() {
                    Ok(frame) => {
                        yield Ok::<_, Infallible>(Bytes::from(frame));
                    }
                    Err(e) => warn!(topic = %message.topic, error = %e, "unserializable message skipped"),
                },
                Step::Keepalive => {
                    yield Ok::<_, Infallible>(Bytes::from(keepalive_frame(Utc::now())));
                }
                Step::Stop(reason) => {
                    debug!(conn_id = %connection.id, reason, "stream ending");
                    break;
                }
            }
        }

        drop(guard);
        outbound.close();
    }
}
