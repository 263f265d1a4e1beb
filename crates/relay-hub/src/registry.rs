//! Topic registry: topic → subscriber IDs, with the live connection table.
//!
//! Topics hold connection IDs, never connection handles; the handle lives in
//! one table keyed by ID, so removing a connection is a lookup and a
//! destroyed connection cannot leave a dangling topic entry. A second index
//! (connection → topics) makes full removal proportional to the
//! connection's own subscriptions.
//!
//! All state sits behind one `RwLock`: mutations take it exclusively,
//! snapshots take it shared and copy out, so an in-flight dispatch never
//! sees a half-applied change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::ConnectionId;
use tracing::debug;

use crate::connection::ClientConnection;

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    topics: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Concurrency-safe topic membership.
#[derive(Default)]
pub struct TopicRegistry {
    inner: RwLock<Inner>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the live table, refusing once `max` are live.
    pub fn try_register(&self, connection: Arc<ClientConnection>, max: usize) -> bool {
        let mut inner = self.inner.write();
        if inner.connections.len() >= max {
            return false;
        }
        let id = connection.id.clone();
        let _ = inner.memberships.entry(id.clone()).or_default();
        let _ = inner.connections.insert(id, connection);
        true
    }

    /// Add a connection to the live table.
    pub fn register(&self, connection: Arc<ClientConnection>) {
        let _ = self.try_register(connection, usize::MAX);
    }

    /// Subscribe a live connection to each topic. Idempotent; blank topics
    /// are skipped. Returns `false` if the connection is not live.
    pub fn subscribe<I, S>(&self, id: &ConnectionId, topics: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write();
        let Inner {
            connections,
            topics: topic_map,
            memberships,
        } = &mut *inner;
        if !connections.contains_key(id) {
            return false;
        }
        let joined = memberships.entry(id.clone()).or_default();
        for topic in topics {
            let topic = topic.as_ref();
            if topic.is_empty() {
                continue;
            }
            let _ = topic_map
                .entry(topic.to_owned())
                .or_default()
                .insert(id.clone());
            let _ = joined.insert(topic.to_owned());
        }
        true
    }

    /// Remove one subscription, deleting the topic once empty.
    ///
    /// Returns `false` if the connection is not live. Unsubscribing from a
    /// topic the connection never joined is a no-op success.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(id) {
            return false;
        }
        if let Some(joined) = inner.memberships.get_mut(id) {
            let _ = joined.remove(topic);
        }
        remove_from_topic(&mut inner.topics, topic, id);
        true
    }

    /// Drop a connection from every topic and from the live table.
    ///
    /// Returns the removed handle, or `None` if it was already gone.
    pub fn unsubscribe_all(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut inner = self.inner.write();
        let removed = inner.connections.remove(id);
        if let Some(joined) = inner.memberships.remove(id) {
            for topic in &joined {
                remove_from_topic(&mut inner.topics, topic, id);
            }
            debug!(conn_id = %id, topics = joined.len(), "connection removed from registry");
        }
        removed
    }

    /// Copy out the current subscribers of a topic.
    pub fn snapshot(&self, topic: &str) -> Vec<Arc<ClientConnection>> {
        let inner = self.inner.read();
        inner.topics.get(topic).map_or_else(Vec::new, |ids| {
            ids.iter()
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect()
        })
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().connections.get(id).cloned()
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Topics a connection is subscribed to, sorted.
    pub fn topics_of(&self, id: &ConnectionId) -> Vec<String> {
        let inner = self.inner.read();
        let mut topics: Vec<String> = inner
            .memberships
            .get(id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.read().topics.get(topic).map_or(0, HashSet::len)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.read().topics.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }
}

fn remove_from_topic(
    topics: &mut HashMap<String, HashSet<ConnectionId>>,
    topic: &str,
    id: &ConnectionId,
) {
    if let Some(members) = topics.get_mut(topic) {
        let _ = members.remove(id);
        if members.is_empty() {
            let _ = topics.remove(topic);
        }
    }
}
