//! Broadcast Hub
//!
//! Owns every live connection and the topic index, and fans messages out to
//! them. One hub instance is created per server and shared as `Arc<Hub>`
//! with the transport tasks and with external publishers.
//!
//! Locking: a single `RwLock` guards both the connection registry and the
//! subscription index so that a connection's own topic set and its
//! membership in the index always change together. The lock is held for
//! the mutation or snapshot only; delivery happens after it is released and
//! is a non-blocking enqueue on each connection's bounded outbound queue.

mod connection;
mod index;
mod liveness;

pub use connection::{ConnectionHandle, ConnectionId, Outbound, SendError};
pub use index::SubscriptionIndex;
pub use liveness::{spawn_liveness_supervisor, SweepReport};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::metrics::Metrics;
use crate::model::{Commentary, Match};
use crate::protocol::{parse_client_message, ClientMessage, CloseReason, MatchId, ServerMessage};


/// Snapshot taken under the lock before delivery
type Snapshot = SmallVec<[Arc<ConnectionHandle>; 16]>;

/// Event delivered by the transport layer for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A text or binary data frame
    Message(Vec<u8>),
    /// Answer to a liveness probe
    Pong,
    /// The peer closed the connection or the transport failed
    Closed,
}

/// Result of registering a connection
pub struct Registration {
    pub handle: Arc<ConnectionHandle>,
    /// Queue the transport task drains to the socket
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Registry record for one connection
struct ConnectionEntry {
    handle: Arc<ConnectionHandle>,
    /// Topics this connection subscribes to (mirrored in the index)
    topics: AHashSet<MatchId>,
}

#[derive(Default)]
struct HubState {
    connections: AHashMap<ConnectionId, ConnectionEntry>,
    index: SubscriptionIndex,
}

impl HubState {
    /// Returns the handle and whether the subscription is new,
    /// or `None` if the connection is not registered.
    fn subscribe(
        &mut self,
        id: ConnectionId,
        topic: MatchId,
    ) -> Option<(Arc<ConnectionHandle>, bool)> {
        let entry = self.connections.get_mut(&id)?;
        let added = entry.topics.insert(topic);
        self.index.insert(topic, id);
        Some((entry.handle.clone(), added))
    }

    fn unsubscribe(
        &mut self,
        id: ConnectionId,
        topic: MatchId,
    ) -> Option<(Arc<ConnectionHandle>, bool)> {
        let entry = self.connections.get_mut(&id)?;
        let removed = entry.topics.remove(&topic);
        self.index.remove(topic, id);
        Some((entry.handle.clone(), removed))
    }

    /// Drop `id` from every topic it joined. Returns the number removed.
    fn cleanup(&mut self, id: ConnectionId) -> usize {
        let Some(entry) = self.connections.get_mut(&id) else {
            return 0;
        };
        let topics: SmallVec<[MatchId; 8]> = entry.topics.iter().copied().collect();
        for topic in &topics {
            entry.topics.remove(topic);
            self.index.remove(*topic, id);
        }
        topics.len()
    }

    fn snapshot_all(&self) -> Snapshot {
        self.connections
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    fn snapshot_topic(&self, topic: MatchId) -> Snapshot {
        self.index
            .subscribers(topic)
            .filter_map(|id| self.connections.get(&id))
            .map(|entry| entry.handle.clone())
            .collect()
    }
}

/// Connection registry, subscription index and broadcast dispatcher
pub struct Hub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
    outbound_capacity: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Hub {
    /// Create a hub whose connections buffer at most `outbound_capacity`
    /// undelivered items before being treated as failed.
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            next_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a newly admitted connection and push it a `welcome`.
    pub fn register(&self, addr: SocketAddr) -> Registration {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, outbound) = mpsc::channel(self.outbound_capacity);
        let handle = Arc::new(ConnectionHandle::new(id, addr, tx));

        // Queued before the connection becomes visible to broadcasts
        self.reply(&handle, &ServerMessage::Welcome);

        self.state.write().connections.insert(
            id,
            ConnectionEntry {
                handle: handle.clone(),
                topics: AHashSet::new(),
            },
        );

        if let Some(ref m) = self.metrics {
            m.connection_opened();
        }
        debug!("Registered {} from {}", id, addr);

        Registration { handle, outbound }
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Idempotent: returns false if the connection was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let (entry, dropped, topics) = {
            let mut state = self.state.write();
            let dropped = state.cleanup(id);
            let entry = state.connections.remove(&id);
            (entry, dropped, state.index.topic_count())
        };

        let Some(entry) = entry else {
            return false;
        };
        entry.handle.close();

        if let Some(ref m) = self.metrics {
            m.connection_closed();
            m.subscriptions_removed(dropped);
            m.set_topics(topics);
        }
        debug!(
            "Unregistered {} ({} subscriptions released)",
            id, dropped
        );
        true
    }

    /// Subscribe a connection to a topic and acknowledge it.
    ///
    /// Returns true if the subscription is new; subscribing twice is
    /// acknowledged again but changes nothing.
    pub fn subscribe(&self, id: ConnectionId, topic: MatchId) -> bool {
        let (result, topics) = {
            let mut state = self.state.write();
            let result = state.subscribe(id, topic);
            (result, state.index.topic_count())
        };
        let Some((handle, added)) = result else {
            debug!("Subscribe from unregistered {} ignored", id);
            return false;
        };

        if added {
            if let Some(ref m) = self.metrics {
                m.subscriptions_added(1);
                m.set_topics(topics);
            }
            trace!("{} subscribed to match {}", id, topic);
        }
        self.reply(&handle, &ServerMessage::Subscribed { match_id: topic });
        added
    }

    /// Unsubscribe a connection from a topic and acknowledge it.
    ///
    /// Unsubscribing from a topic the connection never joined is a no-op
    /// that is still acknowledged. Returns true if a subscription was removed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: MatchId) -> bool {
        let (result, topics) = {
            let mut state = self.state.write();
            let result = state.unsubscribe(id, topic);
            (result, state.index.topic_count())
        };
        let Some((handle, removed)) = result else {
            debug!("Unsubscribe from unregistered {} ignored", id);
            return false;
        };

        if removed {
            if let Some(ref m) = self.metrics {
                m.subscriptions_removed(1);
                m.set_topics(topics);
            }
            trace!("{} unsubscribed from match {}", id, topic);
        }
        self.reply(&handle, &ServerMessage::Unsubscribed { match_id: topic });
        removed
    }

    /// Single entry point for transport events on connection `id`
    pub fn handle_event(&self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(payload) => self.handle_message(id, &payload),
            ConnectionEvent::Pong => {
                if let Some(handle) = self.handle(id) {
                    handle.mark_alive();
                }
            }
            ConnectionEvent::Closed => {
                self.unregister(id);
            }
        }
    }

    fn handle_message(&self, id: ConnectionId, payload: &[u8]) {
        match parse_client_message(payload) {
            Ok(ClientMessage::Subscribe(topic)) => {
                self.subscribe(id, topic);
            }
            Ok(ClientMessage::Unsubscribe(topic)) => {
                self.unsubscribe(id, topic);
            }
            Err(malformed) => {
                debug!("Malformed message from {}: {}", id, malformed);
                if let Some(ref m) = self.metrics {
                    m.malformed_message();
                }
                if let Some(handle) = self.handle(id) {
                    self.reply(
                        &handle,
                        &ServerMessage::Error {
                            error: malformed.to_string(),
                        },
                    );
                }
            }
        }
    }

    /// Deliver to every registered connection. Returns the number reached.
    pub fn broadcast_all(&self, message: &ServerMessage<'_>) -> usize {
        let snapshot = self.state.read().snapshot_all();
        self.fan_out(&snapshot, message)
    }

    /// Deliver to the current subscribers of `topic`. Returns the number reached.
    pub fn broadcast_topic(&self, topic: MatchId, message: &ServerMessage<'_>) -> usize {
        let snapshot = self.state.read().snapshot_topic(topic);
        if snapshot.is_empty() {
            trace!("No subscribers for match {}", topic);
            return 0;
        }
        self.fan_out(&snapshot, message)
    }

    /// Announce a newly created match to every connection
    pub fn broadcast_match_created(&self, created: &Match) -> usize {
        self.broadcast_all(&ServerMessage::MatchCreated { data: created })
    }

    /// Push a new commentary line to the subscribers of its match
    pub fn broadcast_commentary(&self, commentary: &Commentary) -> usize {
        self.broadcast_topic(
            commentary.match_id,
            &ServerMessage::Commentary { data: commentary },
        )
    }

    /// Ask every connection to close, e.g. on server shutdown
    pub fn close_all(&self, reason: CloseReason) {
        let snapshot = self.state.read().snapshot_all();
        for handle in &snapshot {
            if handle.send(Outbound::Close(reason)).is_err() {
                handle.terminate();
                self.unregister(handle.id());
            }
        }
    }

    fn fan_out(&self, snapshot: &[Arc<ConnectionHandle>], message: &ServerMessage<'_>) -> usize {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} message: {}", message.kind(), e);
                return 0;
            }
        };

        snapshot
            .iter()
            .filter(|handle| self.deliver(handle, &text, message.kind()))
            .count()
    }

    fn reply(&self, handle: &ConnectionHandle, message: &ServerMessage<'_>) {
        match message.encode() {
            Ok(text) => {
                self.deliver(handle, &text, message.kind());
            }
            Err(e) => error!("Failed to encode {} message: {}", message.kind(), e),
        }
    }

    /// Enqueue one frame. A closed connection is skipped; a connection whose
    /// queue is full is torn down. Never fails the caller.
    fn deliver(&self, handle: &ConnectionHandle, text: &Arc<str>, kind: &'static str) -> bool {
        match handle.send(Outbound::Text(text.clone())) {
            Ok(()) => {
                if let Some(ref m) = self.metrics {
                    m.message_sent(kind);
                }
                true
            }
            Err(SendError::Closed) => {
                trace!("Skipping closed {}", handle.id());
                false
            }
            Err(SendError::Full) => {
                warn!(
                    "Outbound queue full for {} ({}), terminating slow consumer",
                    handle.id(),
                    handle.addr()
                );
                if let Some(ref m) = self.metrics {
                    m.delivery_dropped("queue_full");
                }
                handle.terminate();
                self.unregister(handle.id());
                false
            }
        }
    }

    /// Look up a registered connection
    pub fn handle(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.state
            .read()
            .connections
            .get(&id)
            .map(|entry| entry.handle.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.state.read().index.topic_count()
    }

    pub fn subscriber_count(&self, topic: MatchId) -> usize {
        self.state.read().index.subscriber_count(topic)
    }

    pub fn has_topic(&self, topic: MatchId) -> bool {
        self.state.read().index.has_topic(topic)
    }

    /// Topics a connection subscribes to, sorted
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<MatchId> {
        let state = self.state.read();
        let mut topics: Vec<MatchId> = state
            .connections
            .get(&id)
            .map(|entry| entry.topics.iter().copied().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Whether the connection appears on both sides of the mirror
    pub fn is_subscribed(&self, id: ConnectionId, topic: MatchId) -> bool {
        let state = self.state.read();
        let own = state
            .connections
            .get(&id)
            .is_some_and(|entry| entry.topics.contains(&topic));
        own && state.index.contains(topic, id)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(1024)
    }
}
