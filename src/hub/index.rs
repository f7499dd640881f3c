//! Topic -> subscriber set index
//!
//! Holds connection ids only; the registry owns the connections. A topic key
//! exists exactly as long as its subscriber set is non-empty.

use ahash::{AHashMap, AHashSet};

use super::ConnectionId;
use crate::protocol::MatchId;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: AHashMap<MatchId, AHashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `topic`, creating the set if needed.
    /// Returns false if it was already subscribed.
    pub fn insert(&mut self, topic: MatchId, conn: ConnectionId) -> bool {
        self.topics.entry(topic).or_default().insert(conn)
    }

    /// Remove `conn` from `topic`, pruning the topic when it empties.
    /// Returns false if it was not subscribed.
    pub fn remove(&mut self, topic: MatchId, conn: ConnectionId) -> bool {
        let Some(subscribers) = self.topics.get_mut(&topic) else {
            return false;
        };
        let removed = subscribers.remove(&conn);
        if subscribers.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    pub fn contains(&self, topic: MatchId, conn: ConnectionId) -> bool {
        self.topics
            .get(&topic)
            .is_some_and(|subscribers| subscribers.contains(&conn))
    }

    pub fn subscribers(&self, topic: MatchId) -> impl Iterator<Item = ConnectionId> + '_ {
        self.topics.get(&topic).into_iter().flatten().copied()
    }

    pub fn subscriber_count(&self, topic: MatchId) -> usize {
        self.topics.get(&topic).map_or(0, |s| s.len())
    }

    pub fn has_topic(&self, topic: MatchId) -> bool {
        self.topics.contains_key(&topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(n: u64) -> MatchId {
        MatchId::new(n).unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut index = SubscriptionIndex::new();
        assert!(index.insert(topic(1), ConnectionId(1)));
        assert!(!index.insert(topic(1), ConnectionId(1)));
        assert_eq!(index.subscriber_count(topic(1)), 1);
    }

    #[test]
    fn test_remove_prunes_empty_topic() {
        let mut index = SubscriptionIndex::new();
        index.insert(topic(7), ConnectionId(1));
        index.insert(topic(7), ConnectionId(2));

        assert!(index.remove(topic(7), ConnectionId(1)));
        assert!(index.has_topic(topic(7)));

        assert!(index.remove(topic(7), ConnectionId(2)));
        assert!(!index.has_topic(topic(7)));
        assert_eq!(index.topic_count(), 0);
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let mut index = SubscriptionIndex::new();
        assert!(!index.remove(topic(3), ConnectionId(1)));
        assert_eq!(index.topic_count(), 0);

        index.insert(topic(3), ConnectionId(2));
        assert!(!index.remove(topic(3), ConnectionId(1)));
        assert!(index.contains(topic(3), ConnectionId(2)));
    }

    #[test]
    fn test_subscribers_of_unknown_topic_is_empty() {
        let index = SubscriptionIndex::new();
        assert_eq!(index.subscribers(topic(99)).count(), 0);
    }
}
