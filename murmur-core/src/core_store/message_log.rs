/*
    message_log.rs - Ordered, deduplicated message record for one conversation

    The single source of truth for what is rendered.

    Rules:
    - Dedup identity is the server id when present, else the local id.
    - Order is `sent_at` ascending; ties keep insertion order.
    - A pending self message is promoted in place (same slot) when the
      authoritative copy arrives with its server id.
    - Delivery state only moves forward.
*/

use crate::core_model::{DedupKey, DeliveryState, Message, ReadState, ServerId};
use tracing::{debug, warn};

/// Result of merging one observation into the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message, placed in order
    Inserted,
    /// Existing message reconciled (promotion, state advance, content upgrade)
    Updated,
    /// Already known and nothing new was learned
    DuplicateIgnored,
    /// Carried neither a server id nor a local id
    Rejected,
}

impl MergeOutcome {
    /// Whether the rendered log changed
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in canonical order
    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, key: &DedupKey) -> Option<&Message> {
        self.messages.iter().find(|m| m.matches_key(key))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn merge(&mut self, incoming: Message) -> MergeOutcome {
        let Some(key) = incoming.dedup_key() else {
            warn!("Dropping message without server or local id");
            return MergeOutcome::Rejected;
        };

        if let Some(index) = self.locate(&incoming) {
            let existing = &mut self.messages[index];
            return if existing.reconcile(&incoming) {
                debug!(key = %key, state = ?existing.delivery_state, "Reconciled message");
                MergeOutcome::Updated
            } else {
                MergeOutcome::DuplicateIgnored
            };
        }

        let position = self
            .messages
            .partition_point(|m| m.sent_at <= incoming.sent_at);
        debug!(key = %key, position, "Inserted message");
        self.messages.insert(position, incoming);
        MergeOutcome::Inserted
    }

    /// Mark a message READ locally. No-op for unknown or already-read messages.
    pub fn mark_read(&mut self, key: &DedupKey) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.matches_key(key)) else {
            return false;
        };
        if message.delivery_state == DeliveryState::Read && message.read_state == ReadState::Read {
            return false;
        }
        message.delivery_state = DeliveryState::Read;
        message.read_state = ReadState::Read;
        true
    }

    /// Apply a receiver's read receipt: SENT becomes READ, anything else is left alone.
    pub fn apply_read_receipt(&mut self, id: ServerId) -> bool {
        match self.messages.iter_mut().find(|m| m.server_id == Some(id)) {
            Some(message) if message.delivery_state == DeliveryState::Sent => {
                message.delivery_state = DeliveryState::Read;
                true
            }
            _ => false,
        }
    }

    /// Number of self messages still waiting for a server id
    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.delivery_state == DeliveryState::Pending)
            .count()
    }

    fn locate(&self, incoming: &Message) -> Option<usize> {
        if let Some(id) = incoming.server_id {
            if let Some(index) = self.messages.iter().position(|m| m.server_id == Some(id)) {
                return Some(index);
            }
        }

        if let Some(local) = &incoming.local_id {
            if let Some(index) = self.messages.iter().position(|m| {
                m.local_id.as_ref() == Some(local)
                    && (m.server_id.is_none() || m.server_id == incoming.server_id)
            }) {
                return Some(index);
            }
        }

        // Authoritative echo of an optimistic render: oldest pending self
        // message with the same body takes the server id.
        if incoming.server_id.is_some() && incoming.is_self {
            return self.messages.iter().position(|m| {
                m.is_self
                    && m.server_id.is_none()
                    && m.delivery_state == DeliveryState::Pending
                    && m.content.is_plaintext()
                    && m.text() == incoming.text()
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_model::{LocalId, MessageContent, Timestamp, UserId};
    use proptest::prelude::*;

    fn me() -> UserId {
        UserId::new("1")
    }

    fn peer() -> UserId {
        UserId::new("2")
    }

    fn from_peer(id: u64, text: &str, at: u64) -> Message {
        Message::persisted(
            ServerId(id),
            peer(),
            false,
            MessageContent::Plaintext(text.to_string()),
            Timestamp(at),
        )
    }

    fn echo(id: u64, text: &str, at: u64) -> Message {
        Message::persisted(
            ServerId(id),
            me(),
            true,
            MessageContent::Plaintext(text.to_string()),
            Timestamp(at),
        )
    }

    #[test]
    fn test_insert_keeps_sent_at_order() {
        let mut log = MessageLog::new();
        assert_eq!(log.merge(from_peer(3, "c", 300)), MergeOutcome::Inserted);
        assert_eq!(log.merge(from_peer(1, "a", 100)), MergeOutcome::Inserted);
        assert_eq!(log.merge(from_peer(2, "b", 200)), MergeOutcome::Inserted);

        let texts: Vec<_> = log.all().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let mut log = MessageLog::new();
        log.merge(from_peer(9, "first", 100));
        log.merge(from_peer(4, "second", 100));
        log.merge(from_peer(7, "third", 100));

        let texts: Vec<_> = log.all().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_server_id_is_ignored() {
        let mut log = MessageLog::new();
        log.merge(from_peer(1, "a", 100));
        assert_eq!(log.merge(from_peer(1, "a", 100)), MergeOutcome::DuplicateIgnored);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_pending_echo_promoted_in_place() {
        let mut log = MessageLog::new();
        log.merge(from_peer(1, "before", 100));
        log.merge(Message::outgoing(LocalId::new("c1"), me(), "hi".into(), Timestamp(200)));
        log.merge(from_peer(2, "after", 300));

        // Server clock puts the echo after "after"; the record must not move.
        assert_eq!(log.merge(echo(42, "hi", 400)), MergeOutcome::Updated);
        assert_eq!(log.len(), 3);

        let promoted = &log.all()[1];
        assert_eq!(promoted.server_id, Some(ServerId(42)));
        assert_eq!(promoted.local_id, Some(LocalId::new("c1")));
        assert_eq!(promoted.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_promotion_takes_oldest_pending_with_same_body() {
        let mut log = MessageLog::new();
        log.merge(Message::outgoing(LocalId::new("c1"), me(), "ok".into(), Timestamp(100)));
        log.merge(Message::outgoing(LocalId::new("c2"), me(), "ok".into(), Timestamp(200)));

        log.merge(echo(10, "ok", 150));
        assert_eq!(log.all()[0].server_id, Some(ServerId(10)));
        assert_eq!(log.all()[1].server_id, None);

        log.merge(echo(11, "ok", 250));
        assert_eq!(log.all()[1].server_id, Some(ServerId(11)));
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn test_peer_message_never_promotes_local_record() {
        let mut log = MessageLog::new();
        log.merge(Message::outgoing(LocalId::new("c1"), me(), "hi".into(), Timestamp(100)));
        assert_eq!(log.merge(from_peer(5, "hi", 110)), MergeOutcome::Inserted);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_fallback_receipt_promotes_by_local_id() {
        let mut log = MessageLog::new();
        log.merge(Message::outgoing(LocalId::new("c1"), me(), "hi".into(), Timestamp(100)));

        let receipt = echo(77, "hi", 105).with_local_id(LocalId::new("c1"));
        assert_eq!(log.merge(receipt), MergeOutcome::Updated);
        assert_eq!(log.all()[0].server_id, Some(ServerId(77)));
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut log = MessageLog::new();
        log.merge(from_peer(1, "a", 100));

        let key = DedupKey::Server(ServerId(1));
        assert!(log.mark_read(&key));
        assert!(!log.mark_read(&key));
        assert!(!log.mark_read(&DedupKey::Server(ServerId(99))));
        assert_eq!(log.get(&key).unwrap().delivery_state, DeliveryState::Read);
    }

    #[test]
    fn test_read_receipt_only_advances_sent() {
        let mut log = MessageLog::new();
        log.merge(Message::outgoing(LocalId::new("c1"), me(), "hi".into(), Timestamp(100)));
        log.merge(echo(42, "hi", 100));

        assert!(log.apply_read_receipt(ServerId(42)));
        assert!(!log.apply_read_receipt(ServerId(42)));
        assert_eq!(log.all()[0].delivery_state, DeliveryState::Read);
    }

    #[test]
    fn test_message_without_ids_is_rejected() {
        let mut log = MessageLog::new();
        let mut orphan = from_peer(1, "a", 100);
        orphan.server_id = None;
        assert_eq!(log.merge(orphan), MergeOutcome::Rejected);
        assert!(log.is_empty());
    }

    fn arb_state() -> impl Strategy<Value = DeliveryState> {
        prop_oneof![
            Just(DeliveryState::Pending),
            Just(DeliveryState::Sent),
            Just(DeliveryState::Read),
        ]
    }

    proptest! {
        #[test]
        fn prop_dedup_keeps_one_entry_at_highest_state(
            states in prop::collection::vec(arb_state(), 1..20)
        ) {
            let mut log = MessageLog::new();
            for state in &states {
                log.merge(from_peer(7, "x", 100).with_delivery_state(*state));
            }
            prop_assert_eq!(log.len(), 1);
            let highest = states.iter().copied().max().unwrap();
            prop_assert_eq!(log.all()[0].delivery_state, highest);
        }

        #[test]
        fn prop_log_is_sorted_by_sent_at(
            entries in prop::collection::vec((0u64..50, 0u64..1_000), 0..60)
        ) {
            let mut log = MessageLog::new();
            for (id, at) in entries {
                log.merge(from_peer(id, "x", at));
            }
            for pair in log.all().windows(2) {
                prop_assert!(pair[0].sent_at <= pair[1].sent_at);
            }
        }

        #[test]
        fn prop_read_never_regresses(
            states in prop::collection::vec(arb_state(), 0..20)
        ) {
            let mut log = MessageLog::new();
            log.merge(from_peer(3, "x", 100).with_delivery_state(DeliveryState::Read));
            for state in states {
                log.merge(from_peer(3, "x", 100).with_delivery_state(state));
                prop_assert_eq!(log.all()[0].delivery_state, DeliveryState::Read);
            }
        }
    }
}
