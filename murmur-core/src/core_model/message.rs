//! Message record as rendered by the presentation layer

use super::types::{LocalId, ServerId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery progress of a message. Ordered: `Pending < Sent < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    /// Sent locally, no server acknowledgement yet
    Pending,
    /// Persisted by the server (server id assigned)
    Sent,
    /// Acknowledged by the receiver
    Read,
}

impl DeliveryState {
    /// Combine two observations; never moves backwards.
    pub fn advance(self, observed: DeliveryState) -> DeliveryState {
        self.max(observed)
    }
}

/// Whether the local user has acknowledged a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Unread,
    Read,
}

/// Message body in one of its three renderable forms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    /// Readable text
    Plaintext(String),
    /// Opaque blob still waiting for the decryption gateway
    Ciphertext(String),
    /// Decryption failed; the text is the visible placeholder carrying the reason
    Placeholder(String),
}

impl MessageContent {
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Plaintext(text) => text,
            MessageContent::Ciphertext(_) => "🔒 Encrypted message",
            MessageContent::Placeholder(text) => text,
        }
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self, MessageContent::Plaintext(_))
    }

    pub fn is_ciphertext(&self) -> bool {
        matches!(self, MessageContent::Ciphertext(_))
    }

    /// Rank used when reconciling two copies of the same message: a decrypted
    /// body beats a placeholder, which beats an undecrypted blob.
    fn rank(&self) -> u8 {
        match self {
            MessageContent::Ciphertext(_) => 0,
            MessageContent::Placeholder(_) => 1,
            MessageContent::Plaintext(_) => 2,
        }
    }
}

/// Identity used for deduplication: server id when present, else local id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Server(ServerId),
    Local(LocalId),
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::Server(id) => write!(f, "server:{}", id),
            DedupKey::Local(id) => write!(f, "local:{}", id),
        }
    }
}

impl From<ServerId> for DedupKey {
    fn from(id: ServerId) -> Self {
        DedupKey::Server(id)
    }
}

impl From<LocalId> for DedupKey {
    fn from(id: LocalId) -> Self {
        DedupKey::Local(id)
    }
}

/// A chat message in the active conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub local_id: Option<LocalId>,
    pub server_id: Option<ServerId>,
    pub sender_id: UserId,
    /// Sent by the local identity
    pub is_self: bool,
    pub content: MessageContent,
    pub sent_at: Timestamp,
    pub delivery_state: DeliveryState,
    pub read_state: ReadState,
}

impl Message {
    /// Optimistic record for a message the local user just wrote
    pub fn outgoing(local_id: LocalId, sender_id: UserId, text: String, sent_at: Timestamp) -> Self {
        Message {
            local_id: Some(local_id),
            server_id: None,
            sender_id,
            is_self: true,
            content: MessageContent::Plaintext(text),
            sent_at,
            delivery_state: DeliveryState::Pending,
            read_state: ReadState::Read,
        }
    }

    /// Record for a message the server has already persisted
    pub fn persisted(
        server_id: ServerId,
        sender_id: UserId,
        is_self: bool,
        content: MessageContent,
        sent_at: Timestamp,
    ) -> Self {
        Message {
            local_id: None,
            server_id: Some(server_id),
            sender_id,
            is_self,
            content,
            sent_at,
            delivery_state: DeliveryState::Sent,
            read_state: if is_self { ReadState::Read } else { ReadState::Unread },
        }
    }

    pub fn with_delivery_state(mut self, state: DeliveryState) -> Self {
        self.delivery_state = state;
        self
    }

    pub fn with_local_id(mut self, local_id: LocalId) -> Self {
        self.local_id = Some(local_id);
        self
    }

    /// `None` only for malformed records that carry neither id
    pub fn dedup_key(&self) -> Option<DedupKey> {
        match (&self.server_id, &self.local_id) {
            (Some(id), _) => Some(DedupKey::Server(*id)),
            (None, Some(id)) => Some(DedupKey::Local(id.clone())),
            (None, None) => None,
        }
    }

    pub fn matches_key(&self, key: &DedupKey) -> bool {
        match key {
            DedupKey::Server(id) => self.server_id.as_ref() == Some(id),
            DedupKey::Local(id) => self.local_id.as_ref() == Some(id),
        }
    }

    pub fn text(&self) -> &str {
        self.content.text()
    }

    /// Fold a later observation of the same message into this record.
    ///
    /// Delivery and read state only move forward, a server id once known is
    /// kept, and content only upgrades (ciphertext → placeholder → plaintext).
    /// Position-defining fields (`sent_at`, sender) are left alone so the
    /// record keeps its slot. Returns whether anything changed.
    pub fn reconcile(&mut self, incoming: &Message) -> bool {
        let before = self.clone();

        if self.server_id.is_none() {
            self.server_id = incoming.server_id;
        }
        if self.local_id.is_none() {
            self.local_id = incoming.local_id.clone();
        }
        self.delivery_state = self.delivery_state.advance(incoming.delivery_state);
        self.read_state = self.read_state.max(incoming.read_state);

        let upgrade = incoming.content.rank() > self.content.rank()
            || (incoming.content.rank() == self.content.rank()
                && matches!(incoming.content, MessageContent::Placeholder(_)));
        if upgrade {
            self.content = incoming.content.clone();
        }

        *self != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::new("1")
    }

    #[test]
    fn test_delivery_state_never_regresses() {
        assert_eq!(DeliveryState::Read.advance(DeliveryState::Sent), DeliveryState::Read);
        assert_eq!(DeliveryState::Pending.advance(DeliveryState::Sent), DeliveryState::Sent);
        assert_eq!(DeliveryState::Sent.advance(DeliveryState::Pending), DeliveryState::Sent);
    }

    #[test]
    fn test_dedup_key_prefers_server_id() {
        let msg = Message::outgoing(LocalId::new("c1"), alice(), "hi".into(), Timestamp(1));
        assert_eq!(msg.dedup_key(), Some(DedupKey::Local(LocalId::new("c1"))));

        let mut promoted = msg.clone();
        promoted.server_id = Some(ServerId(42));
        assert_eq!(promoted.dedup_key(), Some(DedupKey::Server(ServerId(42))));
    }

    #[test]
    fn test_reconcile_promotes_pending_echo() {
        let mut local = Message::outgoing(LocalId::new("c1"), alice(), "hi".into(), Timestamp(10));
        let echo = Message::persisted(
            ServerId(42),
            alice(),
            true,
            MessageContent::Plaintext("hi".into()),
            Timestamp(12),
        );

        assert!(local.reconcile(&echo));
        assert_eq!(local.server_id, Some(ServerId(42)));
        assert_eq!(local.local_id, Some(LocalId::new("c1")));
        assert_eq!(local.delivery_state, DeliveryState::Sent);
        assert_eq!(local.sent_at, Timestamp(10));

        // Same observation again changes nothing
        assert!(!local.reconcile(&echo));
    }

    #[test]
    fn test_reconcile_never_downgrades_content() {
        let mut msg = Message::persisted(
            ServerId(1),
            UserId::new("2"),
            false,
            MessageContent::Plaintext("hello".into()),
            Timestamp(1),
        );
        let blob = Message {
            content: MessageContent::Ciphertext("AAAA".into()),
            ..msg.clone()
        };
        assert!(!msg.reconcile(&blob));
        assert_eq!(msg.text(), "hello");

        let mut failed = Message {
            content: MessageContent::Placeholder("🔒 Decryption failed: x".into()),
            ..msg.clone()
        };
        assert!(failed.reconcile(&msg));
        assert_eq!(failed.text(), "hello");
    }
}
