//! Messages flowing into the coordinator's event queue

use super::errors::DeliveryResult;
use crate::core_api::{ApiResult, SentReceipt};
use crate::core_keys::KeyStatus;
use crate::core_model::{ConversationId, LocalId, Message, ServerId};
use std::fmt;
use tokio::sync::oneshot;

/// Identifies one selection of a conversation. Results tagged with an older
/// epoch belong to a conversation the user has already left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationEpoch(pub u64);

impl fmt::Display for ConversationEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller intents, sent by `CoordinatorHandle`
#[derive(Debug)]
pub enum Command {
    SelectConversation {
        contact: ConversationId,
        reply: oneshot::Sender<DeliveryResult<()>>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<DeliveryResult<LocalId>>,
    },
    AcknowledgeRead {
        message_id: ServerId,
        reply: oneshot::Sender<DeliveryResult<bool>>,
    },
    CheckKey {
        reply: oneshot::Sender<DeliveryResult<KeyStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results of suspended work re-entering the queue
#[derive(Debug)]
pub enum Completion {
    /// Initial full fetch after selecting the conversation
    Seeded {
        epoch: ConversationEpoch,
        result: ApiResult<Vec<Message>>,
    },
    /// Fallback poller tick
    Polled {
        epoch: ConversationEpoch,
        result: ApiResult<Vec<Message>>,
    },
    /// Push frame whose ciphertext went through the gateway
    Decrypted {
        epoch: ConversationEpoch,
        message: Message,
    },
    /// Single-shot HTTP send finished
    FallbackSent {
        epoch: ConversationEpoch,
        local_id: Option<LocalId>,
        text: String,
        result: ApiResult<SentReceipt>,
    },
}

impl Completion {
    pub fn epoch(&self) -> ConversationEpoch {
        match self {
            Completion::Seeded { epoch, .. }
            | Completion::Polled { epoch, .. }
            | Completion::Decrypted { epoch, .. }
            | Completion::FallbackSent { epoch, .. } => *epoch,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Completion::Seeded { .. } => "seed",
            Completion::Polled { .. } => "poll",
            Completion::Decrypted { .. } => "decrypt",
            Completion::FallbackSent { .. } => "fallback_send",
        }
    }
}
