//! Snapshot of the active conversation for the presentation layer

use crate::core_channel::SessionState;
use crate::core_keys::KeyStatus;
use crate::core_model::{ConversationId, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// No conversation selected
    Idle,
    /// Waiting for the first full fetch
    Loading,
    /// Seeded and the conversation has no messages
    Empty,
    Messages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation: Option<ConversationId>,
    /// Canonical order
    pub messages: Vec<Message>,
    pub connection: SessionState,
    pub fallback_active: bool,
    pub state: ViewState,
    pub key_status: KeyStatus,
}

impl ConversationView {
    pub fn idle(key_status: KeyStatus) -> Self {
        Self {
            conversation: None,
            messages: Vec::new(),
            connection: SessionState::Disconnected,
            fallback_active: false,
            state: ViewState::Idle,
            key_status,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state == ViewState::Empty
    }
}
