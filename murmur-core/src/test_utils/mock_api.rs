//! In-memory message API
//!
//! Behaves like the chat server's HTTP surface: a fetch returns the whole
//! conversation, a send persists the message and assigns the next id.

use super::async_helpers::gate_open;
use crate::core_api::{ApiError, ApiResult, MessageApi, SentReceipt, WireMessage};
use crate::core_model::{ConversationId, ServerId, Timestamp};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Default)]
struct ApiState {
    conversations: HashMap<ConversationId, Vec<WireMessage>>,
    sent: Vec<(ConversationId, String)>,
    fail_fetches: bool,
    fail_sends: bool,
}

pub struct MockMessageApi {
    state: Mutex<ApiState>,
    fetches: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl MockMessageApi {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(ApiState::default()),
            fetches: AtomicUsize::new(0),
            gate,
        })
    }

    /// Store a message as if it had been persisted earlier
    pub fn insert(&self, conversation: &ConversationId, message: WireMessage) {
        self.with_state(|state| {
            let messages = state.conversations.entry(conversation.clone()).or_default();
            messages.push(message);
            messages.sort_by_key(|m| m.id);
        });
    }

    /// Flag a stored message as read
    pub fn mark_read(&self, conversation: &ConversationId, id: ServerId) {
        self.with_state(|state| {
            if let Some(messages) = state.conversations.get_mut(conversation) {
                for message in messages.iter_mut().filter(|m| m.id == id) {
                    message.is_read = true;
                }
            }
        });
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.with_state(|state| state.fail_fetches = fail);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.with_state(|state| state.fail_sends = fail);
    }

    /// Keep following fetches pending until released
    pub fn hold_fetches(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.gate.send_replace(true);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Texts sent through `send_message`, in order
    pub fn sent(&self) -> Vec<(ConversationId, String)> {
        self.with_state(|state| state.sent.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ApiState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl MessageApi for MockMessageApi {
    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiResult<Vec<WireMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        gate_open(&self.gate).await;

        self.with_state(|state| {
            if state.fail_fetches {
                return Err(ApiError::Http("connection reset".to_string()));
            }
            Ok(state.conversations.get(conversation).cloned().unwrap_or_default())
        })
    }

    async fn send_message(&self, conversation: &ConversationId, content: &str) -> ApiResult<SentReceipt> {
        self.with_state(|state| {
            if state.fail_sends {
                return Err(ApiError::Status("Failed to send message".to_string()));
            }
            let next_id = state
                .conversations
                .values()
                .flatten()
                .map(|m| m.id.0)
                .max()
                .unwrap_or(0)
                + 1;
            let sent_on = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let message = WireMessage {
                id: ServerId(next_id),
                content: Some(content.to_string()),
                encrypted_content: None,
                is_self: true,
                sent_on: sent_on.clone(),
                is_read: false,
                sender: None,
            };
            state.conversations.entry(conversation.clone()).or_default().push(message);
            state.sent.push((conversation.clone(), content.to_string()));
            Ok(SentReceipt {
                server_id: ServerId(next_id),
                sent_at: Timestamp::parse(&sent_on),
            })
        })
    }
}
