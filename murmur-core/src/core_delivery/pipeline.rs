//! Fetch → decode → decrypt, shared by the seed fetch and the poller

use crate::core_api::{ApiResult, MessageApi};
use crate::core_crypto::DecryptionGateway;
use crate::core_keys::KeyStore;
use crate::core_model::{ConversationId, Message, UserId};
use crate::metrics::{Timer, FETCH_DURATION};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct FetchPipeline {
    api: Arc<dyn MessageApi>,
    gateway: DecryptionGateway,
    keys: KeyStore,
    local_user: UserId,
}

impl FetchPipeline {
    pub fn new(api: Arc<dyn MessageApi>, gateway: DecryptionGateway, keys: KeyStore, local_user: UserId) -> Self {
        Self {
            api,
            gateway,
            keys,
            local_user,
        }
    }

    pub fn api(&self) -> &Arc<dyn MessageApi> {
        &self.api
    }

    /// Full message set of `conversation`, decrypted where needed.
    /// Entries that cannot be decoded are logged and skipped.
    pub async fn fetch(&self, conversation: &ConversationId) -> ApiResult<Vec<Message>> {
        let timer = Timer::new(FETCH_DURATION);
        let wire = self.api.fetch_messages(conversation).await;
        timer.stop();

        let messages: Vec<Message> = wire?
            .iter()
            .filter_map(|entry| match entry.to_message(&self.local_user, conversation) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(%conversation, id = %entry.id, error = %e, "Skipping malformed message");
                    None
                }
            })
            .collect();
        debug!(%conversation, count = messages.len(), "Fetched messages");

        if !messages.iter().any(|m| m.content.is_ciphertext()) {
            return Ok(messages);
        }
        let key = self.keys.private_key(&self.local_user).await;
        Ok(self.gateway.decrypt_batch(messages, key.as_ref()).await)
    }

    pub async fn decrypt(&self, message: Message) -> Message {
        if !message.content.is_ciphertext() {
            return message;
        }
        let key = self.keys.private_key(&self.local_user).await;
        self.gateway.decrypt_message(message, key.as_ref()).await
    }
}
