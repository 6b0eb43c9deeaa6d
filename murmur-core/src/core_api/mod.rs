//! Pull and single-shot send API of the message server
//!
//! Used by the initial seed fetch, the fallback poller and the fallback send
//! path once the push channel has failed over.

use crate::core_channel::ProtocolError;
use crate::core_model::{
    ConversationId, DeliveryState, Message, MessageContent, ReadState, ServerId, Timestamp, UserId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;

pub use http::{build_client, HttpMessageApi};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("server reported failure: {0}")]
    Status(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One entry of the fetch-all response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: ServerId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub encrypted_content: Option<String>,
    #[serde(default)]
    pub is_self: bool,
    pub sent_on: String,
    #[serde(default)]
    pub is_read: bool,
    /// Display name of the sender
    #[serde(default)]
    pub sender: Option<String>,
}

impl WireMessage {
    pub fn to_message(&self, local: &UserId, conversation: &ConversationId) -> Result<Message, ProtocolError> {
        let sent_at = Timestamp::parse(&self.sent_on)
            .ok_or_else(|| ProtocolError::BadTimestamp(self.sent_on.clone()))?;
        let content = match (&self.encrypted_content, &self.content) {
            (Some(blob), _) => MessageContent::Ciphertext(blob.clone()),
            (None, Some(text)) => MessageContent::Plaintext(text.clone()),
            (None, None) => {
                return Err(ProtocolError::Malformed(format!("message {} has no body", self.id)))
            }
        };
        let sender = if self.is_self { local.clone() } else { conversation.peer() };

        let mut message = Message::persisted(self.id, sender, self.is_self, content, sent_at);
        if self.is_read {
            message.delivery_state = DeliveryState::Read;
            message.read_state = ReadState::Read;
        }
        Ok(message)
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchResponse {
    pub status: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FetchResponse {
    pub fn into_result(self) -> ApiResult<Vec<WireMessage>> {
        if self.status == "success" {
            Ok(self.messages)
        } else {
            Err(ApiError::Status(self.message.unwrap_or(self.status)))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendResponse {
    pub status: String,
    #[serde(default)]
    pub message_id: Option<ServerId>,
    #[serde(default)]
    pub sent_on: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Server acknowledgement of a fallback send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentReceipt {
    pub server_id: ServerId,
    pub sent_at: Option<Timestamp>,
}

impl SendResponse {
    pub fn into_result(self) -> ApiResult<SentReceipt> {
        if self.status != "success" {
            return Err(ApiError::Status(self.message.unwrap_or(self.status)));
        }
        let server_id = self.message_id.ok_or_else(|| {
            ProtocolError::Malformed("send response without message_id".to_string())
        })?;
        Ok(SentReceipt {
            server_id,
            sent_at: self.sent_on.as_deref().and_then(Timestamp::parse),
        })
    }
}

#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Full message set of the conversation, oldest first
    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiResult<Vec<WireMessage>>;

    /// Single-shot send used once the push channel is gone
    async fn send_message(&self, conversation: &ConversationId, content: &str) -> ApiResult<SentReceipt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> UserId {
        UserId::new("1")
    }

    fn conv() -> ConversationId {
        ConversationId::new("2")
    }

    #[test]
    fn test_fetch_response_parsing() {
        let body = r#"{"status":"success","messages":[
            {"id":5,"content":"hey","sent_on":"2024-01-01 10:00:00","sender":"bob","is_self":false,"is_read":true},
            {"id":6,"content":"yo","sent_on":"2024-01-01 10:00:05","sender":"me","is_self":true,"is_read":false}
        ]}"#;
        let messages = serde_json::from_str::<FetchResponse>(body).unwrap().into_result().unwrap();
        assert_eq!(messages.len(), 2);

        let peer = messages[0].to_message(&me(), &conv()).unwrap();
        assert_eq!(peer.sender_id, UserId::new("2"));
        assert_eq!(peer.delivery_state, DeliveryState::Read);
        assert_eq!(peer.read_state, ReadState::Read);

        let own = messages[1].to_message(&me(), &conv()).unwrap();
        assert!(own.is_self);
        assert_eq!(own.sender_id, me());
        assert_eq!(own.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_empty_conversation() {
        let body = r#"{"status":"success","messages":[]}"#;
        let messages = serde_json::from_str::<FetchResponse>(body).unwrap().into_result().unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_error_status() {
        let body = r#"{"status":"error","message":"Invalid contact"}"#;
        let err = serde_json::from_str::<FetchResponse>(body).unwrap().into_result().unwrap_err();
        assert_eq!(err, ApiError::Status("Invalid contact".into()));
    }

    #[test]
    fn test_send_response() {
        let ok: SendResponse =
            serde_json::from_str(r#"{"status":"success","message_id":77,"sent_on":"2024-01-01 10:00:00"}"#).unwrap();
        let receipt = ok.into_result().unwrap();
        assert_eq!(receipt.server_id, ServerId(77));
        assert_eq!(receipt.sent_at, Some(Timestamp(1_704_103_200_000)));

        let missing: SendResponse = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(matches!(missing.into_result(), Err(ApiError::Protocol(_))));

        let failed: SendResponse =
            serde_json::from_str(r#"{"status":"error","message":"Receiver has no encryption key"}"#).unwrap();
        assert!(matches!(failed.into_result(), Err(ApiError::Status(_))));
    }

    #[test]
    fn test_encrypted_entry_and_bad_timestamp() {
        let entry = WireMessage {
            id: ServerId(1),
            content: None,
            encrypted_content: Some("blob".into()),
            is_self: false,
            sent_on: "2024-01-01 10:00:00".into(),
            is_read: false,
            sender: None,
        };
        let msg = entry.to_message(&me(), &conv()).unwrap();
        assert!(msg.content.is_ciphertext());
        assert_eq!(msg.read_state, ReadState::Unread);

        let bad = WireMessage { sent_on: "never".into(), ..entry };
        assert!(matches!(bad.to_message(&me(), &conv()), Err(ProtocolError::BadTimestamp(_))));
    }
}
