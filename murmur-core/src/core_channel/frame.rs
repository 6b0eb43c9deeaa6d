//! Push-channel wire frames (JSON text, discriminated by `type`)

use crate::core_model::{ConversationId, Message, MessageContent, ServerId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed frame or response; logged and dropped, never fatal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),

    #[error("non-success status: {0}")]
    BadStatus(String),
}

/// Frames this client writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage { message: String },
    ReadReceipt { message_id: ServerId },
    VerifySecurity,
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn is_chat_message(&self) -> bool {
        matches!(self, OutboundFrame::ChatMessage { .. })
    }
}

/// A persisted chat message relayed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub encrypted_content: Option<String>,
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    pub message_id: ServerId,
    pub timestamp: String,
}

impl ChatFrame {
    /// Whether the frame belongs to the conversation between `local` and its peer
    pub fn belongs_to(&self, conversation: &ConversationId, local: &UserId) -> bool {
        let peer = conversation.peer();
        if self.sender_id == peer {
            return self.receiver_id.as_ref().map_or(true, |r| r == local);
        }
        if &self.sender_id == local {
            return self.receiver_id.as_ref().map_or(true, |r| *r == peer);
        }
        false
    }

    pub fn to_message(&self, local: &UserId) -> Result<Message, ProtocolError> {
        let sent_at = Timestamp::parse(&self.timestamp)
            .ok_or_else(|| ProtocolError::BadTimestamp(self.timestamp.clone()))?;
        let content = match (&self.encrypted_content, &self.message) {
            (Some(blob), _) => MessageContent::Ciphertext(blob.clone()),
            (None, Some(text)) => MessageContent::Plaintext(text.clone()),
            (None, None) => {
                return Err(ProtocolError::Malformed(format!(
                    "chat_message {} has no body",
                    self.message_id
                )))
            }
        };
        Ok(Message::persisted(
            self.message_id,
            self.sender_id.clone(),
            &self.sender_id == local,
            content,
            sent_at,
        ))
    }
}

/// Frames the server pushes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    ChatMessage(ChatFrame),
    ReadReceipt {
        message_id: ServerId,
        #[serde(default)]
        reader_id: Option<UserId>,
    },
    SecurityData {
        security_code: String,
        #[serde(default)]
        qr_data: Option<String>,
        #[serde(default)]
        verified: bool,
    },
    SecurityVerified {
        verified: bool,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "chat_message",
    "read_receipt",
    "security_data",
    "security_verified",
];

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing frame type".to_string()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownFrameType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_model::DeliveryState;

    #[test]
    fn test_outbound_shapes() {
        let chat = OutboundFrame::ChatMessage { message: "hi".into() }.encode().unwrap();
        assert_eq!(chat, r#"{"type":"chat_message","message":"hi"}"#);

        let receipt = OutboundFrame::ReadReceipt { message_id: ServerId(42) }.encode().unwrap();
        assert_eq!(receipt, r#"{"type":"read_receipt","message_id":42}"#);

        let verify = OutboundFrame::VerifySecurity.encode().unwrap();
        assert_eq!(verify, r#"{"type":"verify_security"}"#);
    }

    #[test]
    fn test_parse_chat_echo() {
        let frame = InboundFrame::parse(
            r#"{"type":"chat_message","message":"hi","sender_id":1,"message_id":42,
                "timestamp":"2024-01-01T10:00:00.000000+00:00"}"#,
        )
        .unwrap();
        let InboundFrame::ChatMessage(chat) = frame else {
            panic!("expected chat frame");
        };
        let msg = chat.to_message(&UserId::new("1")).unwrap();
        assert!(msg.is_self);
        assert_eq!(msg.server_id, Some(ServerId(42)));
        assert_eq!(msg.delivery_state, DeliveryState::Sent);
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn test_encrypted_body_wins() {
        let chat: ChatFrame = serde_json::from_str(
            r#"{"message":"x","encrypted_content":"blob","sender_id":"2","message_id":1,
                "timestamp":"2024-01-01 10:00:00"}"#,
        )
        .unwrap();
        let msg = chat.to_message(&UserId::new("1")).unwrap();
        assert_eq!(msg.content, MessageContent::Ciphertext("blob".into()));
        assert!(!msg.is_self);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(InboundFrame::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            InboundFrame::parse(r#"{"type":"typing"}"#),
            Err(ProtocolError::UnknownFrameType(t)) if t == "typing"
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"type":"read_receipt"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_timestamp() {
        let chat: ChatFrame = serde_json::from_str(
            r#"{"message":"x","sender_id":2,"message_id":1,"timestamp":"soon"}"#,
        )
        .unwrap();
        assert!(matches!(
            chat.to_message(&UserId::new("1")),
            Err(ProtocolError::BadTimestamp(_))
        ));
    }

    #[test]
    fn test_conversation_membership() {
        let me = UserId::new("1");
        let conv = ConversationId::new("2");
        let frame = |sender: &str, receiver: Option<&str>| ChatFrame {
            message: Some("x".into()),
            encrypted_content: None,
            sender_id: UserId::new(sender),
            receiver_id: receiver.map(UserId::new),
            message_id: ServerId(1),
            timestamp: "2024-01-01 10:00:00".into(),
        };

        assert!(frame("2", None).belongs_to(&conv, &me));
        assert!(frame("1", Some("2")).belongs_to(&conv, &me));
        assert!(!frame("3", None).belongs_to(&conv, &me));
        assert!(!frame("1", Some("3")).belongs_to(&conv, &me));
    }
}
