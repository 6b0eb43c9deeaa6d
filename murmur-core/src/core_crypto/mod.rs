/*
    core_crypto - Decryption gateway in front of an external capability

    The actual cipher lives outside this crate. The gateway hands an opaque
    blob plus the local private key to a `DecryptionCapability` and maps the
    outcome to plaintext or a typed failure.

    Failures never escape as errors past `decrypt_message`/`decrypt_batch`:
    the message keeps its slot and carries a visible placeholder instead.
*/

use crate::core_keys::PrivateKey;
use crate::core_model::{Message, MessageContent};
use crate::metrics::{self, DECRYPT_FAILED};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub mod http;

pub use http::HttpDecryptionCapability;

/// Why a ciphertext could not be turned into plaintext
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptFailure {
    #[error("no private key available")]
    NoKey,

    #[error("{0}")]
    RemoteRejected(String),

    #[error("decryption service unreachable: {0}")]
    TransportError(String),
}

impl DecryptFailure {
    pub fn code(&self) -> &'static str {
        match self {
            DecryptFailure::NoKey => "NO_KEY",
            DecryptFailure::RemoteRejected(_) => "REMOTE_REJECTED",
            DecryptFailure::TransportError(_) => "TRANSPORT_ERROR",
        }
    }
}

/// Answer of the external capability for one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityResponse {
    Success { plaintext: String },
    Failure { reason: String },
}

/// External decryption operation.
///
/// Implementations return `Err(DecryptFailure::TransportError)` when the
/// capability could not be reached; a reachable capability that refuses the
/// blob answers `Ok(CapabilityResponse::Failure)`.
#[async_trait]
pub trait DecryptionCapability: Send + Sync {
    async fn decrypt(
        &self,
        ciphertext: &str,
        key: &PrivateKey,
    ) -> Result<CapabilityResponse, DecryptFailure>;
}

#[derive(Clone)]
pub struct DecryptionGateway {
    capability: Arc<dyn DecryptionCapability>,
}

impl DecryptionGateway {
    pub fn new(capability: Arc<dyn DecryptionCapability>) -> Self {
        Self { capability }
    }

    pub async fn decrypt(
        &self,
        ciphertext: &str,
        key: Option<&PrivateKey>,
    ) -> Result<String, DecryptFailure> {
        let key = key.filter(|k| !k.is_empty()).ok_or(DecryptFailure::NoKey)?;
        match self.capability.decrypt(ciphertext, key).await? {
            CapabilityResponse::Success { plaintext } => Ok(plaintext),
            CapabilityResponse::Failure { reason } => Err(DecryptFailure::RemoteRejected(reason)),
        }
    }

    /// Visible text substituted for content that failed to decrypt
    pub fn placeholder(failure: &DecryptFailure) -> String {
        format!("🔒 Decryption failed: {}", failure)
    }

    /// Resolve a message's ciphertext in place. Plaintext passes through untouched.
    pub async fn decrypt_message(&self, mut message: Message, key: Option<&PrivateKey>) -> Message {
        let MessageContent::Ciphertext(blob) = &message.content else {
            return message;
        };

        message.content = match self.decrypt(blob, key).await {
            Ok(plaintext) => MessageContent::Plaintext(plaintext),
            Err(failure) => {
                warn!(
                    server_id = ?message.server_id,
                    reason = failure.code(),
                    error = %failure,
                    "Message decryption failed"
                );
                metrics::record_counter(DECRYPT_FAILED, 1);
                MessageContent::Placeholder(Self::placeholder(&failure))
            }
        };
        message
    }

    /// Decrypt every message independently; one failure never affects the others.
    /// Output order matches input order.
    pub async fn decrypt_batch(&self, messages: Vec<Message>, key: Option<&PrivateKey>) -> Vec<Message> {
        let encrypted = messages.iter().filter(|m| m.content.is_ciphertext()).count();
        if encrypted > 0 {
            debug!(total = messages.len(), encrypted, "Decrypting batch");
        }
        join_all(messages.into_iter().map(|m| self.decrypt_message(m, key))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_model::{ServerId, Timestamp, UserId};
    use crate::test_utils::MockDecryptionCapability;

    fn gateway() -> DecryptionGateway {
        DecryptionGateway::new(Arc::new(MockDecryptionCapability::new()))
    }

    fn encrypted(id: u64, blob: &str) -> Message {
        Message::persisted(
            ServerId(id),
            UserId::new("2"),
            false,
            MessageContent::Ciphertext(blob.to_string()),
            Timestamp(id),
        )
    }

    #[tokio::test]
    async fn test_decrypt_success() {
        let key = PrivateKey::new("k");
        assert_eq!(gateway().decrypt("enc:hello", Some(&key)).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_key_is_no_key() {
        assert_eq!(gateway().decrypt("enc:x", None).await, Err(DecryptFailure::NoKey));
        let blank = PrivateKey::new(" ");
        assert_eq!(gateway().decrypt("enc:x", Some(&blank)).await, Err(DecryptFailure::NoKey));
    }

    #[tokio::test]
    async fn test_rejected_and_unreachable() {
        let key = PrivateKey::new("k");
        let gw = gateway();
        assert!(matches!(
            gw.decrypt("garbage", Some(&key)).await,
            Err(DecryptFailure::RemoteRejected(_))
        ));

        let offline = MockDecryptionCapability::new();
        offline.set_unreachable(true);
        let gw = DecryptionGateway::new(Arc::new(offline));
        assert!(matches!(
            gw.decrypt("enc:x", Some(&key)).await,
            Err(DecryptFailure::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_message_keeps_slot_with_placeholder() {
        let key = PrivateKey::new("k");
        let msg = gateway().decrypt_message(encrypted(1, "garbage"), Some(&key)).await;
        assert_eq!(msg.server_id, Some(ServerId(1)));
        assert!(matches!(msg.content, MessageContent::Placeholder(_)));
        assert!(msg.text().starts_with("🔒 Decryption failed: "));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let key = PrivateKey::new("k");
        let batch = vec![
            encrypted(1, "enc:one"),
            encrypted(2, "broken"),
            encrypted(3, "enc:three"),
        ];
        let out = gateway().decrypt_batch(batch, Some(&key)).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text(), "one");
        assert!(matches!(out[1].content, MessageContent::Placeholder(_)));
        assert_eq!(out[2].text(), "three");
    }

    #[test]
    fn test_placeholder_carries_reason() {
        let text = DecryptionGateway::placeholder(&DecryptFailure::RemoteRejected("bad padding".into()));
        assert_eq!(text, "🔒 Decryption failed: bad padding");
        assert_eq!(
            DecryptionGateway::placeholder(&DecryptFailure::NoKey),
            "🔒 Decryption failed: no private key available"
        );
    }
}
