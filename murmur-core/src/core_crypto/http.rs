//! Decryption capability reached over the server's HTTP endpoint

use super::{CapabilityResponse, DecryptFailure, DecryptionCapability};
use crate::core_keys::PrivateKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize)]
struct DecryptRequest<'a> {
    encrypted_message: &'a str,
    private_key: &'a str,
}

#[derive(Deserialize)]
struct DecryptReply {
    status: String,
    #[serde(default)]
    decrypted_message: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<DecryptReply> for CapabilityResponse {
    fn from(reply: DecryptReply) -> Self {
        match (reply.status.as_str(), reply.decrypted_message) {
            ("success", Some(plaintext)) => CapabilityResponse::Success { plaintext },
            _ => CapabilityResponse::Failure {
                reason: reply
                    .message
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

/// POSTs `{encrypted_message, private_key}` as JSON to the decrypt endpoint
pub struct HttpDecryptionCapability {
    client: reqwest::Client,
    url: String,
}

impl HttpDecryptionCapability {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DecryptionCapability for HttpDecryptionCapability {
    async fn decrypt(
        &self,
        ciphertext: &str,
        key: &PrivateKey,
    ) -> Result<CapabilityResponse, DecryptFailure> {
        let request = DecryptRequest {
            encrypted_message: ciphertext,
            private_key: key.expose(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DecryptFailure::TransportError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DecryptFailure::TransportError(format!("HTTP {}", status)));
        }

        let reply: DecryptReply = response.json().await.map_err(|e| {
            warn!(error = %e, "Malformed decryption response");
            DecryptFailure::TransportError(format!("malformed response: {}", e))
        })?;
        Ok(reply.into())
    }
}
