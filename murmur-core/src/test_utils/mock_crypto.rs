//! Stand-in decryption capability
//!
//! "Decrypts" blobs of the form `enc:<plaintext>` and rejects anything else.

use crate::core_crypto::{CapabilityResponse, DecryptFailure, DecryptionCapability};
use crate::core_keys::PrivateKey;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const PREFIX: &str = "enc:";

#[derive(Default)]
pub struct MockDecryptionCapability {
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl MockDecryptionCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the capability being offline
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecryptionCapability for MockDecryptionCapability {
    async fn decrypt(&self, ciphertext: &str, _key: &PrivateKey) -> Result<CapabilityResponse, DecryptFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DecryptFailure::TransportError("connection refused".to_string()));
        }
        Ok(match ciphertext.strip_prefix(PREFIX) {
            Some(plaintext) => CapabilityResponse::Success {
                plaintext: plaintext.to_string(),
            },
            None => CapabilityResponse::Failure {
                reason: "Decryption failed".to_string(),
            },
        })
    }
}
