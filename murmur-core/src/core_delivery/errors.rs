//! Errors surfaced to callers of the delivery coordinator
//!
//! Connection and decryption problems never show up here; they are absorbed
//! into observable state (connection indicator, placeholder content).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No usable private key; the user has to re-provision
    #[error("no private key available for this identity, log out and back in to regenerate keys")]
    KeyUnavailable,

    #[error("no conversation selected")]
    NoConversation,

    #[error("message is empty")]
    EmptyMessage,

    #[error("delivery coordinator has stopped")]
    CoordinatorStopped,
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
