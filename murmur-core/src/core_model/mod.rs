//! Data model shared by the delivery subsystems

pub mod message;
pub mod types;

pub use message::{DedupKey, DeliveryState, Message, MessageContent, ReadState};
pub use types::{ConversationId, LocalId, ServerId, Timestamp, UserId};
