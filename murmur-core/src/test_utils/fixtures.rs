//! Test fixtures for wire payloads
//!
//! Fetch-all entries use fixed timestamps one second apart, keyed by id, so
//! canonical order follows the id. Push frames are stamped with the current
//! time, the way the server stamps them.

use crate::core_api::WireMessage;
use crate::core_model::ServerId;
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::json;

fn fixture_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(10, 0, 0))
        .expect("valid fixture date")
}

/// `sent_on` value for fixture message `id`
pub fn sent_on(id: u64) -> String {
    (fixture_epoch() + Duration::seconds(id as i64))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Plaintext fetch-all entry
pub fn wire_message(id: u64, text: &str, is_self: bool) -> WireMessage {
    WireMessage {
        id: ServerId(id),
        content: Some(text.to_string()),
        encrypted_content: None,
        is_self,
        sent_on: sent_on(id),
        is_read: false,
        sender: None,
    }
}

/// Fetch-all entry carrying a ciphertext blob
pub fn encrypted_wire_message(id: u64, blob: &str, is_self: bool) -> WireMessage {
    WireMessage {
        content: None,
        encrypted_content: Some(blob.to_string()),
        ..wire_message(id, "", is_self)
    }
}

/// Blob the mock decryption capability turns back into `text`
pub fn sealed(text: &str) -> String {
    format!("enc:{}", text)
}

/// `chat_message` push frame
pub fn chat_frame(id: u64, sender: &str, receiver: &str, text: &str) -> String {
    json!({
        "type": "chat_message",
        "message": text,
        "sender_id": sender,
        "receiver_id": receiver,
        "message_id": id,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// `chat_message` push frame with an encrypted body
pub fn encrypted_chat_frame(id: u64, sender: &str, receiver: &str, blob: &str) -> String {
    json!({
        "type": "chat_message",
        "encrypted_content": blob,
        "sender_id": sender,
        "receiver_id": receiver,
        "message_id": id,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// `read_receipt` push frame
pub fn read_receipt_frame(id: u64, reader: &str) -> String {
    json!({
        "type": "read_receipt",
        "message_id": id,
        "reader_id": reader,
    })
    .to_string()
}
