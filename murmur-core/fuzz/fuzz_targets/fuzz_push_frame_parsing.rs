#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur_core::core_channel::InboundFrame;
use murmur_core::core_model::{ConversationId, UserId};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Arbitrary server frames must be rejected cleanly, never panic
    if let Ok(InboundFrame::ChatMessage(chat)) = InboundFrame::parse(text) {
        let local = UserId::new("1");
        let _ = chat.belongs_to(&ConversationId::new("2"), &local);
        let _ = chat.to_message(&local);
    }
});
