#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur_core::core_api::FetchResponse;
use murmur_core::core_model::{ConversationId, UserId};
use murmur_core::core_store::MessageLog;

fuzz_target!(|data: &[u8]| {
    let Ok(response) = serde_json::from_slice::<FetchResponse>(data) else {
        return;
    };
    let Ok(entries) = response.into_result() else {
        return;
    };
    // Whatever survives decoding must merge without breaking log order
    let conversation = ConversationId::new("2");
    let mut log = MessageLog::new();
    for entry in &entries {
        if let Ok(message) = entry.to_message(&UserId::new("1"), &conversation) {
            log.merge(message);
        }
    }
    assert!(log.all().windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
});
