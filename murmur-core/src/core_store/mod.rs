/*
    core_store - In-memory state for the active conversation

    Handles:
    - Deduplicated, ordered message log
    - Delivery / read state reconciliation
*/

pub mod message_log;

pub use message_log::{MergeOutcome, MessageLog};
