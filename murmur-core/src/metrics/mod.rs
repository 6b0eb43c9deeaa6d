//! Delivery metrics on the `metrics` facade
//!
//! No exporter is installed here; the embedding application decides where
//! the numbers go.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const FRAMES_RECEIVED: &str = "delivery.frames.received";
pub const MERGE_INSERTED: &str = "delivery.merge.inserted";
pub const MERGE_UPDATED: &str = "delivery.merge.updated";
pub const MERGE_DUPLICATE: &str = "delivery.merge.duplicate";
pub const DECRYPT_FAILED: &str = "delivery.decrypt.failed";
pub const CHANNEL_FAILOVER: &str = "delivery.channel.failover";
pub const SEND_FALLBACK: &str = "delivery.send.fallback";
pub const POLL_TICKS: &str = "delivery.poll.ticks";
pub const FETCH_DURATION: &str = "delivery.fetch.duration_ms";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(FRAMES_RECEIVED, "Push frames received on the chat channel");
    describe_counter!(MERGE_INSERTED, "Messages inserted into the message log");
    describe_counter!(MERGE_UPDATED, "Messages reconciled in place");
    describe_counter!(MERGE_DUPLICATE, "Merges that learned nothing new");
    describe_counter!(DECRYPT_FAILED, "Messages rendered with a decryption placeholder");
    describe_counter!(CHANNEL_FAILOVER, "Push channels that failed over to polling");
    describe_counter!(SEND_FALLBACK, "Messages sent through the HTTP fallback path");
    describe_counter!(POLL_TICKS, "Fallback poller fetches");
    describe_histogram!(FETCH_DURATION, "Full conversation fetch duration in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
