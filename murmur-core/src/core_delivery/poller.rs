//! Periodic full-state fetch while the push channel is unavailable
//!
//! At most one poll loop runs at a time; `start` stops the previous one first.
//! The first fetch happens one interval after `start`. Fetches never overlap:
//! the next tick is scheduled only after the previous fetch has finished.

use super::events::{Completion, ConversationEpoch};
use super::pipeline::FetchPipeline;
use crate::core_model::ConversationId;
use crate::metrics::{self, POLL_TICKS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

struct ActivePoll {
    conversation: ConversationId,
    epoch: ConversationEpoch,
    task: JoinHandle<()>,
}

pub struct FallbackPoller {
    pipeline: FetchPipeline,
    completions: mpsc::UnboundedSender<Completion>,
    active: Option<ActivePoll>,
}

impl FallbackPoller {
    pub fn new(pipeline: FetchPipeline, completions: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            pipeline,
            completions,
            active: None,
        }
    }

    pub fn start(&mut self, conversation: ConversationId, epoch: ConversationEpoch, interval: Duration) {
        self.stop();
        info!(%conversation, ?interval, "Starting fallback poller");

        let task = tokio::spawn(poll_loop(
            self.pipeline.clone(),
            self.completions.clone(),
            conversation.clone(),
            epoch,
            interval,
        ));
        self.active = Some(ActivePoll {
            conversation,
            epoch,
            task,
        });
    }

    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(conversation = %active.conversation, epoch = %active.epoch, "Stopping fallback poller");
            active.task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|a| &a.conversation)
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    pipeline: FetchPipeline,
    completions: mpsc::UnboundedSender<Completion>,
    conversation: ConversationId,
    epoch: ConversationEpoch,
    period: Duration,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        metrics::record_counter(POLL_TICKS, 1);
        let result = pipeline.fetch(&conversation).await;
        if completions.send(Completion::Polled { epoch, result }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::DecryptionGateway;
    use crate::core_keys::KeyStore;
    use crate::core_model::UserId;
    use crate::test_utils::{wire_message, MockDecryptionCapability, MockMessageApi};
    use std::sync::Arc;

    fn pipeline(api: Arc<MockMessageApi>) -> FetchPipeline {
        FetchPipeline::new(
            api,
            DecryptionGateway::new(Arc::new(MockDecryptionCapability::new())),
            KeyStore::in_memory(),
            UserId::new("1"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval() {
        let api = MockMessageApi::new();
        let conv = ConversationId::new("2");
        api.insert(&conv, wire_message(1, "hello", false));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(pipeline(api.clone()), tx);
        poller.start(conv.clone(), ConversationEpoch(1), Duration::from_secs(5));

        let start = Instant::now();
        let Some(Completion::Polled { epoch, result }) = rx.recv().await else {
            panic!("expected poll result");
        };
        assert_eq!(epoch, ConversationEpoch(1));
        assert_eq!(result.unwrap().len(), 1);
        assert!(start.elapsed() >= Duration::from_secs(5));

        rx.recv().await;
        assert_eq!(api.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_loop() {
        let api = MockMessageApi::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(pipeline(api.clone()), tx);

        poller.start(ConversationId::new("2"), ConversationEpoch(1), Duration::from_secs(5));
        poller.start(ConversationId::new("3"), ConversationEpoch(2), Duration::from_secs(5));
        assert_eq!(poller.conversation(), Some(&ConversationId::new("3")));

        for _ in 0..3 {
            let completion = rx.recv().await.unwrap();
            assert_eq!(completion.epoch(), ConversationEpoch(2));
        }

        poller.stop();
        assert!(!poller.is_active());
    }
}
