/*
    coordinator.rs - Orchestration of one active conversation

    The coordinator is an actor: a single task owns the MessageLog, the chat
    ChannelSession and the FallbackPoller, and handles one event at a time:

    - caller commands (select, send, acknowledge, key check)
    - link events of the chat session
    - completions of suspended work (seed fetch, poll, decrypt, fallback send)

    Suspended work runs in spawned tasks. Its result comes back as a
    `Completion` tagged with the epoch of the conversation it was issued for
    and is dropped if the user has switched away in the meantime.

    After every event that changed something, a fresh `ConversationView` is
    published on the watch channel.
*/

use super::errors::{DeliveryError, DeliveryResult};
use super::events::{Command, Completion, ConversationEpoch};
use super::pipeline::FetchPipeline;
use super::poller::FallbackPoller;
use super::view::{ConversationView, ViewState};
use crate::config::{Config, ServerConfig};
use crate::core_api::MessageApi;
use crate::core_channel::{
    ChannelSession, ChatFrame, InboundFrame, LinkEvent, OutboundFrame, PushTransport, ReconnectPolicy,
    SendOutcome, SessionNotice, SessionState,
};
use crate::core_crypto::DecryptionGateway;
use crate::core_keys::{KeyStatus, KeyStore, PrivateKey};
use crate::core_model::{
    ConversationId, DedupKey, DeliveryState, LocalId, Message, MessageContent, ReadState, ServerId, Timestamp,
    UserId,
};
use crate::core_store::{MergeOutcome, MessageLog};
use crate::metrics::{
    self, CHANNEL_FAILOVER, FRAMES_RECEIVED, MERGE_DUPLICATE, MERGE_INSERTED, MERGE_UPDATED,
    SEND_FALLBACK,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Collaborators injected into the coordinator
pub struct CoordinatorDeps {
    pub local_user: UserId,
    pub transport: Arc<dyn PushTransport>,
    pub api: Arc<dyn MessageApi>,
    pub gateway: DecryptionGateway,
    pub keys: KeyStore,
    /// Server-issued key to import if the store has none for `local_user`
    pub temporary_key: Option<PrivateKey>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub server: ServerConfig,
    pub policy: ReconnectPolicy,
    pub poll_interval: Duration,
    pub auto_acknowledge: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            policy: config.channel.policy,
            poll_interval: config.poller.interval,
            auto_acknowledge: config.channel.auto_acknowledge,
        }
    }
}

/// State bound to the selected conversation; replaced wholesale on switch
struct ActiveConversation {
    conversation: ConversationId,
    epoch: ConversationEpoch,
    session: ChannelSession,
    log: MessageLog,
    seeded: bool,
    /// Poller started only because the initial fetch failed
    seed_retry: bool,
    /// Receipts issued while the channel was down. A full fetch marks the
    /// conversation read server-side, which settles them.
    deferred_receipts: BTreeSet<ServerId>,
    /// Outstanding HTTP sends per pending record
    in_flight: HashMap<LocalId, usize>,
}

pub struct DeliveryCoordinator {
    local_user: UserId,
    transport: Arc<dyn PushTransport>,
    keys: KeyStore,
    pipeline: FetchPipeline,
    settings: CoordinatorSettings,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    poller: FallbackPoller,
    active: Option<ActiveConversation>,
    next_epoch: u64,
    key_status: KeyStatus,
    view: watch::Sender<ConversationView>,
}

impl DeliveryCoordinator {
    pub(super) fn new(
        deps: CoordinatorDeps,
        settings: CoordinatorSettings,
        commands: mpsc::Receiver<Command>,
        view: watch::Sender<ConversationView>,
    ) -> Self {
        let temporary = deps.temporary_key.as_ref().map(|k| k.expose());
        let key_status = deps.keys.ensure_key(&deps.local_user, temporary);
        if !key_status.is_usable() {
            warn!(user_id = %deps.local_user, "Starting without a private key; encrypted messages will not be readable");
        }

        let pipeline = FetchPipeline::new(deps.api, deps.gateway, deps.keys.clone(), deps.local_user.clone());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let poller = FallbackPoller::new(pipeline.clone(), completions_tx.clone());
        view.send_replace(ConversationView::idle(key_status));

        Self {
            local_user: deps.local_user,
            transport: deps.transport,
            keys: deps.keys,
            pipeline,
            settings,
            commands,
            completions_tx,
            completions_rx,
            poller,
            active: None,
            next_epoch: 0,
            key_status,
            view,
        }
    }

    pub(super) async fn run(mut self) {
        info!(user_id = %self.local_user, "Delivery coordinator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = next_link_event(&mut self.active) => self.handle_link_event(event),
                Some(completion) = self.completions_rx.recv() => self.handle_completion(completion),
            }
        }
        info!(user_id = %self.local_user, "Delivery coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectConversation { contact, reply } => {
                self.select_conversation(contact).await;
                let _ = reply.send(Ok(()));
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            Command::AcknowledgeRead { message_id, reply } => {
                let _ = reply.send(self.acknowledge_read(message_id));
            }
            Command::CheckKey { reply } => {
                let _ = reply.send(self.check_key().await);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn select_conversation(&mut self, contact: ConversationId) {
        self.teardown().await;

        self.next_epoch += 1;
        let epoch = ConversationEpoch(self.next_epoch);
        info!(conversation = %contact, %epoch, "Selecting conversation");

        let mut session = ChannelSession::new("chat", self.transport.clone(), self.settings.policy);
        let notices = session.open(self.settings.server.chat_endpoint(&contact));
        self.active = Some(ActiveConversation {
            conversation: contact.clone(),
            epoch,
            session,
            log: MessageLog::new(),
            seeded: false,
            seed_retry: false,
            deferred_receipts: BTreeSet::new(),
            in_flight: HashMap::new(),
        });
        self.apply_notices(notices);

        let pipeline = self.pipeline.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = pipeline.fetch(&contact).await;
            let _ = completions.send(Completion::Seeded { epoch, result });
        });

        self.publish();
    }

    /// Close the channel and stop polling for the current conversation.
    /// Chat messages still queued on the closed channel go out via HTTP.
    async fn teardown(&mut self) {
        self.poller.stop();
        let Some(mut active) = self.active.take() else {
            return;
        };

        let stranded = active.session.close().await;
        debug!(conversation = %active.conversation, stranded = stranded.len(), "Closed conversation");
        for frame in stranded {
            if let OutboundFrame::ChatMessage { message } = frame {
                let api = self.pipeline.api().clone();
                let conversation = active.conversation.clone();
                tokio::spawn(async move {
                    match api.send_message(&conversation, &message).await {
                        Ok(receipt) => debug!(%conversation, server_id = %receipt.server_id, "Delivered queued message after switch"),
                        Err(e) => warn!(%conversation, error = %e, "Failed to deliver queued message after switch"),
                    }
                });
            }
        }
    }

    fn send_message(&mut self, text: String) -> DeliveryResult<LocalId> {
        if text.trim().is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }
        let local_user = self.local_user.clone();
        let active = self.active.as_mut().ok_or(DeliveryError::NoConversation)?;

        let local_id = LocalId::generate();
        let message = Message::outgoing(local_id.clone(), local_user, text.clone(), Timestamp::now());
        record_merge(active.log.merge(message));

        match active.session.send(OutboundFrame::ChatMessage { message: text.clone() }) {
            SendOutcome::Sent => debug!(%local_id, "Message sent on push channel"),
            SendOutcome::Queued => debug!(%local_id, "Message queued until the channel opens"),
            SendOutcome::Rejected(reason) => {
                debug!(%local_id, %reason, "Push channel unavailable, sending via fallback");
                self.send_via_api(Some(local_id.clone()), text);
            }
        }

        self.publish();
        Ok(local_id)
    }

    /// Single-shot HTTP send for the selected conversation
    fn send_via_api(&mut self, local_id: Option<LocalId>, text: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(id) = &local_id {
            *active.in_flight.entry(id.clone()).or_default() += 1;
        }
        let (conversation, epoch) = (active.conversation.clone(), active.epoch);
        self.fallback_send(conversation, epoch, local_id, text);
    }

    fn fallback_send(
        &self,
        conversation: ConversationId,
        epoch: ConversationEpoch,
        local_id: Option<LocalId>,
        text: String,
    ) {
        metrics::record_counter(SEND_FALLBACK, 1);
        let api = self.pipeline.api().clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.send_message(&conversation, &text).await;
            let _ = completions.send(Completion::FallbackSent {
                epoch,
                local_id,
                text,
                result,
            });
        });
    }

    fn acknowledge_read(&mut self, message_id: ServerId) -> DeliveryResult<bool> {
        let active = self.active.as_mut().ok_or(DeliveryError::NoConversation)?;
        let changed = acknowledge(active, message_id);
        if changed {
            self.publish();
        }
        Ok(changed)
    }

    async fn check_key(&mut self) -> DeliveryResult<KeyStatus> {
        self.keys.reload_async().await;
        if !self.keys.has_private_key(&self.local_user) {
            self.set_key_status(KeyStatus::Missing);
            return Err(DeliveryError::KeyUnavailable);
        }
        if !self.key_status.is_usable() {
            self.set_key_status(KeyStatus::Present);
        }
        Ok(self.key_status)
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let notices = active.session.handle_link_event(event);
        self.apply_notices(notices);
    }

    fn apply_notices(&mut self, notices: Vec<SessionNotice>) {
        for notice in notices {
            match notice {
                SessionNotice::StateChanged(state) => {
                    debug!(%state, "Chat channel state");
                    self.publish();
                }
                SessionNotice::Frame(frame) => self.handle_frame(frame),
                SessionNotice::FailedOver { stranded } => self.fail_over(stranded),
            }
        }
    }

    fn fail_over(&mut self, stranded: Vec<OutboundFrame>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        metrics::record_counter(CHANNEL_FAILOVER, 1);
        info!(conversation = %active.conversation, "Chat channel failed over to polling");

        active.seed_retry = false;
        let (conversation, epoch) = (active.conversation.clone(), active.epoch);
        let mut unsent = Vec::new();
        for frame in stranded {
            match frame {
                OutboundFrame::ChatMessage { message } => unsent.push(message),
                OutboundFrame::ReadReceipt { message_id } => {
                    active.deferred_receipts.insert(message_id);
                }
                OutboundFrame::VerifySecurity => {}
            }
        }
        for text in unsent {
            let local_id = self.active.as_ref().and_then(|active| unsent_record(active, &text));
            self.send_via_api(local_id, text);
        }

        self.poller.start(conversation, epoch, self.settings.poll_interval);
        self.publish();
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        metrics::record_counter(FRAMES_RECEIVED, 1);
        match frame {
            InboundFrame::ChatMessage(chat) => self.handle_chat_frame(chat),
            InboundFrame::ReadReceipt { message_id, reader_id } => {
                if reader_id.as_ref() == Some(&self.local_user) {
                    // Echo of our own receipt
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.log.apply_read_receipt(message_id) {
                    debug!(%message_id, "Message read by peer");
                    self.publish();
                }
            }
            other => debug!(?other, "Ignoring non-chat frame on chat channel"),
        }
    }

    fn handle_chat_frame(&mut self, chat: ChatFrame) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !chat.belongs_to(&active.conversation, &self.local_user) {
            debug!(
                conversation = %active.conversation,
                sender = %chat.sender_id,
                "Ignoring frame for another conversation"
            );
            return;
        }

        let message = match chat.to_message(&self.local_user) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed chat frame");
                return;
            }
        };

        if message.content.is_ciphertext() {
            let pipeline = self.pipeline.clone();
            let completions = self.completions_tx.clone();
            let epoch = active.epoch;
            tokio::spawn(async move {
                let message = pipeline.decrypt(message).await;
                let _ = completions.send(Completion::Decrypted { epoch, message });
            });
            return;
        }

        if self.merge_incoming(vec![message]) {
            self.publish();
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let current = self.active.as_ref().map(|a| a.epoch);
        if current != Some(completion.epoch()) {
            debug!(
                kind = completion.kind(),
                epoch = %completion.epoch(),
                "Discarding result for a conversation no longer selected"
            );
            return;
        }

        match completion {
            Completion::Seeded { result, .. } | Completion::Polled { result, .. } => match result {
                Ok(messages) => {
                    let changed = self.merge_incoming(messages);
                    let Some(active) = self.active.as_mut() else {
                        return;
                    };
                    let first_seed = !active.seeded;
                    active.seeded = true;
                    // Includes receipts deferred while merging this batch:
                    // the fetch that returned it marked it read
                    if !active.deferred_receipts.is_empty() {
                        debug!(count = active.deferred_receipts.len(), "Read state settled by full fetch");
                        active.deferred_receipts.clear();
                    }

                    let failed_over = active.session.state() == SessionState::FailedFallback;
                    let seed_loaded = active.seed_retry && !failed_over;
                    if seed_loaded {
                        active.seed_retry = false;
                        self.poller.stop();
                        info!("History loaded, seed polling stopped");
                    }
                    if failed_over {
                        self.resend_pending();
                    }
                    if changed || first_seed || seed_loaded {
                        self.publish();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Full fetch failed");
                    self.retry_seed();
                }
            },
            Completion::Decrypted { message, .. } => {
                if self.merge_incoming(vec![message]) {
                    self.publish();
                }
            }
            Completion::FallbackSent {
                local_id, text, result, ..
            } => {
                if let (Some(active), Some(id)) = (self.active.as_mut(), local_id.as_ref()) {
                    if let Some(outstanding) = active.in_flight.get_mut(id) {
                        *outstanding = outstanding.saturating_sub(1);
                        if *outstanding == 0 {
                            active.in_flight.remove(id);
                        }
                    }
                }
                match result {
                    Ok(receipt) => {
                        let mut echo = Message::persisted(
                            receipt.server_id,
                            self.local_user.clone(),
                            true,
                            MessageContent::Plaintext(text),
                            receipt.sent_at.unwrap_or_else(Timestamp::now),
                        );
                        echo.local_id = local_id;
                        if self.merge_incoming(vec![echo]) {
                            self.publish();
                        }
                    }
                    Err(e) => {
                        warn!(local_id = ?local_id, error = %e, "Fallback send failed, retrying on next poll");
                    }
                }
            }
        }
    }

    /// Poll until the history has loaded once. Covers a failed initial fetch
    /// while the push channel is up and no fallback poller runs.
    fn retry_seed(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.seeded || self.poller.is_active() {
            return;
        }
        active.seed_retry = true;
        let (conversation, epoch) = (active.conversation.clone(), active.epoch);
        info!(%conversation, "Initial fetch failed, polling until history loads");
        self.poller.start(conversation, epoch, self.settings.poll_interval);
        self.publish();
    }

    /// Re-submit pending messages whose HTTP send failed
    fn resend_pending(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let retry: Vec<(LocalId, String)> = active
            .log
            .all()
            .iter()
            .filter(|message| awaiting_send(active, message))
            .filter_map(|message| Some((message.local_id.clone()?, message.text().to_string())))
            .collect();
        if !retry.is_empty() {
            info!(count = retry.len(), "Re-sending pending messages");
        }
        for (local_id, text) in retry {
            self.send_via_api(Some(local_id), text);
        }
    }

    /// Merge a batch into the log; acknowledges fresh peer messages when
    /// configured to. Returns whether the log changed.
    fn merge_incoming(&mut self, messages: Vec<Message>) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let mut changed = false;
        let mut saw_placeholder = false;

        for message in messages {
            saw_placeholder |= matches!(message.content, MessageContent::Placeholder(_));
            let unread_from_peer = !message.is_self && message.read_state == ReadState::Unread;
            let server_id = message.server_id;

            let outcome = active.log.merge(message);
            record_merge(outcome);
            changed |= outcome.changed();

            if self.settings.auto_acknowledge && unread_from_peer && outcome == MergeOutcome::Inserted {
                if let Some(id) = server_id {
                    changed |= acknowledge(active, id);
                }
            }
        }

        if saw_placeholder && self.key_status.is_usable() && !self.keys.has_private_key(&self.local_user) {
            self.set_key_status(KeyStatus::Missing);
        }
        changed
    }

    fn set_key_status(&mut self, status: KeyStatus) {
        if self.key_status != status {
            warn!(user_id = %self.local_user, ?status, "Private key status changed");
            self.key_status = status;
            self.publish();
        }
    }

    fn publish(&self) {
        let view = match &self.active {
            None => ConversationView::idle(self.key_status),
            Some(active) => ConversationView {
                conversation: Some(active.conversation.clone()),
                messages: active.log.all().to_vec(),
                connection: active.session.state(),
                fallback_active: self.poller.is_active(),
                state: if !active.log.is_empty() {
                    ViewState::Messages
                } else if active.seeded {
                    ViewState::Empty
                } else {
                    ViewState::Loading
                },
                key_status: self.key_status,
            },
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

/// Mark `message_id` read locally and tell the peer if the channel is up.
/// While the channel is down the receipt is deferred to the next full fetch.
fn acknowledge(active: &mut ActiveConversation, message_id: ServerId) -> bool {
    let key = DedupKey::Server(message_id);
    let Some(message) = active.log.get(&key) else {
        debug!(%message_id, "Acknowledge for unknown message");
        return false;
    };
    let from_peer = !message.is_self;
    let changed = active.log.mark_read(&key);
    if !changed || !from_peer {
        return changed;
    }

    if active.session.state() == SessionState::Open {
        let outcome = active.session.send(OutboundFrame::ReadReceipt { message_id });
        debug!(%message_id, ?outcome, "Read receipt issued");
    } else {
        active.deferred_receipts.insert(message_id);
        debug!(%message_id, "Channel down, read receipt deferred to next fetch");
    }
    changed
}

/// Pending self record with no server copy and no HTTP send outstanding
fn awaiting_send(active: &ActiveConversation, message: &Message) -> bool {
    message.is_self
        && message.server_id.is_none()
        && message.delivery_state == DeliveryState::Pending
        && message
            .local_id
            .as_ref()
            .is_some_and(|id| !active.in_flight.contains_key(id))
}

/// Oldest record still waiting for a send of `text`
fn unsent_record(active: &ActiveConversation, text: &str) -> Option<LocalId> {
    active
        .log
        .all()
        .iter()
        .find(|message| awaiting_send(active, message) && message.text() == text)
        .and_then(|message| message.local_id.clone())
}

fn record_merge(outcome: MergeOutcome) {
    match outcome {
        MergeOutcome::Inserted => metrics::record_counter(MERGE_INSERTED, 1),
        MergeOutcome::Updated => metrics::record_counter(MERGE_UPDATED, 1),
        MergeOutcome::DuplicateIgnored => metrics::record_counter(MERGE_DUPLICATE, 1),
        MergeOutcome::Rejected => {}
    }
}

async fn next_link_event(active: &mut Option<ActiveConversation>) -> Option<LinkEvent> {
    match active {
        Some(active) => active.session.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_api::{ApiError, SentReceipt};
    use crate::test_utils::{within, MockDecryptionCapability, MockMessageApi, MockTransport};

    fn local() -> UserId {
        UserId::new("1")
    }

    fn peer_message(id: u64, text: &str) -> Message {
        Message::persisted(
            ServerId(id),
            UserId::new("2"),
            false,
            MessageContent::Plaintext(text.to_string()),
            Timestamp(id * 1000),
        )
    }

    fn coordinator(
        transport: Arc<MockTransport>,
        api: Arc<MockMessageApi>,
        auto_acknowledge: bool,
    ) -> (DeliveryCoordinator, watch::Receiver<ConversationView>) {
        let keys = KeyStore::in_memory();
        keys.store_private_key(PrivateKey::new("key"), &local()).unwrap();
        let deps = CoordinatorDeps {
            local_user: local(),
            transport,
            api,
            gateway: DecryptionGateway::new(Arc::new(MockDecryptionCapability::new())),
            keys,
            temporary_key: None,
        };
        let settings = CoordinatorSettings {
            policy: ReconnectPolicy::FailFastToFallback,
            poll_interval: Duration::from_millis(50),
            auto_acknowledge,
            ..CoordinatorSettings::default()
        };
        let (_commands_tx, commands_rx) = mpsc::channel(1);
        let (view_tx, view_rx) = watch::channel(ConversationView::idle(KeyStatus::Missing));
        (DeliveryCoordinator::new(deps, settings, commands_rx, view_tx), view_rx)
    }

    fn active(coordinator: &DeliveryCoordinator) -> &ActiveConversation {
        coordinator.active.as_ref().expect("conversation selected")
    }

    #[tokio::test]
    async fn test_completion_from_previous_epoch_is_dropped() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, view) = coordinator(transport, api, false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        assert_eq!(view.borrow().state, ViewState::Loading);

        coordinator.handle_completion(Completion::Seeded {
            epoch: ConversationEpoch(epoch.0 - 1),
            result: Ok(vec![peer_message(1, "stale")]),
        });
        assert!(active(&coordinator).log.is_empty());
        assert!(!active(&coordinator).seeded);

        coordinator.handle_completion(Completion::Seeded {
            epoch,
            result: Ok(vec![peer_message(2, "fresh")]),
        });
        assert_eq!(active(&coordinator).log.len(), 1);
        assert_eq!(view.borrow().state, ViewState::Messages);
        assert_eq!(view.borrow().messages[0].text(), "fresh");
    }

    #[tokio::test]
    async fn test_failed_seed_keeps_loading_state() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, view) = coordinator(transport, api, false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        coordinator.handle_completion(Completion::Seeded {
            epoch,
            result: Err(ApiError::Http("timeout".to_string())),
        });
        assert_eq!(view.borrow().state, ViewState::Loading);
        // Channel is still connecting, so only the seed retry polls
        assert!(coordinator.poller.is_active());
        assert!(active(&coordinator).seed_retry);
        assert!(view.borrow().fallback_active);

        coordinator.handle_completion(Completion::Polled {
            epoch,
            result: Err(ApiError::Http("timeout".to_string())),
        });
        assert!(coordinator.poller.is_active());

        coordinator.handle_completion(Completion::Polled { epoch, result: Ok(vec![]) });
        assert_eq!(view.borrow().state, ViewState::Empty);
        assert!(!coordinator.poller.is_active());
        assert!(!view.borrow().fallback_active);
    }

    #[tokio::test]
    async fn test_receipt_deferred_while_channel_down() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, _view) = coordinator(transport, api, false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        coordinator.handle_completion(Completion::Seeded {
            epoch,
            result: Ok(vec![peer_message(1, "hey")]),
        });
        assert_eq!(active(&coordinator).log.all()[0].read_state, ReadState::Unread);

        assert_eq!(coordinator.acknowledge_read(ServerId(1)), Ok(true));
        assert_eq!(coordinator.acknowledge_read(ServerId(1)), Ok(false));
        assert_eq!(coordinator.acknowledge_read(ServerId(99)), Ok(false));
        assert!(active(&coordinator).deferred_receipts.contains(&ServerId(1)));
        assert_eq!(active(&coordinator).session.queued(), 0);

        coordinator.handle_completion(Completion::Polled {
            epoch,
            result: Ok(vec![peer_message(1, "hey")]),
        });
        assert!(active(&coordinator).deferred_receipts.is_empty());
        assert_eq!(active(&coordinator).log.all()[0].read_state, ReadState::Read);
    }

    #[tokio::test]
    async fn test_auto_acknowledge_only_fresh_peer_messages() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, _view) = coordinator(transport, api, true);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        let mine = Message::persisted(
            ServerId(2),
            local(),
            true,
            MessageContent::Plaintext("mine".to_string()),
            Timestamp(2000),
        );
        coordinator.handle_completion(Completion::Seeded {
            epoch,
            result: Ok(vec![peer_message(1, "theirs"), mine]),
        });

        let active = active(&coordinator);
        assert_eq!(active.log.all()[0].read_state, ReadState::Read);
        assert_eq!(active.log.all()[0].delivery_state, DeliveryState::Read);
        assert_eq!(active.log.all()[1].delivery_state, DeliveryState::Sent);
        // The fetch that delivered the message marked it read server-side
        assert!(active.deferred_receipts.is_empty());
        assert_eq!(active.session.queued(), 0);
    }

    #[tokio::test]
    async fn test_auto_acknowledge_of_push_message_is_deferred_while_down() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, _view) = coordinator(transport, api, true);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        coordinator.handle_completion(Completion::Decrypted {
            epoch,
            message: peer_message(4, "pushed"),
        });

        let active = active(&coordinator);
        assert_eq!(active.log.all()[0].read_state, ReadState::Read);
        assert!(active.deferred_receipts.contains(&ServerId(4)));
    }

    #[tokio::test]
    async fn test_send_validation() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let (mut coordinator, _view) = coordinator(transport, MockMessageApi::new(), false);

        assert_eq!(coordinator.send_message("hi".to_string()), Err(DeliveryError::NoConversation));
        coordinator.select_conversation(ConversationId::new("2")).await;
        assert_eq!(coordinator.send_message("   ".to_string()), Err(DeliveryError::EmptyMessage));
        assert!(active(&coordinator).log.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_send_result_promotes_or_keeps_pending() {
        let transport = MockTransport::new();
        transport.hold_connections();
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, view) = coordinator(transport, api, false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let epoch = active(&coordinator).epoch;
        let local_id = coordinator.send_message("hello".to_string()).unwrap();
        assert_eq!(active(&coordinator).session.queued(), 1);
        assert_eq!(active(&coordinator).log.pending_count(), 1);

        coordinator.handle_completion(Completion::FallbackSent {
            epoch,
            local_id: Some(local_id.clone()),
            text: "hello".to_string(),
            result: Err(ApiError::Status("Failed to send message".to_string())),
        });
        assert_eq!(active(&coordinator).log.pending_count(), 1);

        coordinator.handle_completion(Completion::FallbackSent {
            epoch,
            local_id: Some(local_id.clone()),
            text: "hello".to_string(),
            result: Ok(SentReceipt {
                server_id: ServerId(7),
                sent_at: None,
            }),
        });
        let snapshot = view.borrow().clone();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].local_id, Some(local_id));
        assert_eq!(snapshot.messages[0].server_id, Some(ServerId(7)));
        assert_eq!(snapshot.messages[0].delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_check_key_tracks_store() {
        let (mut coordinator, view) = coordinator(MockTransport::new(), MockMessageApi::new(), false);
        assert_eq!(coordinator.check_key().await, Ok(KeyStatus::Present));

        coordinator.keys.clear_private_key().unwrap();
        assert_eq!(coordinator.check_key().await, Err(DeliveryError::KeyUnavailable));
        assert_eq!(view.borrow().key_status, KeyStatus::Missing);

        coordinator
            .keys
            .store_private_key(PrivateKey::new("again"), &local())
            .unwrap();
        assert_eq!(coordinator.check_key().await, Ok(KeyStatus::Present));
    }

    #[tokio::test]
    async fn test_failed_fallback_send_is_resubmitted_on_next_poll() {
        let transport = MockTransport::new();
        transport.refuse_connections(true);
        let api = MockMessageApi::new();
        api.hold_fetches();
        api.fail_sends(true);
        let (mut coordinator, _view) = coordinator(transport, api.clone(), false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let event = within(coordinator.active.as_mut().unwrap().session.next_event())
            .await
            .unwrap();
        coordinator.handle_link_event(event);
        assert_eq!(active(&coordinator).session.state(), SessionState::FailedFallback);
        let epoch = active(&coordinator).epoch;

        let local_id = coordinator.send_message("hello".to_string()).unwrap();
        assert_eq!(active(&coordinator).in_flight.get(&local_id), Some(&1));

        let failed = within(coordinator.completions_rx.recv()).await.unwrap();
        assert!(matches!(failed, Completion::FallbackSent { result: Err(_), .. }));
        coordinator.handle_completion(failed);
        assert!(active(&coordinator).in_flight.is_empty());
        assert_eq!(active(&coordinator).log.pending_count(), 1);

        // Next poll re-submits once, a second poll waits for that attempt
        api.fail_sends(false);
        coordinator.handle_completion(Completion::Polled { epoch, result: Ok(vec![]) });
        coordinator.handle_completion(Completion::Polled { epoch, result: Ok(vec![]) });
        assert_eq!(active(&coordinator).in_flight.get(&local_id), Some(&1));

        let sent = within(coordinator.completions_rx.recv()).await.unwrap();
        coordinator.handle_completion(sent);
        assert_eq!(active(&coordinator).log.pending_count(), 0);
        assert_eq!(active(&coordinator).log.all()[0].local_id, Some(local_id));
        assert_eq!(api.sent(), vec![(ConversationId::new("2"), "hello".to_string())]);
    }

    #[tokio::test]
    async fn test_stranded_frames_are_sent_against_their_pending_records() {
        let transport = MockTransport::new();
        transport.hold_connections();
        transport.refuse_connections(true);
        let api = MockMessageApi::new();
        api.hold_fetches();
        let (mut coordinator, _view) = coordinator(transport.clone(), api, false);

        coordinator.select_conversation(ConversationId::new("2")).await;
        let first = coordinator.send_message("same".to_string()).unwrap();
        let second = coordinator.send_message("same".to_string()).unwrap();
        assert_eq!(active(&coordinator).session.queued(), 2);

        transport.release_connections();
        let event = within(coordinator.active.as_mut().unwrap().session.next_event())
            .await
            .unwrap();
        coordinator.handle_link_event(event);

        let in_flight = &active(&coordinator).in_flight;
        assert_eq!(in_flight.get(&first), Some(&1));
        assert_eq!(in_flight.get(&second), Some(&1));
    }
}
