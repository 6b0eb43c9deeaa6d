//! Cloneable front door to a running `DeliveryCoordinator`

use super::coordinator::{CoordinatorDeps, CoordinatorSettings, DeliveryCoordinator};
use super::errors::{DeliveryError, DeliveryResult};
use super::events::Command;
use super::view::ConversationView;
use crate::core_keys::KeyStatus;
use crate::core_model::{ConversationId, LocalId, ServerId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ConversationView>,
}

impl DeliveryCoordinator {
    /// Start the coordinator task. It runs until `shutdown` is called or
    /// every handle has been dropped.
    pub fn spawn(deps: CoordinatorDeps, settings: CoordinatorSettings) -> (CoordinatorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (view_tx, view_rx) = watch::channel(ConversationView::idle(KeyStatus::Missing));
        let coordinator = DeliveryCoordinator::new(deps, settings, commands_rx, view_tx);
        let task = tokio::spawn(coordinator.run());
        (
            CoordinatorHandle {
                commands: commands_tx,
                view: view_rx,
            },
            task,
        )
    }
}

impl CoordinatorHandle {
    /// Switch to the conversation with `contact`. Everything bound to the
    /// previous conversation is torn down before this returns.
    pub async fn select_conversation(&self, contact: ConversationId) -> DeliveryResult<()> {
        self.request(|reply| Command::SelectConversation { contact, reply }).await?
    }

    /// Render `text` optimistically and deliver it. The returned local id
    /// identifies the pending record until the server assigns its id.
    pub async fn send_message(&self, text: impl Into<String>) -> DeliveryResult<LocalId> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply }).await?
    }

    /// Returns whether the message changed state
    pub async fn acknowledge_read(&self, message_id: ServerId) -> DeliveryResult<bool> {
        self.request(|reply| Command::AcknowledgeRead { message_id, reply }).await?
    }

    pub async fn check_key(&self) -> DeliveryResult<KeyStatus> {
        self.request(|reply| Command::CheckKey { reply }).await?
    }

    /// Live view; `changed()` fires after every observable update
    pub fn view(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    pub async fn shutdown(&self) -> DeliveryResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> DeliveryResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| DeliveryError::CoordinatorStopped)?;
        rx.await.map_err(|_| DeliveryError::CoordinatorStopped)
    }
}
