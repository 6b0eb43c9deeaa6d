//! Security-code verification channel
//!
//! A persistent-retry push session bound to the contact's security endpoint.
//! The server pushes the shared security code (and QR payload) on connect
//! and a `security_verified` frame once both sides have confirmed.

use super::frame::{InboundFrame, OutboundFrame};
use super::policy::ReconnectPolicy;
use super::session::{ChannelSession, SendOutcome, SessionNotice, SessionState};
use super::transport::PushTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationStatus {
    pub connection: SessionState,
    pub security_code: Option<String>,
    pub qr_data: Option<String>,
    pub verified: bool,
}

impl Default for VerificationStatus {
    fn default() -> Self {
        Self {
            connection: SessionState::Disconnected,
            security_code: None,
            qr_data: None,
            verified: false,
        }
    }
}

enum Command {
    Verify(oneshot::Sender<SendOutcome>),
}

pub struct VerificationChannel {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<VerificationStatus>,
    task: JoinHandle<()>,
}

impl VerificationChannel {
    pub fn start(transport: Arc<dyn PushTransport>, endpoint: String, retry_delay: Duration) -> Self {
        let (commands, commands_rx) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(VerificationStatus::default());
        let mut session = ChannelSession::new("security", transport, ReconnectPolicy::persistent(retry_delay));
        let notices = session.open(endpoint);
        apply(&status_tx, notices);

        let task = tokio::spawn(run(session, commands_rx, status_tx));
        Self { commands, status, task }
    }

    pub fn status(&self) -> watch::Receiver<VerificationStatus> {
        self.status.clone()
    }

    /// Ask the server to mark the conversation verified. Queued while reconnecting.
    pub async fn request_verification(&self) -> SendOutcome {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Verify(reply)).await.is_err() {
            return SendOutcome::Rejected("verification channel stopped".to_string());
        }
        rx.await
            .unwrap_or_else(|_| SendOutcome::Rejected("verification channel stopped".to_string()))
    }

    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

async fn run(
    mut session: ChannelSession,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<VerificationStatus>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Verify(reply)) => {
                    let outcome = session.send(OutboundFrame::VerifySecurity);
                    debug!(?outcome, "Verification requested");
                    let _ = reply.send(outcome);
                }
                None => break,
            },
            Some(event) = session.next_event() => {
                let notices = session.handle_link_event(event);
                apply(&status, notices);
            }
        }
    }
    session.close().await;
    status.send_modify(|s| s.connection = session.state());
}

fn apply(status: &watch::Sender<VerificationStatus>, notices: Vec<SessionNotice>) {
    for notice in notices {
        match notice {
            SessionNotice::StateChanged(state) => status.send_modify(|s| s.connection = state),
            SessionNotice::Frame(InboundFrame::SecurityData { security_code, qr_data, verified }) => {
                status.send_modify(|s| {
                    s.security_code = Some(security_code);
                    s.qr_data = qr_data;
                    s.verified = verified;
                });
            }
            SessionNotice::Frame(InboundFrame::SecurityVerified { verified }) => {
                info!(verified, "Security verification updated");
                status.send_modify(|s| s.verified = verified);
            }
            SessionNotice::Frame(other) => debug!(?other, "Ignoring frame on security channel"),
            SessionNotice::FailedOver { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recv_timeout, wait_for, MockTransport};

    #[tokio::test]
    async fn test_security_data_and_verification() {
        let transport = MockTransport::new();
        let channel = VerificationChannel::start(
            transport.clone(),
            "ws://test/ws/security/2/".to_string(),
            Duration::from_millis(50),
        );
        let mut remote = transport.accept().await;
        let mut status = channel.status();

        remote.push(r#"{"type":"security_data","security_code":"1234 5678","qr_data":"qr","verified":false}"#);
        let s = wait_for(&mut status, |s| s.security_code.is_some()).await;
        assert_eq!(s.security_code.as_deref(), Some("1234 5678"));
        assert_eq!(s.connection, SessionState::Open);

        assert_eq!(channel.request_verification().await, SendOutcome::Sent);
        let sent = recv_timeout(remote.outgoing(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(sent, r#"{"type":"verify_security"}"#);

        remote.push(r#"{"type":"security_verified","verified":true}"#);
        assert!(wait_for(&mut status, |s| s.verified).await.verified);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let transport = MockTransport::new();
        let channel = VerificationChannel::start(
            transport.clone(),
            "ws://test/ws/security/2/".to_string(),
            Duration::from_millis(10),
        );
        let remote = transport.accept().await;
        let mut status = channel.status();
        wait_for(&mut status, |s| s.connection == SessionState::Open).await;

        remote.close();
        let _second = transport.accept().await;
        wait_for(&mut status, |s| s.connection == SessionState::Open).await;
        assert_eq!(transport.connect_count(), 2);

        channel.shutdown().await;
    }
}
