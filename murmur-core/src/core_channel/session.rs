/*
    session.rs - Lifecycle of one realtime push connection

    State machine:
        DISCONNECTED --open--> CONNECTING --link opened--> OPEN
        OPEN --remote close / error--> DISCONNECTED
        CONNECTING --connect error--> DISCONNECTED
        DISCONNECTED --policy--> CONNECTING (persistent retry, after delay)
                              |-> FAILED_FALLBACK (fail fast, terminal)
        any --close()--> CLOSING --> DISCONNECTED

    The session does no I/O itself. Each connection attempt runs in a link
    task that reports back through `LinkEvent`s tagged with the attempt's
    generation; the owner pulls events with `next_event` and feeds them to
    `handle_link_event`, which returns the resulting notices. Events from a
    superseded generation are ignored.

    A frame counts as delivered only once the link has written it. Frames
    still buffered for the link when it ends come back with its `Closed`
    event (or from `close`) and rejoin the outbox ahead of anything queued
    since.
*/

use super::frame::{InboundFrame, OutboundFrame};
use super::policy::ReconnectPolicy;
use super::transport::PushTransport;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    FailedFallback,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::FailedFallback => "failed_fallback",
        };
        f.write_str(name)
    }
}

/// Result of `ChannelSession::send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Held in the outbox until the connection opens
    Queued,
    /// Handed to the live connection's writer
    Sent,
    /// Session has failed over; push sends are no longer attempted
    Rejected(String),
}

/// Report from a link task
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
        /// Frames the link accepted but never wrote
        unsent: Vec<OutboundFrame>,
    },
    RetryDue {
        generation: u64,
    },
}

impl LinkEvent {
    fn generation(&self) -> u64 {
        match self {
            LinkEvent::Opened { generation, .. }
            | LinkEvent::Frame { generation, .. }
            | LinkEvent::Closed { generation, .. }
            | LinkEvent::RetryDue { generation } => *generation,
        }
    }
}

/// What the owner has to react to after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    Frame(InboundFrame),
    /// Entered FAILED_FALLBACK; frames still in the outbox are handed back
    FailedOver { stranded: Vec<OutboundFrame> },
}

struct LinkHandle {
    shutdown: oneshot::Sender<()>,
    /// Resolves to the frames left unwritten at shutdown
    task: JoinHandle<Vec<OutboundFrame>>,
}

pub struct ChannelSession {
    name: &'static str,
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    endpoint: Option<String>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    generation: u64,
    outbox: VecDeque<OutboundFrame>,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    link: Option<LinkHandle>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl ChannelSession {
    /// `name` only labels log lines ("chat", "security")
    pub fn new(name: &'static str, transport: Arc<dyn PushTransport>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            name,
            transport,
            policy,
            endpoint: None,
            state: SessionState::Disconnected,
            state_tx,
            generation: 0,
            outbox: VecDeque::new(),
            outbound: None,
            link: None,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Start connecting to `endpoint`. No-op once failed over or while a
    /// connection attempt is already live.
    pub fn open(&mut self, endpoint: impl Into<String>) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        match self.state {
            SessionState::FailedFallback => {
                debug!(session = self.name, "open ignored after failover");
            }
            SessionState::Disconnected => {
                self.endpoint = Some(endpoint.into());
                self.start_connect(&mut notices);
            }
            state => {
                debug!(session = self.name, %state, "open ignored, session busy");
            }
        }
        notices
    }

    pub fn send(&mut self, mut frame: OutboundFrame) -> SendOutcome {
        if self.state == SessionState::FailedFallback {
            return SendOutcome::Rejected("push channel failed over to fallback".to_string());
        }

        if let Err(e) = frame.encode() {
            return SendOutcome::Rejected(e.to_string());
        }

        if self.state == SessionState::Open && self.outbox.is_empty() {
            if let Some(outbound) = &self.outbound {
                match outbound.send(frame) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(mpsc::error::SendError(returned)) => {
                        // Link task is gone; its Closed event is on the way
                        debug!(session = self.name, "link writer gone, queueing frame");
                        frame = returned;
                    }
                }
            }
        }

        self.outbox.push_back(frame);
        SendOutcome::Queued
    }

    /// Next event from the current or a past link task
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_link_event(&mut self, event: LinkEvent) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        if event.generation() != self.generation {
            debug!(
                session = self.name,
                stale = event.generation(),
                current = self.generation,
                "Ignoring event from superseded connection"
            );
            return notices;
        }

        match event {
            LinkEvent::Opened { outbound, .. } => {
                if self.state != SessionState::Connecting {
                    return notices;
                }
                self.outbound = Some(outbound);
                self.transition(SessionState::Open, &mut notices);
                self.flush_outbox();
            }
            LinkEvent::Frame { text, .. } => {
                if self.state != SessionState::Open {
                    return notices;
                }
                match InboundFrame::parse(&text) {
                    Ok(frame) => notices.push(SessionNotice::Frame(frame)),
                    Err(e) => warn!(session = self.name, error = %e, "Dropping malformed frame"),
                }
            }
            LinkEvent::Closed { reason, unsent, .. } => {
                self.requeue(unsent);
                if !matches!(self.state, SessionState::Connecting | SessionState::Open) {
                    return notices;
                }
                info!(session = self.name, %reason, queued = self.outbox.len(), "Push connection lost");
                self.outbound = None;
                self.link = None;
                self.transition(SessionState::Disconnected, &mut notices);
                self.apply_policy(&mut notices);
            }
            LinkEvent::RetryDue { .. } => {
                if self.state == SessionState::Disconnected && self.endpoint.is_some() {
                    self.start_connect(&mut notices);
                }
            }
        }
        notices
    }

    /// Shut the current connection down and wait for the link task to finish.
    /// Frames still queued are handed back to the caller.
    pub async fn close(&mut self) -> Vec<OutboundFrame> {
        let closing = self.generation;
        // Anything the old link task still reports is now stale
        self.generation += 1;
        self.outbound = None;

        let mut stranded = Vec::new();
        if let Some(link) = self.link.take() {
            let mut ignored = Vec::new();
            self.transition(SessionState::Closing, &mut ignored);
            let _ = link.shutdown.send(());
            match link.task.await {
                Ok(unsent) => stranded.extend(unsent),
                Err(e) => warn!(session = self.name, error = %e, "Link task ended abnormally"),
            }
        }
        // A link that ended on its own reported its unsent frames in an
        // event nobody has handled yet
        while let Ok(event) = self.events_rx.try_recv() {
            if let LinkEvent::Closed { generation, unsent, .. } = event {
                if generation == closing {
                    stranded.extend(unsent);
                }
            }
        }

        if self.state != SessionState::FailedFallback {
            let mut ignored = Vec::new();
            self.transition(SessionState::Disconnected, &mut ignored);
        }
        stranded.extend(self.outbox.drain(..));
        stranded
    }

    fn start_connect(&mut self, notices: &mut Vec<SessionNotice>) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        self.generation += 1;
        self.transition(SessionState::Connecting, notices);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_link(
            self.transport.clone(),
            endpoint,
            self.generation,
            self.events_tx.clone(),
            shutdown_rx,
        ));
        self.link = Some(LinkHandle { shutdown, task });
    }

    fn apply_policy(&mut self, notices: &mut Vec<SessionNotice>) {
        match self.policy {
            ReconnectPolicy::PersistentRetry { delay } => {
                debug!(session = self.name, ?delay, "Scheduling reconnect");
                let events = self.events_tx.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(LinkEvent::RetryDue { generation });
                });
            }
            ReconnectPolicy::FailFastToFallback => {
                self.transition(SessionState::FailedFallback, notices);
                let stranded: Vec<_> = self.outbox.drain(..).collect();
                info!(session = self.name, stranded = stranded.len(), "Push channel failed over to fallback");
                notices.push(SessionNotice::FailedOver { stranded });
            }
        }
    }

    /// Put frames a finished link never wrote back at the head of the outbox
    fn requeue(&mut self, unsent: Vec<OutboundFrame>) {
        if unsent.is_empty() {
            return;
        }
        debug!(session = self.name, count = unsent.len(), "Requeueing unwritten frames");
        for frame in unsent.into_iter().rev() {
            self.outbox.push_front(frame);
        }
    }

    fn flush_outbox(&mut self) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        let mut flushed = 0usize;
        while let Some(frame) = self.outbox.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
                self.outbox.push_front(frame);
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(session = self.name, flushed, "Flushed outbox");
        }
    }

    fn transition(&mut self, next: SessionState, notices: &mut Vec<SessionNotice>) {
        if self.state == next {
            return;
        }
        debug!(session = self.name, from = %self.state, to = %next, "Session state change");
        self.state = next;
        self.state_tx.send_replace(next);
        notices.push(SessionNotice::StateChanged(next));
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.shutdown.send(());
        }
    }
}

/// Drive one connection attempt until it closes or is shut down.
///
/// Returns the frames left unwritten when stopped through `shutdown`; when
/// the connection ends on its own they travel in the `Closed` event instead.
async fn run_link(
    transport: Arc<dyn PushTransport>,
    endpoint: String,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> Vec<OutboundFrame> {
    let connected = tokio::select! {
        result = transport.connect(&endpoint) => result,
        _ = &mut shutdown => return Vec::new(),
    };
    let mut link = match connected {
        Ok(link) => link,
        Err(e) => {
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: e.to_string(),
                unsent: Vec::new(),
            });
            return Vec::new();
        }
    };

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    if events.send(LinkEvent::Opened { generation, outbound }).is_err() {
        link.close().await;
        return Vec::new();
    }

    let mut unsent = Vec::new();
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                link.close().await;
                return drain_unsent(outbound_rx, unsent);
            }
            Some(frame) = outbound_rx.recv() => {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = link.send(text).await {
                    unsent.push(frame);
                    break e.to_string();
                }
            }
            incoming = link.recv() => match incoming {
                Some(Ok(text)) => {
                    if events.send(LinkEvent::Frame { generation, text }).is_err() {
                        link.close().await;
                        return Vec::new();
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "closed by remote".to_string(),
            },
        }
    };
    let unsent = drain_unsent(outbound_rx, unsent);
    let _ = events.send(LinkEvent::Closed {
        generation,
        reason,
        unsent,
    });
    Vec::new()
}

/// Stop accepting frames and collect the ones still buffered, in order
fn drain_unsent(
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut unsent: Vec<OutboundFrame>,
) -> Vec<OutboundFrame> {
    outbound_rx.close();
    while let Ok(frame) = outbound_rx.try_recv() {
        unsent.push(frame);
    }
    unsent
}
