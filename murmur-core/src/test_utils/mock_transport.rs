//! In-process push transport
//!
//! Every successful `connect` produces a `MockRemote`, the server side of
//! that connection, which the test picks up with `accept`.

use super::async_helpers::{gate_open, TEST_TIMEOUT};
use crate::core_channel::{ChannelError, ChannelResult, PushLink, PushTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

enum Inbound {
    Frame(String),
    Close,
}

pub struct MockTransport {
    accepted_tx: mpsc::UnboundedSender<MockRemote>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRemote>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
            gate,
        })
    }

    /// Fail every following connection attempt
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Keep following connection attempts pending until released
    pub fn hold_connections(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_connections(&self) {
        self.gate.send_replace(true);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Endpoints connected to, in order
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Server side of the next established connection
    pub async fn accept(&self) -> MockRemote {
        let mut accepted = self.accepted_rx.lock().await;
        match tokio::time::timeout(TEST_TIMEOUT, accepted.recv()).await {
            Ok(Some(remote)) => remote,
            Ok(None) => panic!("mock transport dropped"),
            Err(_) => panic!("no connection attempt within {:?}", TEST_TIMEOUT),
        }
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, endpoint: &str) -> ChannelResult<Box<dyn PushLink>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.push(endpoint.to_string());
        }

        if !gate_open(&self.gate).await {
            return Err(ChannelError::ConnectFailed("transport gone".to_string()));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectFailed(format!("refused: {}", endpoint)));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let remote = MockRemote {
            endpoint: endpoint.to_string(),
            inbound: inbound_tx,
            outgoing: outgoing_rx,
        };
        self.accepted_tx
            .send(remote)
            .map_err(|_| ChannelError::ConnectFailed("nobody accepting".to_string()))?;

        Ok(Box::new(MockLink {
            inbound: inbound_rx,
            outgoing: outgoing_tx,
        }))
    }
}

/// Server end of one mock connection. Dropping it closes the connection.
pub struct MockRemote {
    endpoint: String,
    inbound: mpsc::UnboundedSender<Inbound>,
    outgoing: mpsc::UnboundedReceiver<String>,
}

impl MockRemote {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push a text frame to the client
    pub fn push(&self, text: &str) {
        let _ = self.inbound.send(Inbound::Frame(text.to_string()));
    }

    /// Close the connection from the server side
    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    /// Frames the client has written
    pub fn outgoing(&mut self) -> &mut mpsc::UnboundedReceiver<String> {
        &mut self.outgoing
    }
}

struct MockLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushLink for MockLink {
    async fn send(&mut self, text: String) -> ChannelResult<()> {
        // A remote that stopped reading is not a send failure
        let _ = self.outgoing.send(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelResult<String>> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(text)) => Some(Ok(text)),
            Some(Inbound::Close) | None => None,
        }
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
