//! Transport seam for the push channel
//!
//! `PushTransport` establishes a connection, `PushLink` is one established
//! connection carrying JSON text frames. The WebSocket implementation lives in
//! `ws`; tests plug in `test_utils::MockTransport`.

use async_trait::async_trait;
use thiserror::Error;

/// Connection-level failure; recovered by retry or fallback, never surfaced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("channel has failed over to fallback")]
    FailedOver,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, endpoint: &str) -> ChannelResult<Box<dyn PushLink>>;
}

#[async_trait]
pub trait PushLink: Send {
    async fn send(&mut self, text: String) -> ChannelResult<()>;

    /// Next text frame. `None` once the remote has closed the connection.
    /// Must be cancel safe.
    async fn recv(&mut self) -> Option<ChannelResult<String>>;

    async fn close(&mut self);
}
