//! WebSocket push transport on tokio-tungstenite

use super::transport::{ChannelError, ChannelResult, PushLink, PushTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Connects to `ws://` / `wss://` endpoints, attaching fixed headers
/// (session cookie, origin) to the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    headers: Vec<(String, String)>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, endpoint: &str) -> ChannelResult<Box<dyn PushLink>> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        debug!(endpoint, status = %response.status(), "WebSocket connected");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send(&mut self, text: String) -> ChannelResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ChannelResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by remote");
                    return None;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(ChannelError::Closed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}
