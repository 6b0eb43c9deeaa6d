//! reqwest-backed `MessageApi`

use super::{ApiError, ApiResult, FetchResponse, MessageApi, SendResponse, SentReceipt, WireMessage};
use crate::config::ServerConfig;
use crate::core_channel::ProtocolError;
use crate::core_model::ConversationId;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// HTTP client carrying the session cookie and CSRF token of the logged-in user
pub fn build_client(server: &ServerConfig) -> ApiResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = &server.session_cookie {
        headers.insert(
            COOKIE,
            HeaderValue::from_str(cookie)
                .map_err(|e| ApiError::Http(format!("invalid cookie header value: {e}")))?,
        );
    }
    if let Some(token) = &server.csrf_token {
        headers.insert(
            "x-csrftoken",
            HeaderValue::from_str(token)
                .map_err(|e| ApiError::Http(format!("invalid CSRF token header value: {e}")))?,
        );
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(server.request_timeout)
        .build()
        .map_err(|e| ApiError::Http(format!("failed to build HTTP client: {e}")))
}

pub struct HttpMessageApi {
    client: reqwest::Client,
    server: ServerConfig,
}

impl HttpMessageApi {
    pub fn new(client: reqwest::Client, server: ServerConfig) -> Self {
        Self { client, server }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Http(format!("HTTP {}", status)));
        }
        response.json::<T>().await.map_err(|e| {
            warn!(error = %e, "Malformed server response");
            ApiError::Protocol(ProtocolError::Malformed(e.to_string()))
        })
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiResult<Vec<WireMessage>> {
        let url = self.server.fetch_url(conversation);
        debug!(%conversation, %url, "Fetching messages");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Self::read_json::<FetchResponse>(response).await?.into_result()
    }

    async fn send_message(&self, conversation: &ConversationId, content: &str) -> ApiResult<SentReceipt> {
        let url = self.server.send_url();
        let form = [("receiver_id", conversation.0.as_str()), ("content", content)];
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Self::read_json::<SendResponse>(response).await?.into_result()
    }
}
