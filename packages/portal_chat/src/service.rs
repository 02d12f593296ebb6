//! Request/response data service: session history and the fallback send.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::ChatError;
use crate::types::{SendMessageResponse, Session, SessionId, SessionPage};

/// Session and message persistence, consumed by the coordinator.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// First page of the caller's sessions, most recent first.
    async fn list_sessions(&self) -> Result<SessionPage, ChatError>;

    async fn create_session(&self, title: &str) -> Result<Session, ChatError>;

    /// Full session including its message history.
    async fn get_session(&self, id: SessionId) -> Result<Session, ChatError>;

    /// Fallback send. Returns the stored user message and the generated reply.
    async fn send_message(
        &self,
        id: SessionId,
        content: &str,
    ) -> Result<SendMessageResponse, ChatError>;

    async fn end_session(&self, id: SessionId) -> Result<(), ChatError>;
}

/// [`ChatService`] over the portal's REST API.
pub struct HttpChatService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpChatService {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("portal-chat/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/chat/{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(%method, url = %url, "chat api request");
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, format!("Token {token}")),
            None => builder,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ChatError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ChatService for HttpChatService {
    async fn list_sessions(&self) -> Result<SessionPage, ChatError> {
        self.execute(self.request(Method::GET, "sessions/")).await
    }

    async fn create_session(&self, title: &str) -> Result<Session, ChatError> {
        self.execute(
            self.request(Method::POST, "sessions/")
                .json(&json!({ "title": title })),
        )
        .await
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, ChatError> {
        self.execute(self.request(Method::GET, &format!("sessions/{id}/")))
            .await
    }

    async fn send_message(
        &self,
        id: SessionId,
        content: &str,
    ) -> Result<SendMessageResponse, ChatError> {
        self.execute(
            self.request(Method::POST, &format!("sessions/{id}/send_message/"))
                .json(&json!({ "content": content })),
        )
        .await
    }

    async fn end_session(&self, id: SessionId) -> Result<(), ChatError> {
        let _: serde_json::Value = self
            .execute(self.request(Method::POST, &format!("sessions/{id}/end_session/")))
            .await?;
        Ok(())
    }
}

/// Build an [`ChatError::Api`] from a failed response, preferring the
/// `error` / `detail` field the backend puts in JSON error bodies.
fn api_error(status: StatusCode, body: &str) -> ChatError {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "detail"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_owned))
        });
    let message = from_json
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    ChatError::Api {
        status: status.as_u16(),
        message,
    }
}
