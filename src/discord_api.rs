//! Outbound webhook calls used to answer a deferred interaction.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use thiserror::Error;

use crate::config::DEFAULT_API_BASE_URL;

const USER_AGENT: &str = concat!("discord-relay/", env!("CARGO_PKG_VERSION"));

/// Errors returned by the interaction webhook API.
#[derive(Debug, Error)]
pub enum DiscordApiError {
    /// The API answered with a non-success status.
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The request never got a response.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Body for editing the original response or posting a follow-up.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MessageParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl MessageParams {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
        }
    }
}

/// Responds to an interaction after the deferred acknowledgement.
#[async_trait]
pub trait InteractionResponder: Send + Sync {
    async fn edit_original(
        &self,
        application_id: &str,
        token: &str,
        params: &MessageParams,
    ) -> Result<(), DiscordApiError>;

    async fn create_followup(
        &self,
        application_id: &str,
        token: &str,
        params: &MessageParams,
    ) -> Result<(), DiscordApiError>;
}

/// HTTP implementation against the platform REST API.
///
/// Interaction webhooks are authorised by the token in the path, so no bot
/// credentials are needed.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    client: Client,
    base_url: String,
}

impl DiscordClient {
    /// Create a client. `base_url` defaults to the public v10 API.
    pub fn new(base_url: Option<&str>) -> Result<Self, DiscordApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        let base_url = base_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self { client, base_url })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &MessageParams,
    ) -> Result<(), DiscordApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.request(method, &url).json(params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DiscordApiError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl InteractionResponder for DiscordClient {
    async fn edit_original(
        &self,
        application_id: &str,
        token: &str,
        params: &MessageParams,
    ) -> Result<(), DiscordApiError> {
        let path = format!("/webhooks/{application_id}/{token}/messages/@original");
        self.send(Method::PATCH, &path, params).await
    }

    async fn create_followup(
        &self,
        application_id: &str,
        token: &str,
        params: &MessageParams,
    ) -> Result<(), DiscordApiError> {
        let path = format!("/webhooks/{application_id}/{token}");
        self.send(Method::POST, &path, params).await
    }
}
