//! Minimal client for an OpenAI-compatible chat completions endpoint.

use std::time::Instant;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TutorConfig;

#[derive(Debug, Error)]
pub enum TutorClientError {
    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// API error (non-2xx response, empty choices)
    #[error("API error: {0}")]
    Api(String),

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant"
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    /// Model reported by the endpoint, falling back to the requested one
    pub model: String,
}

#[derive(Clone)]
pub struct TutorClient {
    http_client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl TutorClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: None,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &TutorConfig) -> Self {
        let client = Self::new(&config.base_url, &config.model);
        match &config.api_key {
            Some(key) => client.with_api_key(key),
            None => client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, messages: &[Message]) -> Result<ChatResponse, TutorClientError> {
        self.send(messages, None).await
    }

    /// Chat completion in JSON mode, deserialized into `T`.
    pub async fn chat_json<T: DeserializeOwned>(
        &self,
        messages: &[Message],
    ) -> Result<(T, ChatResponse), TutorClientError> {
        let response = self
            .send(messages, Some(json!({"type": "json_object"})))
            .await?;
        let parsed = serde_json::from_str(&response.content)
            .map_err(|e| TutorClientError::Parse(format!("Failed to deserialize response: {}", e)))?;
        Ok((parsed, response))
    }

    async fn send(
        &self,
        messages: &[Message],
        response_format: Option<Value>,
    ) -> Result<ChatResponse, TutorClientError> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages,
            response_format,
        };

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "tutor model request failed");
            TutorClientError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "tutor model API error");
            return Err(TutorClientError::Api(format!("{}: {}", status, error_text)));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| TutorClientError::Parse(e.to_string()))?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TutorClientError::Api("no choices in response".into()))?;

        debug!(
            model = %self.model,
            duration_ms = start.elapsed().as_millis() as u64,
            "tutor chat completion"
        );

        Ok(ChatResponse {
            content,
            model: raw.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}
