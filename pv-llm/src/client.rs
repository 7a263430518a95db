use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, StreamChunk};
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    model: String,
    api_base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str, api_base_url: &str) -> Self {
        // No overall timeout: a streamed reply may legitimately run for minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, messages = messages.len()))]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("no messages to send".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is empty".to_string()));
        }
        let c = OpenAiClient::new(
            self.client.clone(),
            &self.api_key,
            &self.model,
            &self.api_base_url,
        );
        c.chat_stream(messages).await
    }
}
