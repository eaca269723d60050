//! OpenAI-compatible chat completions client (Groq by default)

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{ChatMessage, Generator};
use crate::config::LlmConfig;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client
pub struct ChatClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: String,
}

impl ChatClient {
    /// Create a client from generation settings
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("generation API key required".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// System prompt, prior exchanges, then the new utterance
    fn build_messages(&self, utterance: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(utterance));
        messages
    }
}

/// Pull the reply text out of a completions response
fn extract_reply(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| Error::Generation("empty completion".to_string()))
}

#[async_trait]
impl Generator for ChatClient {
    async fn generate(&self, utterance: &str, history: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: self.build_messages(utterance, history),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        tracing::debug!(
            model = %self.model,
            history = history.len(),
            chars = utterance.len(),
            "requesting completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("API error {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("invalid response: {e}")))?;
        extract_reply(parsed)
    }
}
