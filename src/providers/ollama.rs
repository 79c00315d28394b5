//! Ollama provider implementation

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::conversation::{Message, Role};
use crate::media::ImageInput;

use super::{non_empty, ProviderError};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    config: ModelConfig,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

impl OllamaMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            images: Vec::new(),
        }
    }
}

impl OllamaProvider {
    pub fn new(client: Client, base_url: String, config: ModelConfig) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub async fn converse(
        &self,
        history: &[Message],
        text: &str,
    ) -> Result<Option<String>, ProviderError> {
        let mut messages = self.preamble();
        messages.extend(history.iter().map(|m| {
            OllamaMessage::new(
                match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                &m.content,
            )
        }));
        messages.push(OllamaMessage::new("user", text));
        self.chat(messages).await
    }

    pub async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, ProviderError> {
        let mut messages = self.preamble();
        let mut user = OllamaMessage::new("user", prompt);
        user.images = images.iter().map(|i| STANDARD.encode(&i.data)).collect();
        messages.push(user);
        self.chat(messages).await
    }

    fn preamble(&self) -> Vec<OllamaMessage> {
        self.config
            .system_instruction
            .iter()
            .map(|s| OllamaMessage::new("system", s))
            .collect()
    }

    fn build_request(&self, messages: Vec<OllamaMessage>) -> OllamaRequest {
        let options =
            if self.config.temperature.is_some() || self.config.max_output_tokens.is_some() {
                Some(OllamaOptions {
                    temperature: self.config.temperature,
                    num_predict: self.config.max_output_tokens,
                })
            } else {
                None
            };

        OllamaRequest {
            model: self.config.model.clone(),
            messages,
            stream: false,
            options,
        }
    }

    async fn chat(&self, messages: Vec<OllamaMessage>) -> Result<Option<String>, ProviderError> {
        let request = self.build_request(messages);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        let ollama_response: OllamaResponse = response.json().await?;

        Ok(non_empty(ollama_response.message.content))
    }
}
