//! AI provider integrations
//!
//! A provider turns a [`ModelConfig`] into something that can hold a chat
//! turn or answer a one-off multimodal prompt. Responses are optional: a
//! backend that produced no text, or only whitespace, returns `Ok(None)`
//! rather than an error.

mod gemini;
mod ollama;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use crate::config::{Config, ModelConfig};
use crate::conversation::Message;
use crate::media::ImageInput;

pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;

const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Error reported by the backend itself
    #[error("{0}")]
    Backend(String),
}

/// A connected generative model
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Model identifier, for logging
    fn name(&self) -> &str;

    /// One chat turn on top of `history`
    async fn converse(&self, history: &[Message], text: &str)
        -> Result<Option<String>, ProviderError>;

    /// Stateless prompt with images
    async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, ProviderError>;
}

/// Builds models from per-channel configuration
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn connect(&self, config: &ModelConfig)
        -> Result<Arc<dyn GenerativeModel>, ProviderError>;
}

pub enum Provider {
    Gemini(GeminiProvider),
    Ollama(OllamaProvider),
}

impl Provider {
    pub fn from_config(
        model: &ModelConfig,
        config: &Config,
        client: Client,
    ) -> Result<Self, ProviderError> {
        match model.provider.to_lowercase().as_str() {
            "gemini" | "google" => {
                let api_key = config
                    .gemini_api_key
                    .clone()
                    .ok_or_else(|| ProviderError::NotConfigured("GEMINI_API_KEY".into()))?;
                let base_url = config
                    .gemini_base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GEMINI_URL.into());
                Ok(Provider::Gemini(GeminiProvider::new(
                    client,
                    base_url,
                    api_key,
                    model.clone(),
                )))
            }
            "ollama" => {
                let url = config
                    .ollama_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OLLAMA_URL.into());
                Ok(Provider::Ollama(OllamaProvider::new(client, url, model.clone())))
            }
            _ => Err(ProviderError::UnknownProvider(model.provider.clone())),
        }
    }
}

#[async_trait]
impl GenerativeModel for Provider {
    fn name(&self) -> &str {
        match self {
            Provider::Gemini(p) => p.model(),
            Provider::Ollama(p) => p.model(),
        }
    }

    async fn converse(
        &self,
        history: &[Message],
        text: &str,
    ) -> Result<Option<String>, ProviderError> {
        match self {
            Provider::Gemini(p) => p.converse(history, text).await,
            Provider::Ollama(p) => p.converse(history, text).await,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, ProviderError> {
        match self {
            Provider::Gemini(p) => p.generate(prompt, images).await,
            Provider::Ollama(p) => p.generate(prompt, images).await,
        }
    }
}

/// Connector backed by the HTTP providers above
pub struct ProviderConnector {
    config: Config,
    client: Client,
}

impl ProviderConnector {
    pub fn new(config: Config) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ModelConnector for ProviderConnector {
    async fn connect(
        &self,
        config: &ModelConfig,
    ) -> Result<Arc<dyn GenerativeModel>, ProviderError> {
        let provider = Provider::from_config(config, &self.config, self.client.clone())?;
        tracing::info!(provider = %config.provider, model = %config.model, "Connected model");
        Ok(Arc::new(provider))
    }
}

/// Treat blank model output as no output
pub(crate) fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
