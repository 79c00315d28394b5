//! Per-channel model configuration loaded from TOML files
//!
//! Each channel key maps to a [`ModelConfig`] describing which generative
//! backend answers messages posted to that channel. Keys without an entry
//! fall back to the optional `[default]` table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Applied to channel keys that have no explicit entry
    #[serde(default)]
    pub default: Option<ModelConfig>,

    /// Model configuration per channel key
    #[serde(default)]
    pub channels: HashMap<String, ModelConfig>,
}

impl ChannelsConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: ChannelsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let entries = self
            .channels
            .iter()
            .map(|(key, model)| (key.as_str(), model))
            .chain(self.default.iter().map(|model| ("default", model)));

        for (key, model) in entries {
            if model.model.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "channel '{}' has an empty model name",
                    key
                )));
            }
            if let Some(t) = model.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::Validation(format!(
                        "channel '{}' temperature {} outside 0.0..=2.0",
                        key, t
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Model selection and generation parameters for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name: "gemini", "ollama"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use (provider-specific)
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_output_tokens: Option<u32>,

    /// System instruction sent with every request
    #[serde(default)]
    pub system_instruction: Option<String>,
}

fn default_provider() -> String {
    "gemini".to_string()
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
            system_instruction: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
