//! Application configuration

pub mod channels;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use channels::{ChannelsConfig, ConfigError, ModelConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: Option<String>,
    pub ollama_url: Option<String>,
    /// TOML file with per-channel model configuration
    pub channels_file: Option<PathBuf>,
    /// When set, outbound relay messages are POSTed here instead of kept in memory
    pub webhook_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            gemini_base_url: env::var("GEMINI_BASE_URL").ok(),
            ollama_url: env::var("OLLAMA_URL").ok(),
            channels_file: env::var("RELAY_CHANNELS_FILE").ok().map(PathBuf::from),
            webhook_url: env::var("RELAY_WEBHOOK_URL").ok(),
            request_timeout_secs: env::var("RELAY_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(120),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            gemini_api_key: None,
            gemini_base_url: None,
            ollama_url: None,
            channels_file: None,
            webhook_url: None,
            request_timeout_secs: 120,
        }
    }
}
