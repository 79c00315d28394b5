//! Google Gemini provider (Generative Language REST API)

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::conversation::{Message, Role};
use crate::media::ImageInput;

use super::{non_empty, ProviderError};

pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    config: ModelConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn image(image: &ImageInput) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: image.mime_type.clone(),
                data: STANDARD.encode(&image.data),
            }),
            ..Default::default()
        }
    }
}

impl GeminiProvider {
    pub fn new(client: Client, base_url: String, api_key: String, config: ModelConfig) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
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
        let mut contents: Vec<Content> = history.iter().map(Content::from).collect();
        contents.push(Content {
            role: Some("user".into()),
            parts: vec![Part::text(text)],
        });
        self.send(self.build_request(contents)).await
    }

    pub async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, ProviderError> {
        let mut parts: Vec<Part> = images.iter().map(Part::image).collect();
        parts.push(Part::text(prompt));
        let contents = vec![Content {
            role: Some("user".into()),
            parts,
        }];
        self.send(self.build_request(contents)).await
    }

    fn build_request(&self, contents: Vec<Content>) -> GenerateContentRequest {
        let generation_config =
            if self.config.temperature.is_some() || self.config.max_output_tokens.is_some() {
                Some(GenerationConfig {
                    temperature: self.config.temperature,
                    max_output_tokens: self.config.max_output_tokens,
                })
            } else {
                None
            };

        GenerateContentRequest {
            contents,
            system_instruction: self.config.system_instruction.as_ref().map(|s| Content {
                role: None,
                parts: vec![Part::text(s.as_str())],
            }),
            generation_config,
        }
    }

    async fn send(
        &self,
        request: GenerateContentRequest,
    ) -> Result<Option<String>, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(ProviderError::Backend(error_resp.error.message));
            }
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        Ok(extract_text(parsed))
    }
}

impl From<&Message> for Content {
    fn from(msg: &Message) -> Self {
        Self {
            role: Some(
                match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                }
                .to_string(),
            ),
            parts: vec![Part::text(msg.content.as_str())],
        }
    }
}

/// Concatenate the text parts of the first candidate
fn extract_text(response: GenerateContentResponse) -> Option<String> {
    let content = response.candidates.into_iter().next()?.content?;
    let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
    non_empty(text)
}
