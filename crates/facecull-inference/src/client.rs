//! Blocking HTTP client for the generation endpoint.

use crate::models::{self, ModelInfo};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use facecull_core::InferenceSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Returned in place of model text when a 200 response has no `response` field.
pub const EMPTY_RESPONSE_TEXT: &str = "No response generated";

const TAGS_PATH: &str = "/api/tags";

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success HTTP status; rendered the way the outcome text reports it.
    #[error("Error: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Sends an image and prompt to a vision-language model and returns its text.
pub trait InferenceClient: Send + Sync {
    fn infer(&self, image: &[u8], prompt: &str) -> Result<String, InferenceError>;
}

/// Numeric generation options sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl From<&InferenceSettings> for GenerationOptions {
    fn from(settings: &InferenceSettings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            frequency_penalty: settings.frequency_penalty,
            presence_penalty: settings.presence_penalty,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: [String; 1],
    options: &'a GenerationOptions,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// Client for an Ollama-compatible server.
pub struct OllamaClient {
    http: reqwest::blocking::Client,
    settings: InferenceSettings,
    options: GenerationOptions,
}

impl OllamaClient {
    pub fn new(settings: InferenceSettings) -> Result<Self, InferenceError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(settings.timeout_secs.map(Duration::from_secs))
            .build()
            .map_err(InferenceError::Client)?;
        let options = GenerationOptions::from(&settings);

        tracing::debug!(
            url = %settings.generate_url(),
            model = %settings.model,
            timeout_secs = ?settings.timeout_secs,
            "inference client ready"
        );

        Ok(Self {
            http,
            settings,
            options,
        })
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    /// Generate text for `image` with explicit options instead of the configured ones.
    pub fn infer_with(
        &self,
        image: &[u8],
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, InferenceError> {
        let url = self.settings.generate_url();
        let body = GenerateRequest {
            model: &self.settings.model,
            prompt,
            images: [BASE64.encode(image)],
            options,
            stream: false,
        };

        tracing::debug!(%url, model = %self.settings.model, image_bytes = image.len(), "sending generate request");

        let response = self.http.post(&url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            tracing::warn!(%url, status = status.as_u16(), %body, "generate request failed");
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text()?;
        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| InferenceError::Decode(e.to_string()))?;

        Ok(parsed
            .response
            .unwrap_or_else(|| EMPTY_RESPONSE_TEXT.to_string()))
    }

    /// List models installed on the server.
    pub fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = format!("{}{TAGS_PATH}", self.settings.base_url.trim_end_matches('/'));
        let response = self.http.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let text = response.text()?;
        let models = models::parse_tags(&text).map_err(|e| InferenceError::Decode(e.to_string()))?;
        tracing::debug!(%url, count = models.len(), "listed models");
        Ok(models)
    }

    /// Check that the server answers at its base URL.
    pub fn ping(&self) -> Result<(), InferenceError> {
        let response = self.http.get(&self.settings.base_url).send()?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(InferenceError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }
}

impl InferenceClient for OllamaClient {
    fn infer(&self, image: &[u8], prompt: &str) -> Result<String, InferenceError> {
        self.infer_with(image, prompt, &self.options)
    }
}
