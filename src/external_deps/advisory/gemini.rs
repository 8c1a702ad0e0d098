use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{AdvisoryError, AdvisoryProvider, AdvisoryRequest, AdvisoryVerdict};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Transport-level cap; the advisory client applies its own deadline.
    pub request_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            max_output_tokens: 500,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Google Gemini `generateContent` adapter.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    api_key: String,
    config: GeminiConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, AdvisoryError> {
        Self::with_config(api_key, GeminiConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: GeminiConfig) -> Result<Self, AdvisoryError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AdvisoryError::Configuration("gemini api key is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| AdvisoryError::Configuration(err.to_string()))?;
        Ok(Self {
            api_key,
            config,
            client,
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl AdvisoryProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryVerdict, AdvisoryError> {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": request.prompt()}]}],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_output_tokens,
            }
        });

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AdvisoryError::Timeout(self.config.request_timeout)
                } else {
                    AdvisoryError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdvisoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AdvisoryError::Malformed(err.to_string()))?;
        let text = payload
            .candidates
            .first()
            .and_then(|candidate| candidate.content.parts.first())
            .map(|part| part.text.as_str())
            .ok_or_else(|| AdvisoryError::Malformed("response has no candidates".into()))?;

        AdvisoryVerdict::from_model_text(text)
    }
}
