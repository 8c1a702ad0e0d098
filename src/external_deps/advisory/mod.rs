//! External advisory providers.
//!
//! An advisory provider is a remote service that looks at a URL and a page
//! excerpt and recommends a fetch method. The cascade treats every provider as
//! costly and unreliable: calls are metered, bounded in time and retried only
//! for transient failures.

mod gemini;

pub use gemini::{DEFAULT_ENDPOINT, DEFAULT_MODEL, GeminiConfig, GeminiProvider};

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decision::Method;

/// Data sent to a provider for one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryRequest {
    pub url: String,
    pub excerpt: Option<String>,
    pub methods: Vec<Method>,
}

impl AdvisoryRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            excerpt: None,
            methods: Method::ALL.to_vec(),
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }

    /// Prompt text asking for a JSON verdict.
    pub fn prompt(&self) -> String {
        let methods: Vec<&str> = self.methods.iter().map(|m| m.as_str()).collect();
        format!(
            "Analyze this URL for web scraping. Return ONLY valid JSON.\n\n\
             URL: {url}\n\
             HTML: {html}\n\n\
             Available methods: {methods}\n\n\
             JSON format:\n\
             {{\n  \"recommended_method\": \"method_name\",\n  \"confidence\": 0.0-1.0,\n  \
             \"reasoning\": \"brief explanation\",\n  \"anti_bot_detected\": [\"list\"],\n  \
             \"bypass_strategies\": [\"list\"]\n}}",
            url = self.url,
            html = self.excerpt.as_deref().unwrap_or("Not provided"),
            methods = methods.join(", "),
        )
    }
}

/// Parsed provider recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryVerdict {
    pub recommended_method: Method,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub anti_bot_detected: Vec<String>,
    #[serde(default)]
    pub bypass_strategies: Vec<String>,
}

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{.*\}").unwrap_or_else(|err| panic!("invalid verdict regex: {err}"))
});

impl AdvisoryVerdict {
    /// Extract and validate the JSON object embedded in free model text.
    pub fn from_model_text(text: &str) -> Result<Self, AdvisoryError> {
        let object = JSON_OBJECT
            .find(text)
            .ok_or_else(|| AdvisoryError::Malformed("response contains no json object".into()))?;
        let verdict: AdvisoryVerdict = serde_json::from_str(object.as_str())
            .map_err(|err| AdvisoryError::Malformed(err.to_string()))?;
        if !verdict.confidence.is_finite() || !(0.0..=1.0).contains(&verdict.confidence) {
            return Err(AdvisoryError::Malformed(format!(
                "confidence {} is outside [0, 1]",
                verdict.confidence
            )));
        }
        Ok(verdict)
    }
}

/// Errors surfaced by advisory providers.
#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory provider misconfigured: {0}")]
    Configuration(String),
    #[error("advisory transport failed: {0}")]
    Transport(String),
    #[error("advisory call timed out after {0:?}")]
    Timeout(Duration),
    #[error("advisory provider returned status {status}")]
    Status { status: u16, body: String },
    #[error("advisory response malformed: {0}")]
    Malformed(String),
    #[error("no rate-limit token for the advisory call")]
    RateLimited,
    #[error("daily advisory quota exhausted")]
    QuotaExceeded,
}

impl AdvisoryError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdvisoryError::Transport(_) | AdvisoryError::Timeout(_) => true,
            AdvisoryError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Shared interface implemented by advisory vendors.
#[async_trait]
pub trait AdvisoryProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryVerdict, AdvisoryError>;
}
