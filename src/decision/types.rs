//! Decision records produced by every tier of the cascade.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Fetch strategies the cascade can recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Http,
    #[serde(alias = "playwright", alias = "puppeteer")]
    Rendered,
    Stealth,
    #[serde(alias = "tor")]
    AnonymizedNetwork,
    #[serde(alias = "proxy")]
    Proxied,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Http,
        Method::Rendered,
        Method::Stealth,
        Method::AnonymizedNetwork,
        Method::Proxied,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Http => "http",
            Method::Rendered => "rendered",
            Method::Stealth => "stealth",
            Method::AnonymizedNetwork => "anonymized_network",
            Method::Proxied => "proxied",
        }
    }

    /// Methods to try, in order, when this one fails at fetch time.
    pub fn fallback_chain(self) -> [Method; 2] {
        match self {
            Method::Http => [Method::Rendered, Method::Stealth],
            Method::Rendered => [Method::Stealth, Method::AnonymizedNetwork],
            Method::Stealth => [Method::AnonymizedNetwork, Method::Proxied],
            Method::AnonymizedNetwork => [Method::Proxied, Method::Stealth],
            Method::Proxied => [Method::AnonymizedNetwork, Method::Stealth],
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier that produced (or served) a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Cache,
    Rule,
    Classifier,
    Advisory,
    /// Default strategy used when no classifier is configured.
    Fallback,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Cache => "cache",
            DecisionSource::Rule => "rule",
            DecisionSource::Classifier => "classifier",
            DecisionSource::Advisory => "advisory",
            DecisionSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed input rejected before it reaches any tier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("url `{0}` has no host")]
    MissingHost(String),
    #[error("feature vector has {actual} values, schema expects {expected}")]
    FeatureLength { expected: usize, actual: usize },
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("decision target key is empty")]
    EmptyTargetKey,
}

/// A parsed request URL together with its cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
    host: String,
    key: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let url = Url::parse(raw.trim()).map_err(|err| ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .map(|host| host.trim_end_matches('.').to_lowercase())
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ValidationError::MissingHost(raw.to_string()))?;

        // `Url::port` is `None` when the port is the scheme default.
        let key = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        Ok(Self { url, host, key })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Normalized host identity shared by every path on the site.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Host without the port suffix.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Immutable strategy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DecisionRecord")]
pub struct Decision {
    target_key: String,
    method: Method,
    confidence: f64,
    reasoning: String,
    detected_protections: Vec<String>,
    bypass_strategies: Vec<String>,
    source: DecisionSource,
    decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        target_key: impl Into<String>,
        method: Method,
        confidence: f64,
        source: DecisionSource,
    ) -> Result<Self, ValidationError> {
        let target_key = target_key.into();
        if target_key.is_empty() {
            return Err(ValidationError::EmptyTargetKey);
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }

        Ok(Self {
            target_key,
            method,
            confidence,
            reasoning: String::new(),
            detected_protections: Vec::new(),
            bypass_strategies: Vec::new(),
            source,
            decided_at: Utc::now(),
        })
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_protections<I, S>(mut self, protections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detected_protections = dedup(protections.into_iter().map(Into::into));
        self
    }

    pub fn with_bypass_strategies<I, S>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass_strategies = dedup(strategies.into_iter().map(Into::into));
        self
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn detected_protections(&self) -> &[String] {
        &self.detected_protections
    }

    pub fn bypass_strategies(&self) -> &[String] {
        &self.bypass_strategies
    }

    pub fn source(&self) -> DecisionSource {
        self.source
    }

    /// Methods to escalate to, in order, if the chosen one fails downstream.
    pub fn fallback_methods(&self) -> [Method; 2] {
        self.method.fallback_chain()
    }

    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[derive(Deserialize)]
struct DecisionRecord {
    target_key: String,
    method: Method,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    detected_protections: Vec<String>,
    #[serde(default)]
    bypass_strategies: Vec<String>,
    source: DecisionSource,
    decided_at: DateTime<Utc>,
}

impl TryFrom<DecisionRecord> for Decision {
    type Error = ValidationError;

    fn try_from(record: DecisionRecord) -> Result<Self, Self::Error> {
        let mut decision = Decision::new(
            record.target_key,
            record.method,
            record.confidence,
            record.source,
        )?;
        decision.reasoning = record.reasoning;
        decision.detected_protections = record.detected_protections;
        decision.bypass_strategies = record.bypass_strategies;
        decision.decided_at = record.decided_at;
        Ok(decision)
    }
}
