use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external_deps::advisory::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
use crate::modules::cache::DEFAULT_CACHE_TTL;
use crate::modules::governor::DEFAULT_BASE_RATE;
use crate::modules::quota::{DEFAULT_DAILY_LIMIT, DEFAULT_SOFT_RATIO};
use crate::tiers::advisory::AdvisoryConfig;
use crate::tiers::classifier::DEFAULT_ACCEPT_THRESHOLD;
use crate::tiers::rules::RuleConfig;

pub const ENV_MODEL_PATH: &str = "SCRAPE_ROUTER_MODEL_PATH";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_ADVISORY_DAILY_LIMIT: &str = "SCRAPE_ROUTER_ADVISORY_DAILY_LIMIT";
pub const ENV_BASE_RATE: &str = "SCRAPE_ROUTER_BASE_RATE";
pub const ENV_STORE_PATH: &str = "SCRAPE_ROUTER_STORE_PATH";

pub const DEFAULT_MAX_HTML_BYTES: usize = 2 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings are not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {name} has invalid value `{value}`")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tier toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub cache: bool,
    pub rules: bool,
    pub classifier: bool,
    pub advisory: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            cache: true,
            rules: true,
            classifier: true,
            advisory: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    /// redb database file; in-memory store when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Model artifact; the bundled model when unset.
    pub model_path: Option<PathBuf>,
    pub accept_threshold: f64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorySettings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub daily_limit: u64,
    pub soft_ratio: f64,
    #[serde(flatten)]
    pub client: AdvisoryConfig,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            daily_limit: DEFAULT_DAILY_LIMIT,
            soft_ratio: DEFAULT_SOFT_RATIO,
            client: AdvisoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    /// Requests per second each domain starts with.
    pub base_rate: f64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            base_rate: DEFAULT_BASE_RATE,
        }
    }
}

/// Complete router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub cache: CacheSettings,
    pub rules: RuleConfig,
    pub classifier: ClassifierSettings,
    pub advisory: AdvisorySettings,
    pub governor: GovernorSettings,
    pub features: FeatureFlags,
    /// Page content beyond this many bytes is ignored.
    pub max_html_bytes: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            rules: RuleConfig::default(),
            classifier: ClassifierSettings::default(),
            advisory: AdvisorySettings::default(),
            governor: GovernorSettings::default(),
            features: FeatureFlags::default(),
            max_html_bytes: DEFAULT_MAX_HTML_BYTES,
        }
    }
}

impl RouterSettings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source, then re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(path) = read(ENV_MODEL_PATH) {
            self.classifier.model_path = Some(PathBuf::from(path));
        }
        if let Some(key) = read(ENV_GEMINI_API_KEY) {
            self.advisory.api_key = Some(key);
        }
        if let Some(raw) = read(ENV_ADVISORY_DAILY_LIMIT) {
            self.advisory.daily_limit = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_ADVISORY_DAILY_LIMIT,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = read(ENV_BASE_RATE) {
            self.governor.base_rate = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_BASE_RATE,
                value: raw.clone(),
            })?;
        }
        if let Some(path) = read(ENV_STORE_PATH) {
            self.cache.store_path = Some(PathBuf::from(path));
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        let unit = |value: f64| value.is_finite() && (0.0..=1.0).contains(&value);

        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be positive"));
        }
        if self.rules.low_script_threshold > self.rules.high_script_threshold {
            return Err(invalid(
                "rules.low_script_threshold",
                "must not exceed rules.high_script_threshold",
            ));
        }
        if !unit(self.classifier.accept_threshold) {
            return Err(invalid("classifier.accept_threshold", "must be within [0, 1]"));
        }
        if self.advisory.daily_limit == 0 {
            return Err(invalid("advisory.daily_limit", "must be positive"));
        }
        if !unit(self.advisory.soft_ratio) || self.advisory.soft_ratio == 0.0 {
            return Err(invalid("advisory.soft_ratio", "must be within (0, 1]"));
        }
        if self.advisory.client.excerpt_limit == 0 {
            return Err(invalid("advisory.excerpt_limit", "must be positive"));
        }
        if self.advisory.client.attempt_timeout.is_zero() {
            return Err(invalid("advisory.attempt_timeout", "must be positive"));
        }
        let retry = &self.advisory.client.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("advisory.retry.max_attempts", "must be at least 1"));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(invalid("advisory.retry.multiplier", "must be at least 1"));
        }
        if !unit(retry.jitter) {
            return Err(invalid("advisory.retry.jitter", "must be within [0, 1]"));
        }
        if !self.governor.base_rate.is_finite() || self.governor.base_rate <= 0.0 {
            return Err(invalid("governor.base_rate", "must be a positive number"));
        }
        if self.max_html_bytes == 0 {
            return Err(invalid("max_html_bytes", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let settings = RouterSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.advisory.daily_limit, 1500);
        assert_eq!(settings.advisory.client.excerpt_limit, 1000);
        assert_eq!(settings.rules.high_script_threshold, 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = RouterSettings::from_json_str(
            r#"{
                "cache": {"ttl_secs": 600},
                "advisory": {"daily_limit": 200, "attempt_timeout": 2000, "retry": {"max_attempts": 3}},
                "features": {"advisory": false}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.cache.ttl_secs, 600);
        assert_eq!(settings.advisory.daily_limit, 200);
        assert_eq!(settings.advisory.client.attempt_timeout, Duration::from_secs(2));
        assert_eq!(settings.advisory.client.retry.max_attempts, 3);
        assert_eq!(settings.advisory.client.retry.base_delay, Duration::from_millis(250));
        assert!(!settings.features.advisory);
        assert!(settings.features.classifier);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_GEMINI_API_KEY, "secret"),
            (ENV_ADVISORY_DAILY_LIMIT, " 900 "),
            (ENV_BASE_RATE, "2.5"),
            (ENV_STORE_PATH, "/var/lib/router.redb"),
        ]);
        let mut settings = RouterSettings::default();
        settings
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.advisory.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.advisory.daily_limit, 900);
        assert_eq!(settings.governor.base_rate, 2.5);
        assert_eq!(settings.cache.store_path, Some(PathBuf::from("/var/lib/router.redb")));
    }

    #[test]
    fn rejects_bad_values() {
        let mut settings = RouterSettings::default();
        let err = settings
            .apply_overrides(|name| (name == ENV_BASE_RATE).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: ENV_BASE_RATE, .. }));

        assert!(matches!(
            RouterSettings::from_json_str(r#"{"classifier": {"accept_threshold": 1.5}}"#),
            Err(ConfigError::Invalid { field: "classifier.accept_threshold", .. })
        ));
        assert!(matches!(
            RouterSettings::from_json_str(r#"{"rules": {"low_script_threshold": 20}}"#),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut settings = RouterSettings::default();
        settings.advisory.api_key = Some("secret".into());
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("secret"));
    }
}
