//! Deterministic rule tier.
//!
//! Cheap heuristics that settle the common case without any model: known
//! static domains, unprotected pages with little script, and script-heavy
//! pages that need rendering.

use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DecisionSource, Method, Target, ValidationError};
use crate::detectors::{PageProfile, ProtectionDetector};

/// Pluggable rule tier.
pub trait RuleSet: Send + Sync {
    /// A final decision, or `None` to hand the request to the next tier.
    fn evaluate(&self, target: &Target, page: Option<&PageProfile>) -> Option<Decision>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Hosts served over plain HTTP, matched on the host or any subdomain.
    pub allow_list: Vec<String>,
    pub low_script_threshold: usize,
    pub high_script_threshold: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            allow_list: ["wikipedia.org", "github.com", "archive.org", "stackoverflow.com"]
                .into_iter()
                .map(String::from)
                .collect(),
            low_script_threshold: 3,
            high_script_threshold: 10,
        }
    }
}

pub const ALLOW_LIST_CONFIDENCE: f64 = 0.90;
pub const STATIC_PAGE_CONFIDENCE: f64 = 0.85;
pub const SCRIPTED_PAGE_CONFIDENCE: f64 = 0.80;

/// Default rule engine.
#[derive(Debug, Clone, Default)]
pub struct DefaultRuleEngine {
    config: RuleConfig,
}

impl DefaultRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RuleConfig) -> Self {
        let allow_list = config
            .allow_list
            .iter()
            .map(|entry| entry.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self {
            config: RuleConfig { allow_list, ..config },
        }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    fn is_allow_listed(&self, host: &str) -> bool {
        self.config.allow_list.iter().any(|entry| {
            host == entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Profile raw html and evaluate it.
    pub fn evaluate_html(&self, target: &Target, html: Option<&str>) -> Option<Decision> {
        let profile = html.map(|body| ProtectionDetector::new().profile(body));
        self.evaluate(target, profile.as_ref())
    }

    fn decide(
        target: &Target,
        method: Method,
        confidence: f64,
        reasoning: &str,
    ) -> Result<Decision, ValidationError> {
        Decision::new(target.key(), method, confidence, DecisionSource::Rule)
            .map(|decision| decision.with_reasoning(reasoning))
    }
}

impl RuleSet for DefaultRuleEngine {
    fn evaluate(&self, target: &Target, page: Option<&PageProfile>) -> Option<Decision> {
        let outcome = if self.is_allow_listed(target.host()) {
            Self::decide(target, Method::Http, ALLOW_LIST_CONFIDENCE, "known simple domain")
        } else {
            let page = page?;
            if page.is_protected() {
                log::debug!(
                    "rules deferring {}: protections {:?}",
                    target.key(),
                    page.protection_names()
                );
                return None;
            }

            if page.script_count < self.config.low_script_threshold {
                Self::decide(
                    target,
                    Method::Http,
                    STATIC_PAGE_CONFIDENCE,
                    "simple static html, no anti-bot detected",
                )
            } else if page.script_count > self.config.high_script_threshold {
                Self::decide(
                    target,
                    Method::Rendered,
                    SCRIPTED_PAGE_CONFIDENCE,
                    "javascript-heavy page, no protection detected",
                )
                .map(|decision| decision.with_bypass_strategies(["enable_javascript"]))
            } else {
                return None;
            }
        };

        match outcome {
            Ok(decision) => Some(decision),
            Err(err) => {
                log::warn!("rule decision rejected for {}: {err}", target.key());
                None
            }
        }
    }
}
