//! Metered advisory tier.
//!
//! Wraps an [`AdvisoryProvider`] with the daily quota gate, the rate governor
//! and a bounded retry policy. Whatever happens, the caller gets a decision:
//! either the provider's verdict or the fallback it handed in.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DecisionSource, Target};
use crate::external_deps::advisory::{AdvisoryError, AdvisoryProvider, AdvisoryRequest, AdvisoryVerdict};
use crate::modules::events::{CascadeEvent, EventDispatcher, RetryEvent};
use crate::modules::governor::RateGovernor;
use crate::modules::quota::QuotaTracker;

/// Exponential backoff with relative jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((nominal * factor).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    /// Characters of page content forwarded to the provider.
    pub excerpt_limit: usize,
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,
    /// Longest wait for a rate-governor token before giving up.
    #[serde(with = "millis")]
    pub token_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excerpt_limit: 1000,
            attempt_timeout: Duration::from_secs(8),
            token_wait: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoProvider,
    QuotaExhausted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Disabled => "advisory tier disabled",
            SkipReason::NoProvider => "no advisory provider configured",
            SkipReason::QuotaExhausted => "daily advisory quota at soft threshold",
        })
    }
}

/// Result of one advisory consultation.
#[derive(Debug)]
pub enum AdvisoryOutcome {
    Advised(Decision),
    Skipped {
        decision: Decision,
        reason: SkipReason,
    },
    Failed {
        decision: Decision,
        error: AdvisoryError,
        attempts: u32,
    },
}

impl AdvisoryOutcome {
    pub fn decision(&self) -> &Decision {
        match self {
            AdvisoryOutcome::Advised(decision)
            | AdvisoryOutcome::Skipped { decision, .. }
            | AdvisoryOutcome::Failed { decision, .. } => decision,
        }
    }

    pub fn into_decision(self) -> Decision {
        match self {
            AdvisoryOutcome::Advised(decision)
            | AdvisoryOutcome::Skipped { decision, .. }
            | AdvisoryOutcome::Failed { decision, .. } => decision,
        }
    }
}

/// First `limit` characters of `html`, cut on a char boundary.
pub fn excerpt(html: &str, limit: usize) -> &str {
    match html.char_indices().nth(limit) {
        Some((index, _)) => &html[..index],
        None => html,
    }
}

/// Quota- and governor-gated advisory caller.
#[derive(Clone)]
pub struct AdvisoryClient {
    provider: Option<Arc<dyn AdvisoryProvider>>,
    quota: QuotaTracker,
    governor: RateGovernor,
    config: AdvisoryConfig,
    events: EventDispatcher,
}

impl AdvisoryClient {
    pub fn new(quota: QuotaTracker, governor: RateGovernor) -> Self {
        Self {
            provider: None,
            quota,
            governor,
            config: AdvisoryConfig::default(),
            events: EventDispatcher::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn AdvisoryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_config(mut self, config: AdvisoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AdvisoryConfig {
        &self.config
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn is_available(&self) -> bool {
        self.config.enabled && self.provider.is_some()
    }

    pub async fn advise(&self, target: &Target, html: Option<&str>, fallback: Decision) -> AdvisoryOutcome {
        if !self.config.enabled {
            return AdvisoryOutcome::Skipped {
                decision: fallback,
                reason: SkipReason::Disabled,
            };
        }
        let Some(provider) = self.provider.as_ref() else {
            return AdvisoryOutcome::Skipped {
                decision: fallback,
                reason: SkipReason::NoProvider,
            };
        };
        let Some(reservation) = self.quota.reserve().await else {
            return AdvisoryOutcome::Skipped {
                decision: fallback,
                reason: SkipReason::QuotaExhausted,
            };
        };

        let mut request = AdvisoryRequest::new(target.url().as_str());
        if let Some(body) = html {
            request = request.with_excerpt(excerpt(body, self.config.excerpt_limit));
        }

        let (result, attempts) = self.call_with_retry(provider.as_ref(), target, &request).await;
        let decision = match result.and_then(|verdict| verdict_decision(target, verdict, &fallback)) {
            Ok(decision) => decision,
            Err(error) => {
                log::warn!(
                    "{} advisory failed for {}, using fallback: {error}",
                    provider.name(),
                    target.key()
                );
                if let Err(err) = reservation.release().await {
                    log::warn!("advisory quota slot not released: {err}");
                }
                return AdvisoryOutcome::Failed {
                    decision: fallback,
                    error,
                    attempts,
                };
            }
        };

        match reservation.commit().await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "advisory quota ceiling reached, discarding {} verdict for {}",
                    provider.name(),
                    target.key()
                );
                return AdvisoryOutcome::Failed {
                    decision: fallback,
                    error: AdvisoryError::QuotaExceeded,
                    attempts,
                };
            }
            Err(err) => log::warn!("advisory quota not recorded: {err}"),
        }

        log::info!(
            "{} advised {} for {} ({:.2})",
            provider.name(),
            decision.method(),
            target.key(),
            decision.confidence()
        );
        AdvisoryOutcome::Advised(decision)
    }

    async fn call_with_retry(
        &self,
        provider: &dyn AdvisoryProvider,
        target: &Target,
        request: &AdvisoryRequest,
    ) -> (Result<AdvisoryVerdict, AdvisoryError>, u32) {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;

            if !self
                .governor
                .wait_for_token(target.key(), 1.0, self.config.token_wait)
                .await
            {
                return (Err(AdvisoryError::RateLimited), attempt);
            }

            let result = match tokio::time::timeout(self.config.attempt_timeout, provider.advise(request)).await {
                Ok(result) => result,
                Err(_) => Err(AdvisoryError::Timeout(self.config.attempt_timeout)),
            };

            match result {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    self.events.dispatch(CascadeEvent::Retry(RetryEvent {
                        target_key: target.key().to_string(),
                        attempt: attempt + 1,
                        reason: err.to_string(),
                        scheduled_after: delay,
                        timestamp: Utc::now(),
                    }));
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

impl fmt::Debug for AdvisoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisoryClient")
            .field("provider", &self.provider.as_ref().map(|p| p.name()))
            .field("config", &self.config)
            .finish()
    }
}

fn verdict_decision(
    target: &Target,
    verdict: AdvisoryVerdict,
    fallback: &Decision,
) -> Result<Decision, AdvisoryError> {
    let bypass = if verdict.bypass_strategies.is_empty() {
        fallback.bypass_strategies().to_vec()
    } else {
        verdict.bypass_strategies
    };
    let protections = verdict
        .anti_bot_detected
        .into_iter()
        .chain(fallback.detected_protections().iter().cloned());

    Decision::new(
        target.key(),
        verdict.recommended_method,
        verdict.confidence,
        DecisionSource::Advisory,
    )
    .map(|decision| {
        decision
            .with_reasoning(verdict.reasoning)
            .with_protections(protections)
            .with_bypass_strategies(bypass)
    })
    .map_err(|err| AdvisoryError::Malformed(err.to_string()))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
