//! Cascade orchestration.
//!
//! Wires the strategy cache, rule engine, local classifier and advisory client
//! into one request path: cache, rules, classifier, advisory, then a write
//! back to the cache. Every request ends with exactly one decision from
//! exactly one tier.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;

use crate::config::{ConfigError, FeatureFlags, RouterSettings};
use crate::decision::{Decision, DecisionSource, FEATURE_COUNT, FeatureVector, Method, Target, ValidationError};
use crate::detectors::{ProtectionDetector, bypass_plan};
use crate::external_deps::advisory::{AdvisoryError, AdvisoryProvider, GeminiConfig, GeminiProvider};
use crate::modules::cache::{DecisionError, StrategyCache};
use crate::modules::events::{
	AdvisoryFailedEvent, AdvisorySkippedEvent, CacheHitEvent, CascadeEvent, DecidedEvent,
	EventDispatcher, EventHandler, LoggingHandler, StoreDegradedEvent,
};
use crate::modules::governor::RateGovernor;
use crate::modules::metrics::{CascadeStatistics, UsageStatistics};
use crate::modules::quota::QuotaTracker;
use crate::modules::store::{MemoryStore, RedbStore, StoreError, StrategyStore};
use crate::tiers::advisory::{AdvisoryClient, AdvisoryConfig, AdvisoryOutcome};
use crate::tiers::classifier::{LocalClassifier, ModelError, StrategyModel};
use crate::tiers::rules::{DefaultRuleEngine, RuleSet};

/// Result alias used across the orchestration layer.
pub type RouterResult<T> = Result<T, RouterError>;

/// High-level error surfaced by the router.
#[derive(Debug, Error)]
pub enum RouterError {
	#[error("invalid input: {0}")]
	Validation(#[from] ValidationError),
	#[error("strategy model unavailable: {0}")]
	Model(#[from] ModelError),
	#[error("invalid configuration: {0}")]
	Config(#[from] ConfigError),
	#[error("store error: {0}")]
	Store(#[from] StoreError),
	#[error("cache error: {0}")]
	Decision(#[from] DecisionError),
	#[error("advisory provider setup failed: {0}")]
	Advisory(#[from] AdvisoryError),
	#[error("request cancelled")]
	Cancelled,
}

/// A decision together with the tier that answered the request.
///
/// `served_by` is [`DecisionSource::Cache`] on a hit, while the decision keeps
/// the source of the tier that originally produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
	pub decision: Decision,
	pub served_by: DecisionSource,
}

/// Fluent builder for [`StrategyRouter`].
pub struct StrategyRouterBuilder {
	settings: RouterSettings,
	store: Option<Arc<dyn StrategyStore>>,
	rules: Option<Arc<dyn RuleSet>>,
	model: Option<Arc<dyn StrategyModel>>,
	provider: Option<Arc<dyn AdvisoryProvider>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	log_events: bool,
}

impl StrategyRouterBuilder {
	pub fn new() -> Self {
		Self {
			settings: RouterSettings::default(),
			store: None,
			rules: None,
			model: None,
			provider: None,
			handlers: Vec::new(),
			log_events: true,
		}
	}

	pub fn with_settings(mut self, settings: RouterSettings) -> Self {
		self.settings = settings;
		self
	}

	/// Backend shared with other router instances.
	pub fn with_store(mut self, store: Arc<dyn StrategyStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_rules(mut self, rules: Arc<dyn RuleSet>) -> Self {
		self.rules = Some(rules);
		self
	}

	pub fn with_model(mut self, model: Arc<dyn StrategyModel>) -> Self {
		self.model = Some(model);
		self
	}

	pub fn with_advisory_provider(mut self, provider: Arc<dyn AdvisoryProvider>) -> Self {
		self.provider = Some(provider);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_advisory_daily_limit(mut self, limit: u64) -> Self {
		self.settings.advisory.daily_limit = limit;
		self
	}

	pub fn with_base_rate(mut self, base_rate: f64) -> Self {
		self.settings.governor.base_rate = base_rate;
		self
	}

	pub fn with_advisory_config(mut self, config: AdvisoryConfig) -> Self {
		self.settings.advisory.client = config;
		self
	}

	pub fn disable_cache(mut self) -> Self {
		self.settings.features.cache = false;
		self
	}

	pub fn disable_rules(mut self) -> Self {
		self.settings.features.rules = false;
		self
	}

	pub fn disable_classifier(mut self) -> Self {
		self.settings.features.classifier = false;
		self
	}

	pub fn disable_advisory(mut self) -> Self {
		self.settings.features.advisory = false;
		self
	}

	pub fn disable_event_logging(mut self) -> Self {
		self.log_events = false;
		self
	}

	pub fn build(self) -> RouterResult<StrategyRouter> {
		StrategyRouter::from_parts(self)
	}
}

impl Default for StrategyRouterBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main cascade orchestrator. Cheap to share behind an `Arc`.
pub struct StrategyRouter {
	features: FeatureFlags,
	cache: StrategyCache,
	rules: Option<Arc<dyn RuleSet>>,
	model: Option<Arc<dyn StrategyModel>>,
	accept_threshold: f64,
	advisory: AdvisoryClient,
	governor: RateGovernor,
	detector: ProtectionDetector,
	stats: UsageStatistics,
	events: Arc<EventDispatcher>,
	max_html_bytes: usize,
}

impl StrategyRouter {
	/// Router with default settings, the bundled model and an in-memory store.
	pub fn new() -> RouterResult<Self> {
		StrategyRouterBuilder::new().build()
	}

	/// Obtain a builder to customise the router instance.
	pub fn builder() -> StrategyRouterBuilder {
		StrategyRouterBuilder::new()
	}

	fn from_parts(parts: StrategyRouterBuilder) -> RouterResult<Self> {
		let StrategyRouterBuilder {
			settings,
			store,
			rules,
			model,
			provider,
			handlers,
			log_events,
		} = parts;
		settings.validate()?;
		let features = settings.features;

		let store: Arc<dyn StrategyStore> = match (store, settings.cache.store_path.as_ref()) {
			(Some(store), _) => store,
			(None, Some(path)) => Arc::new(RedbStore::open(path)?),
			(None, None) => Arc::new(MemoryStore::new()),
		};

		let rules = match rules {
			_ if !features.rules => None,
			Some(rules) => Some(rules),
			None => {
				Some(Arc::new(DefaultRuleEngine::with_config(settings.rules.clone())) as Arc<dyn RuleSet>)
			}
		};

		// A configured model that fails to load is fatal.
		let model = match model {
			_ if !features.classifier => None,
			Some(model) => Some(model),
			None => {
				let classifier = match settings.classifier.model_path.as_ref() {
					Some(path) => LocalClassifier::load(path)?,
					None => LocalClassifier::bundled()?,
				};
				Some(Arc::new(classifier) as Arc<dyn StrategyModel>)
			}
		};

		let provider = match (provider, settings.advisory.api_key.as_deref()) {
			(Some(provider), _) => Some(provider),
			(None, Some(key)) if features.advisory => {
				let config = GeminiConfig {
					endpoint: settings.advisory.endpoint.clone(),
					model: settings.advisory.model.clone(),
					..GeminiConfig::default()
				};
				Some(Arc::new(GeminiProvider::with_config(key, config)?) as Arc<dyn AdvisoryProvider>)
			}
			_ => None,
		};

		let mut dispatcher = EventDispatcher::new();
		if log_events {
			dispatcher.register_handler(Arc::new(LoggingHandler));
		}
		for handler in handlers {
			dispatcher.register_handler(handler);
		}

		let governor = RateGovernor::new(store.clone()).with_base_rate(settings.governor.base_rate);
		let quota = QuotaTracker::new(store.clone())
			.with_daily_limit(settings.advisory.daily_limit)
			.with_soft_ratio(settings.advisory.soft_ratio);

		let mut advisory_config = settings.advisory.client.clone();
		advisory_config.enabled = advisory_config.enabled && features.advisory;
		let mut advisory = AdvisoryClient::new(quota, governor.clone())
			.with_config(advisory_config)
			.with_events(dispatcher.clone());
		if let Some(provider) = provider {
			advisory = advisory.with_provider(provider);
		}

		let stats = UsageStatistics::shared(store.clone());
		let cache = StrategyCache::new(store).with_ttl(Duration::from_secs(settings.cache.ttl_secs));

		log::debug!(
			"strategy router ready (cache={}, rules={}, classifier={}, advisory={})",
			features.cache,
			rules.is_some(),
			model.is_some(),
			advisory.is_available()
		);

		Ok(Self {
			features,
			cache,
			rules,
			model,
			accept_threshold: settings.classifier.accept_threshold,
			advisory,
			governor,
			detector: ProtectionDetector::new(),
			stats,
			events: Arc::new(dispatcher),
			max_html_bytes: settings.max_html_bytes,
		})
	}

	/// Decide the fetch method for `url`.
	pub async fn predict_method(&self, url: &str, html: Option<&str>) -> RouterResult<Decision> {
		self.resolve(url, html).await.map(|resolution| resolution.decision)
	}

	/// Like [`predict_method`](Self::predict_method), abandoned as soon as
	/// `cancel` completes.
	pub async fn predict_method_until<F>(&self, url: &str, html: Option<&str>, cancel: F) -> RouterResult<Decision>
	where
		F: Future<Output = ()>,
	{
		tokio::select! {
			biased;
			_ = cancel => {
				log::debug!("strategy request for {url} cancelled");
				Err(RouterError::Cancelled)
			}
			result = self.resolve(url, html) => result.map(|resolution| resolution.decision),
		}
	}

	/// Run the cascade and report which tier answered.
	pub async fn resolve(&self, url: &str, html: Option<&str>) -> RouterResult<Resolution> {
		let started = Instant::now();
		let target = Target::parse(url)?;
		let html = html.map(|body| truncate_to_bytes(body, self.max_html_bytes));

		if self.features.cache {
			match self.cache.lookup(target.key()).await {
				Ok(Some(decision)) => {
					self.stats.record(DecisionSource::Cache).await;
					self.events.dispatch(CascadeEvent::CacheHit(CacheHitEvent {
						target_key: target.key().to_string(),
						method: decision.method(),
						timestamp: Utc::now(),
					}));
					return Ok(Resolution {
						decision,
						served_by: DecisionSource::Cache,
					});
				}
				Ok(None) => {}
				Err(err) => self.degraded("cache read", &err),
			}
		}

		let profile = html.map(|body| self.detector.profile(body));

		if let Some(rules) = self.rules.as_ref() {
			if let Some(decision) = rules.evaluate(&target, profile.as_ref()) {
				return Ok(self.finish(decision, started).await);
			}
		}

		let protections = profile.as_ref().map(|p| p.protections.clone()).unwrap_or_default();
		let protection_names: Vec<String> = protections.iter().map(|p| p.as_str().to_string()).collect();
		let bypass = bypass_plan(&protections);

		let fallback = match self.model.as_ref() {
			Some(model) => {
				let features = FeatureVector::extract(&target, profile.as_ref());
				let prediction = model.predict(&features)?;
				let decision = Decision::new(
					target.key(),
					prediction.method,
					prediction.confidence,
					DecisionSource::Classifier,
				)?
				.with_reasoning(format!("{} classification over {FEATURE_COUNT} features", model.name()))
				.with_protections(protection_names)
				.with_bypass_strategies(bypass);

				if prediction.confidence > self.accept_threshold {
					return Ok(self.finish(decision, started).await);
				}
				log::debug!(
					"classifier unsure for {} ({:.2} <= {:.2}), escalating",
					target.key(),
					prediction.confidence,
					self.accept_threshold
				);
				decision
			}
			None => {
				// Without a model the protection signal alone picks the fallback.
				let method = if protections.is_empty() { Method::Http } else { Method::Stealth };
				Decision::new(target.key(), method, 0.5, DecisionSource::Fallback)?
					.with_reasoning("default strategy, no classifier configured")
					.with_protections(protection_names)
					.with_bypass_strategies(bypass)
			}
		};

		let outcome = self.advisory.advise(&target, html, fallback).await;
		match &outcome {
			AdvisoryOutcome::Advised(_) => {}
			AdvisoryOutcome::Skipped { reason, .. } => {
				self.stats.record_advisory_skipped().await;
				self.events.dispatch(CascadeEvent::AdvisorySkipped(AdvisorySkippedEvent {
					target_key: target.key().to_string(),
					reason: reason.to_string(),
					timestamp: Utc::now(),
				}));
			}
			AdvisoryOutcome::Failed { error, attempts, .. } => {
				self.stats.record_advisory_failed().await;
				self.events.dispatch(CascadeEvent::AdvisoryFailed(AdvisoryFailedEvent {
					target_key: target.key().to_string(),
					attempts: *attempts,
					error: error.to_string(),
					timestamp: Utc::now(),
				}));
			}
		}

		Ok(self.finish(outcome.into_decision(), started).await)
	}

	async fn finish(&self, decision: Decision, started: Instant) -> Resolution {
		if self.features.cache {
			if let Err(err) = self.cache.store(&decision).await {
				self.degraded("cache write", &err);
			}
		}

		let source = decision.source();
		self.stats.record(source).await;
		self.events.dispatch(CascadeEvent::Decided(DecidedEvent {
			target_key: decision.target_key().to_string(),
			source,
			method: decision.method(),
			confidence: decision.confidence(),
			elapsed: started.elapsed(),
			timestamp: Utc::now(),
		}));

		Resolution {
			decision,
			served_by: source,
		}
	}

	fn degraded(&self, operation: &'static str, err: &dyn std::error::Error) {
		self.events.dispatch(CascadeEvent::StoreDegraded(StoreDegradedEvent {
			operation,
			error: err.to_string(),
			timestamp: Utc::now(),
		}));
	}

	/// Drop the cached decision for the site of `url`.
	pub async fn invalidate(&self, url: &str) -> RouterResult<bool> {
		let target = Target::parse(url)?;
		Ok(self.cache.invalidate(target.key()).await?)
	}

	/// Usage figures for today, shared by every router on the same store.
	pub async fn get_statistics(&self) -> CascadeStatistics {
		self.stats.snapshot().await
	}

	/// Limiter shared with collaborators issuing outbound requests.
	pub fn governor(&self) -> &RateGovernor {
		&self.governor
	}

	pub fn quota(&self) -> &QuotaTracker {
		self.advisory.quota()
	}
}

impl std::fmt::Debug for StrategyRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StrategyRouter")
			.field("features", &self.features)
			.field("cache", &self.cache)
			.field("advisory", &self.advisory)
			.field("accept_threshold", &self.accept_threshold)
			.finish_non_exhaustive()
	}
}

/// Longest prefix of `body` within `limit` bytes that ends on a char boundary.
fn truncate_to_bytes(body: &str, limit: usize) -> &str {
	if body.len() <= limit {
		return body;
	}
	let mut end = limit;
	while !body.is_char_boundary(end) {
		end -= 1;
	}
	&body[..end]
}
