//! # scrape-router-rs
//!
//! Chooses a fetch strategy for a URL while keeping calls to an expensive
//! external advisory service to a minimum.
//!
//! Requests flow through a cascade of increasingly costly tiers and stop at
//! the first confident answer:
//!
//! - Shared decision cache keyed by normalized host (24h TTL)
//! - Deterministic rules for known domains and simple pages
//! - Local softmax classifier over a versioned feature vector
//! - Quota- and rate-governed advisory service (Gemini by default)
//!
//! An adaptive token-bucket [`RateGovernor`] shares per-domain state through
//! the same store and slows down on 429s and slow responses.
//!
//! ## Example
//!
//! ```no_run
//! use scrape_router_rs::StrategyRouter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = StrategyRouter::builder()
//!         .with_advisory_daily_limit(500)
//!         .build()?;
//!     let decision = router.predict_method("https://example.com/", None).await?;
//!     println!("{} ({:.2})", decision.method(), decision.confidence());
//!     Ok(())
//! }
//! ```

mod router;

pub mod config;
pub mod decision;
pub mod detectors;
pub mod external_deps;
pub mod modules;
pub mod tiers;

pub use crate::router::{Resolution, RouterError, RouterResult, StrategyRouter, StrategyRouterBuilder};

pub use crate::config::{ConfigError, FeatureFlags, RouterSettings};

pub use crate::decision::{
    Decision,
    DecisionSource,
    FEATURE_COUNT,
    FEATURE_NAMES,
    FEATURE_SCHEMA_VERSION,
    FeatureVector,
    Method,
    Target,
    ValidationError,
};

pub use crate::detectors::{PageProfile, Protection, ProtectionDetector, bypass_plan};

pub use crate::external_deps::advisory::{
    AdvisoryError,
    AdvisoryProvider,
    AdvisoryRequest,
    AdvisoryVerdict,
    GeminiConfig,
    GeminiProvider,
};

pub use crate::modules::{
    CascadeEvent,
    CascadeStatistics,
    DecisionError,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MemoryStore,
    Mutation,
    QuotaReservation,
    QuotaTracker,
    RateGovernor,
    RedbStore,
    StoreError,
    StrategyCache,
    StrategyStore,
};

pub use crate::tiers::{
    AdvisoryClient,
    AdvisoryConfig,
    AdvisoryOutcome,
    DefaultRuleEngine,
    LocalClassifier,
    ModelArtifact,
    ModelError,
    Prediction,
    RetryPolicy,
    RuleConfig,
    RuleSet,
    SkipReason,
    StrategyModel,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
