//! Decision tiers, cheapest first.
//!
//! Each tier either settles a request or hands it on: the rule engine costs
//! nothing, the local classifier a few microseconds, and the advisory client
//! a metered remote call.

pub mod advisory;
pub mod classifier;
pub mod rules;

pub use advisory::{AdvisoryClient, AdvisoryConfig, AdvisoryOutcome, RetryPolicy, SkipReason};
pub use classifier::{
    DEFAULT_ACCEPT_THRESHOLD, LocalClassifier, ModelArtifact, ModelError, Prediction, StrategyModel,
};
pub use rules::{DefaultRuleEngine, RuleConfig, RuleSet};
