//! Core data structures shared by every tier of the cascade.

pub mod features;
pub mod types;

pub use features::{FEATURE_COUNT, FEATURE_NAMES, FEATURE_SCHEMA_VERSION, FeatureVector};
pub use types::{Decision, DecisionSource, Method, Target, ValidationError};
