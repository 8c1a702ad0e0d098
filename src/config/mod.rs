//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Serde defaults for every field
//! - JSON file loading
//! - Environment overrides
//! - Feature flags per tier

pub mod settings;

pub use settings::{
    AdvisorySettings, CacheSettings, ClassifierSettings, ConfigError, FeatureFlags,
    GovernorSettings, RouterSettings,
};
