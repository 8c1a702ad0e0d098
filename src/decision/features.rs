//! Versioned feature schema for the local classifier.
//!
//! The order of [`FEATURE_NAMES`] is part of the model contract: artifacts
//! declare the schema version and names they were trained on and are rejected
//! at load time when either differs.

use crate::detectors::{PageProfile, Protection};

use super::types::{Target, ValidationError};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_COUNT: usize = 17;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "url_length",
    "is_https",
    "path_depth",
    "query_param_count",
    "is_data_resource",
    "html_present",
    "html_length",
    "script_tag_count",
    "iframe_count",
    "form_count",
    "protection_count",
    "has_cloudflare",
    "has_captcha",
    "has_datadome",
    "has_perimeterx",
    "cloudflare_mentions",
    "captcha_mentions",
];

/// Fixed-length feature vector in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build the vector from a target and its optional page profile.
    pub fn extract(target: &Target, page: Option<&PageProfile>) -> Self {
        let url = target.url();
        let path = url.path().to_ascii_lowercase();
        let path_depth = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).count())
            .unwrap_or(0);

        let flag = |value: bool| if value { 1.0 } else { 0.0 };
        let empty = PageProfile::default();
        let profile = page.unwrap_or(&empty);

        let values = vec![
            url.as_str().len() as f64,
            flag(url.scheme() == "https"),
            path_depth as f64,
            url.query_pairs().count() as f64,
            flag(path.ends_with(".js") || path.ends_with(".json")),
            flag(page.is_some()),
            profile.length as f64,
            profile.script_count as f64,
            profile.iframe_count as f64,
            profile.form_count as f64,
            profile.protections.len() as f64,
            flag(profile.has(Protection::Cloudflare)),
            flag(profile.has_captcha()),
            flag(profile.has(Protection::Datadome)),
            flag(profile.has(Protection::PerimeterX)),
            profile.cloudflare_mentions as f64,
            profile.captcha_mentions as f64,
        ];
        debug_assert_eq!(values.len(), FEATURE_COUNT);

        Self { values }
    }

    /// Wrap raw values, rejecting vectors that do not match the schema length.
    pub fn from_values(values: Vec<f64>) -> Result<Self, ValidationError> {
        if values.len() != FEATURE_COUNT {
            return Err(ValidationError::FeatureLength {
                expected: FEATURE_COUNT,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|candidate| *candidate == name)
            .and_then(|index| self.values.get(index).copied())
    }
}
