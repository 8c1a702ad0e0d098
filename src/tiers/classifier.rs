//! Local statistical tier.
//!
//! A multinomial logistic model over the versioned feature vector. Artifacts
//! are plain JSON; anything that does not match the compiled feature schema
//! is rejected at load time, so a running router never serves an
//! uninitialised or mismatched model.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decision::{FEATURE_COUNT, FEATURE_NAMES, FEATURE_SCHEMA_VERSION, FeatureVector, Method, ValidationError};

/// Classifier output accepted as final above this confidence.
pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 0.70;

const BUNDLED_ARTIFACT: &str = include_str!("../../models/strategy_classifier.json");

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model artifact is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model schema version {found} does not match feature schema {expected}")]
    SchemaVersion { expected: u32, found: u32 },
    #[error("model feature names do not match the feature schema")]
    FeatureNames,
    #[error("model declares no classes")]
    EmptyClasses,
    #[error("model shape invalid: {0}")]
    Shape(String),
}

/// Serialized model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema_version: u32,
    pub feature_names: Vec<String>,
    pub classes: Vec<Method>,
    /// One row of `FEATURE_COUNT` weights per class.
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl ModelArtifact {
    fn validate(&self) -> Result<(), ModelError> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(ModelError::SchemaVersion {
                expected: FEATURE_SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        if self.feature_names.len() != FEATURE_COUNT
            || self
                .feature_names
                .iter()
                .zip(FEATURE_NAMES.iter())
                .any(|(declared, expected)| declared != expected)
        {
            return Err(ModelError::FeatureNames);
        }
        if self.classes.is_empty() {
            return Err(ModelError::EmptyClasses);
        }

        let classes = self.classes.len();
        if self.weights.len() != classes || self.intercepts.len() != classes {
            return Err(ModelError::Shape(format!(
                "expected {classes} weight rows and intercepts, found {} and {}",
                self.weights.len(),
                self.intercepts.len()
            )));
        }
        if let Some(row) = self.weights.iter().position(|row| row.len() != FEATURE_COUNT) {
            return Err(ModelError::Shape(format!(
                "weight row {row} does not have {FEATURE_COUNT} columns"
            )));
        }
        if self.means.len() != FEATURE_COUNT || self.scales.len() != FEATURE_COUNT {
            return Err(ModelError::Shape("means and scales must cover every feature".into()));
        }
        if self.scales.iter().any(|scale| !scale.is_finite() || *scale <= 0.0) {
            return Err(ModelError::Shape("scales must be positive".into()));
        }
        let all_finite = self
            .weights
            .iter()
            .flatten()
            .chain(self.intercepts.iter())
            .chain(self.means.iter())
            .all(|value| value.is_finite());
        if !all_finite {
            return Err(ModelError::Shape("parameters must be finite".into()));
        }
        Ok(())
    }
}

/// One classifier answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub method: Method,
    pub confidence: f64,
    pub probabilities: Vec<(Method, f64)>,
}

/// Pluggable model tier.
pub trait StrategyModel: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ValidationError>;
}

/// Softmax classifier loaded from a [`ModelArtifact`].
#[derive(Debug, Clone)]
pub struct LocalClassifier {
    artifact: ModelArtifact,
}

impl LocalClassifier {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let classifier = Self::from_json(&raw)?;
        log::info!(
            "loaded strategy model from {} ({} classes)",
            path.display(),
            classifier.artifact.classes.len()
        );
        Ok(classifier)
    }

    /// Model shipped with the crate.
    pub fn bundled() -> Result<Self, ModelError> {
        Self::from_json(BUNDLED_ARTIFACT)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        Self::from_artifact(serde_json::from_str(raw)?)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        artifact.validate()?;
        Ok(Self { artifact })
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn classes(&self) -> &[Method] {
        &self.artifact.classes
    }
}

impl StrategyModel for LocalClassifier {
    fn name(&self) -> &str {
        "softmax"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ValidationError> {
        if features.len() != FEATURE_COUNT {
            return Err(ValidationError::FeatureLength {
                expected: FEATURE_COUNT,
                actual: features.len(),
            });
        }

        let model = &self.artifact;
        let standardized: Vec<f64> = features
            .values()
            .iter()
            .zip(model.means.iter().zip(model.scales.iter()))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect();

        let logits: Vec<f64> = model
            .weights
            .iter()
            .zip(model.intercepts.iter())
            .map(|(row, intercept)| {
                intercept
                    + row
                        .iter()
                        .zip(standardized.iter())
                        .map(|(w, x)| w * x)
                        .sum::<f64>()
            })
            .collect();

        let peak = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|z| (z - peak).exp()).collect();
        let total: f64 = exps.iter().sum();

        let probabilities: Vec<(Method, f64)> = model
            .classes
            .iter()
            .copied()
            .zip(exps.iter().map(|e| (e / total).clamp(0.0, 1.0)))
            .collect();

        // First class wins ties.
        let (method, confidence) = probabilities
            .iter()
            .copied()
            .fold((model.classes[0], f64::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 { candidate } else { best }
            });

        Ok(Prediction {
            method,
            confidence,
            probabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Target;
    use crate::detectors::ProtectionDetector;

    fn artifact() -> ModelArtifact {
        serde_json::from_str(BUNDLED_ARTIFACT).unwrap()
    }

    #[test]
    fn bundled_model_produces_distribution() {
        let classifier = LocalClassifier::bundled().unwrap();
        let target = Target::parse("https://unknown.example.com/catalog").unwrap();
        let prediction = classifier.predict(&FeatureVector::extract(&target, None)).unwrap();

        let sum: f64 = prediction.probabilities.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(prediction.probabilities.iter().any(|(m, p)| *m == prediction.method && *p == prediction.confidence));
        assert!((0.0..=1.0).contains(&prediction.confidence));
    }

    #[test]
    fn protected_pages_lean_to_stealth() {
        let classifier = LocalClassifier::bundled().unwrap();
        let target = Target::parse("https://shop.example.com/").unwrap();
        let html = "<html><head><script src=\"/cdn-cgi/challenge-platform/h/b/orchestrate/jsch/v1\"></script></head>\
                    <body>Checking your browser. Cloudflare Ray ID: cf-ray 7a1b</body></html>";
        let profile = ProtectionDetector::new().profile(html);
        let prediction = classifier
            .predict(&FeatureVector::extract(&target, Some(&profile)))
            .unwrap();
        assert_eq!(prediction.method, Method::Stealth);
        assert!(prediction.confidence > DEFAULT_ACCEPT_THRESHOLD);
    }

    #[test]
    fn rejects_schema_mismatches() {
        let mut wrong_version = artifact();
        wrong_version.schema_version = 2;
        assert!(matches!(
            LocalClassifier::from_artifact(wrong_version),
            Err(ModelError::SchemaVersion { expected: 1, found: 2 })
        ));

        let mut renamed = artifact();
        renamed.feature_names.swap(0, 1);
        assert!(matches!(LocalClassifier::from_artifact(renamed), Err(ModelError::FeatureNames)));

        let mut ragged = artifact();
        ragged.weights[1].pop();
        assert!(matches!(LocalClassifier::from_artifact(ragged), Err(ModelError::Shape(_))));

        let mut empty = artifact();
        empty.classes.clear();
        empty.weights.clear();
        empty.intercepts.clear();
        assert!(matches!(LocalClassifier::from_artifact(empty), Err(ModelError::EmptyClasses)));
    }

    #[test]
    fn missing_or_corrupt_artifacts_are_fatal() {
        assert!(matches!(
            LocalClassifier::load("/nonexistent/strategy_classifier.json"),
            Err(ModelError::Io { .. })
        ));
        assert!(matches!(LocalClassifier::from_json("{not json"), Err(ModelError::Parse(_))));
    }
}
