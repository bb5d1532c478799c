//! Feature-transform and classifier artifacts.
//!
//! Both are JSON documents loaded once at startup. A failed load is logged and
//! leaves the slot empty; prediction requests then fail with the matching
//! error instead of taking the whole service down.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::ServiceConfig;
use crate::error::{ArtifactError, PredictError, TransformError};
use crate::record::{FeatureFrame, FeatureRow, UserRecord, FEATURE_COLUMNS, FEATURE_COUNT};

/// Turns raw records into the classifier's numeric schema.
pub trait FeatureTransform: Send + Sync {
    fn transform(&self, records: &[UserRecord]) -> Result<FeatureFrame, TransformError>;
    fn describe(&self) -> serde_json::Value;
}

/// Produces one label per frame row.
pub trait Predictor: Send + Sync {
    fn predict(&self, frame: &FeatureFrame) -> Result<Vec<i64>, PredictError>;
    fn describe(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCategory {
    #[default]
    Error,
    /// Encode as all-zero, like a one-hot encoder with `handle_unknown=ignore`.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Fixed feature pipeline: subscription duration in days, one-hot gender,
/// numeric passthrough, then optional standardisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineArtifact {
    /// Lowercase raw value -> `female` | `male`.
    #[serde(default)]
    pub gender_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub handle_unknown: UnknownCategory,
    #[serde(default)]
    pub scaler: Option<StandardScaler>,
}

impl PipelineArtifact {
    pub fn load(path: &Path, expected_sha256: Option<&str>) -> Result<Self, ArtifactError> {
        let pipe: Self = read_artifact(path, expected_sha256)?;
        pipe.validate()?;
        Ok(pipe)
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if let Some(s) = &self.scaler {
            if s.mean.len() != FEATURE_COUNT || s.scale.len() != FEATURE_COUNT {
                return Err(ArtifactError::Invalid(format!(
                    "scaler needs {FEATURE_COUNT} means and scales, got {} and {}",
                    s.mean.len(),
                    s.scale.len()
                )));
            }
            if s.scale.iter().any(|v| !v.is_finite() || *v == 0.0) || s.mean.iter().any(|v| !v.is_finite()) {
                return Err(ArtifactError::Invalid("scaler values must be finite and scales non-zero".into()));
            }
        }
        if let Some((k, v)) = self.gender_aliases.iter().find(|(_, v)| v.as_str() != "female" && v.as_str() != "male") {
            return Err(ArtifactError::Invalid(format!("gender alias {k} -> {v} must map to female or male")));
        }
        Ok(())
    }

    fn encode_gender(&self, raw: &str) -> Result<(f64, f64), String> {
        let key = raw.trim().to_ascii_lowercase();
        let canonical = self.gender_aliases.get(&key).map(String::as_str).unwrap_or(key.as_str());
        match (canonical, self.handle_unknown) {
            ("female", _) => Ok((1.0, 0.0)),
            ("male", _) => Ok((0.0, 1.0)),
            (_, UnknownCategory::Ignore) => Ok((0.0, 0.0)),
            (other, UnknownCategory::Error) => Err(format!("unknown gender category '{other}'")),
        }
    }

    fn transform_one(&self, r: &UserRecord) -> Result<FeatureRow, String> {
        let duration = (r.membership_expire_date - r.transaction_date).num_days() as f64;
        let (female, male) = self.encode_gender(&r.gender)?;
        let mut row = [
            duration,
            female,
            male,
            r.city as f64,
            r.registered_via as f64,
            r.payment_method_id as f64,
            r.payment_plan_days as f64,
            r.actual_amount_paid as f64,
            r.is_auto_renew as f64,
        ];
        if let Some(s) = &self.scaler {
            for (i, v) in row.iter_mut().enumerate() {
                *v = (*v - s.mean[i]) / s.scale[i];
            }
        }
        Ok(row)
    }
}

impl FeatureTransform for PipelineArtifact {
    fn transform(&self, records: &[UserRecord]) -> Result<FeatureFrame, TransformError> {
        let rows = records
            .iter()
            .enumerate()
            .map(|(i, r)| self.transform_one(r).map_err(|e| TransformError(format!("row {i}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureFrame::new(rows))
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "output_columns": FEATURE_COLUMNS,
            "gender_aliases": self.gender_aliases,
            "handle_unknown": self.handle_unknown,
            "scaled": self.scaler.is_some(),
        })
    }
}

fn default_threshold() -> f64 { 0.5 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split { feature: usize, threshold: f64, left: usize, right: usize },
    Leaf { label: i64 },
}

/// Trained classifier exported as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    LogisticRegression {
        coefficients: Vec<f64>,
        intercept: f64,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// Flat node list rooted at index 0; `feature <= threshold` goes left.
    DecisionTree { nodes: Vec<TreeNode> },
}

impl ModelArtifact {
    pub fn load(path: &Path, expected_sha256: Option<&str>) -> Result<Self, ArtifactError> {
        let model: Self = read_artifact(path, expected_sha256)?;
        model.validate()?;
        Ok(model)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelArtifact::LogisticRegression { .. } => "logistic_regression",
            ModelArtifact::DecisionTree { .. } => "decision_tree",
        }
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        match self {
            ModelArtifact::LogisticRegression { coefficients, intercept, threshold } => {
                if coefficients.len() != FEATURE_COUNT {
                    return Err(ArtifactError::Invalid(format!(
                        "expected {FEATURE_COUNT} coefficients, got {}",
                        coefficients.len()
                    )));
                }
                if coefficients.iter().chain([intercept]).any(|c| !c.is_finite()) {
                    return Err(ArtifactError::Invalid("coefficients must be finite".into()));
                }
                if !(0.0..=1.0).contains(threshold) {
                    return Err(ArtifactError::Invalid(format!("threshold {threshold} outside [0, 1]")));
                }
            }
            ModelArtifact::DecisionTree { nodes } => {
                if nodes.is_empty() {
                    return Err(ArtifactError::Invalid("decision tree has no nodes".into()));
                }
                for (i, n) in nodes.iter().enumerate() {
                    if let TreeNode::Split { feature, left, right, .. } = n {
                        if *feature >= FEATURE_COUNT || *left >= nodes.len() || *right >= nodes.len() {
                            return Err(ArtifactError::Invalid(format!("node {i} references out-of-range feature or child")));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn predict_row(&self, row: &FeatureRow) -> Result<i64, String> {
        if row.iter().any(|v| !v.is_finite()) {
            return Err("non-finite feature value".into());
        }
        match self {
            ModelArtifact::LogisticRegression { coefficients, intercept, threshold } => {
                let z = intercept + coefficients.iter().zip(row).map(|(c, x)| c * x).sum::<f64>();
                let p = 1.0 / (1.0 + (-z).exp());
                Ok(i64::from(p >= *threshold))
            }
            ModelArtifact::DecisionTree { nodes } => {
                let mut idx = 0usize;
                // a valid tree never visits more nodes than it has
                for _ in 0..=nodes.len() {
                    match nodes.get(idx) {
                        Some(TreeNode::Leaf { label }) => return Ok(*label),
                        Some(TreeNode::Split { feature, threshold, left, right }) => {
                            idx = if row[*feature] <= *threshold { *left } else { *right };
                        }
                        None => return Err(format!("dangling node index {idx}")),
                    }
                }
                Err("decision tree contains a cycle".into())
            }
        }
    }
}

impl Predictor for ModelArtifact {
    fn predict(&self, frame: &FeatureFrame) -> Result<Vec<i64>, PredictError> {
        frame
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| self.predict_row(row).map_err(|e| PredictError(format!("row {i}: {e}"))))
            .collect()
    }

    fn describe(&self) -> serde_json::Value {
        match self {
            ModelArtifact::LogisticRegression { coefficients, intercept, threshold } => {
                let weights: BTreeMap<&str, f64> = FEATURE_COLUMNS.iter().copied().zip(coefficients.iter().copied()).collect();
                serde_json::json!({ "kind": self.kind(), "coefficients": weights, "intercept": intercept, "threshold": threshold })
            }
            ModelArtifact::DecisionTree { nodes } => serde_json::json!({ "kind": self.kind(), "nodes": nodes.len() }),
        }
    }
}

fn read_artifact<T: DeserializeOwned>(path: &Path, expected_sha256: Option<&str>) -> Result<T, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io { path: path.to_path_buf(), source })?;
    if let Some(expect) = expected_sha256.filter(|s| !s.is_empty()) {
        let got = format!("{:x}", Sha256::digest(&bytes));
        if !expect.eq_ignore_ascii_case(&got) {
            return Err(ArtifactError::Invalid(format!(
                "{} hash mismatch expected={expect} got={got}",
                path.display()
            )));
        }
    }
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Parse { path: path.to_path_buf(), source })
}

/// The loaded pair. Either slot may be empty after a failed load.
#[derive(Clone, Default)]
pub struct Artifacts {
    pub transform: Option<Arc<dyn FeatureTransform>>,
    pub predictor: Option<Arc<dyn Predictor>>,
}

impl Artifacts {
    pub fn new(transform: impl FeatureTransform + 'static, predictor: impl Predictor + 'static) -> Self {
        Self { transform: Some(Arc::new(transform)), predictor: Some(Arc::new(predictor)) }
    }

    pub fn from_config(cfg: &ServiceConfig) -> Self {
        let transform = match PipelineArtifact::load(&cfg.pipeline_path, cfg.pipeline_sha256.as_deref()) {
            Ok(p) => {
                info!(path = %cfg.pipeline_path.display(), "pipeline loaded successfully");
                Some(Arc::new(p) as Arc<dyn FeatureTransform>)
            }
            Err(e) => {
                error!(error = %e, "pipeline could not be loaded");
                None
            }
        };
        let predictor = match ModelArtifact::load(&cfg.model_path, cfg.model_sha256.as_deref()) {
            Ok(m) => {
                info!(path = %cfg.model_path.display(), kind = m.kind(), "model loaded successfully");
                Some(Arc::new(m) as Arc<dyn Predictor>)
            }
            Err(e) => {
                error!(error = %e, "model could not be loaded");
                None
            }
        };
        Self { transform, predictor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;

    fn record(gender: &str) -> UserRecord {
        UserRecord {
            user_id: None,
            city: 5,
            gender: gender.into(),
            registered_via: 9,
            payment_method_id: 38,
            payment_plan_days: 30,
            actual_amount_paid: 149,
            is_auto_renew: 0,
            transaction_date: NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            membership_expire_date: NaiveDate::from_ymd_opt(2017, 2, 1).unwrap(),
        }
    }

    #[test]
    fn transform_builds_fixed_columns() {
        let frame = PipelineArtifact::default().transform(&[record("Male")]).unwrap();
        assert_eq!(frame.rows()[0], [31.0, 0.0, 1.0, 5.0, 9.0, 38.0, 30.0, 149.0, 0.0]);
    }

    #[test]
    fn unknown_gender_policy() {
        let strict = PipelineArtifact::default();
        let err = strict.transform(&[record("female"), record("x")]).unwrap_err();
        assert!(err.0.starts_with("row 1"), "{}", err.0);

        let lenient = PipelineArtifact { handle_unknown: UnknownCategory::Ignore, ..Default::default() };
        let frame = lenient.transform(&[record("x")]).unwrap();
        assert_eq!(&frame.rows()[0][1..3], &[0.0, 0.0]);
    }

    #[test]
    fn aliases_and_scaler_apply() {
        let pipe = PipelineArtifact {
            gender_aliases: BTreeMap::from([("f".to_string(), "female".to_string())]),
            scaler: Some(StandardScaler { mean: vec![1.0; FEATURE_COUNT], scale: vec![2.0; FEATURE_COUNT] }),
            ..Default::default()
        };
        pipe.validate().unwrap();
        let row = pipe.transform(&[record("F")]).unwrap().rows()[0];
        assert_eq!(row[0], 15.0);
        assert_eq!(row[1], 0.0);
        assert_eq!(row[2], -0.5);
    }

    #[test]
    fn scaler_length_is_checked() {
        let pipe = PipelineArtifact {
            scaler: Some(StandardScaler { mean: vec![0.0; 3], scale: vec![1.0; 3] }),
            ..Default::default()
        };
        assert!(matches!(pipe.validate(), Err(ArtifactError::Invalid(_))));
    }

    #[test]
    fn logistic_regression_thresholds() {
        let model = ModelArtifact::LogisticRegression { coefficients: vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0], intercept: -2.0, threshold: 0.5 };
        let frame = FeatureFrame::new(vec![[0.0; FEATURE_COUNT], [1.0; FEATURE_COUNT]]);
        assert_eq!(model.predict(&frame).unwrap(), vec![0, 1]);
    }

    #[test]
    fn decision_tree_walks_to_leaf() {
        let model: ModelArtifact = serde_json::from_value(serde_json::json!({
            "kind": "decision_tree",
            "nodes": [
                {"feature": 8, "threshold": 0.5, "left": 1, "right": 2},
                {"label": 0},
                {"label": 1}
            ]
        }))
        .unwrap();
        model.validate().unwrap();
        let mut on = [0.0; FEATURE_COUNT];
        on[8] = 1.0;
        let frame = FeatureFrame::new(vec![[0.0; FEATURE_COUNT], on]);
        assert_eq!(model.predict(&frame).unwrap(), vec![0, 1]);
    }

    #[test]
    fn cyclic_tree_is_a_predict_error() {
        let model = ModelArtifact::DecisionTree {
            nodes: vec![TreeNode::Split { feature: 0, threshold: 1.0, left: 0, right: 0 }],
        };
        let err = model.predict(&FeatureFrame::new(vec![[0.0; FEATURE_COUNT]])).unwrap_err();
        assert!(err.0.contains("cycle"));
    }

    #[test]
    fn load_checks_hash_and_shape() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"kind":"logistic_regression","coefficients":[1,2,3],"intercept":0}}"#).unwrap();
        assert!(matches!(ModelArtifact::load(f.path(), None), Err(ArtifactError::Invalid(_))));
        assert!(matches!(ModelArtifact::load(f.path(), Some("deadbeef")), Err(ArtifactError::Invalid(m)) if m.contains("hash mismatch")));
        assert!(matches!(PipelineArtifact::load(Path::new("/nonexistent/pipe.json"), None), Err(ArtifactError::Io { .. })));
    }
}
