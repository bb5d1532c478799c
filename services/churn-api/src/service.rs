//! Prediction, bulk prediction and result lookups over an immutable context.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::artifacts::{Artifacts, FeatureTransform, Predictor};
use crate::bulk;
use crate::error::{PredictError, ServiceError, TransformError};
use crate::metrics;
use crate::record::{PredictionResult, UserId, UserRecord, FEATURE_COLUMNS, INPUT_COLUMNS};
use crate::storage::{ResultStore, Storage, UserRegistry};

pub type Predictions = BTreeMap<UserId, PredictionResult>;

/// Built once at startup and shared read-only by every request.
pub struct ServiceContext {
    transform: Option<Arc<dyn FeatureTransform>>,
    predictor: Option<Arc<dyn Predictor>>,
    registry: Arc<dyn UserRegistry>,
    results: Arc<dyn ResultStore>,
    max_upload_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserLookup {
    pub user_id: UserId,
    pub user_data: PredictionResult,
}

impl ServiceContext {
    pub fn new(artifacts: Artifacts, storage: Storage, max_upload_bytes: usize) -> Self {
        Self {
            transform: artifacts.transform,
            predictor: artifacts.predictor,
            registry: storage.registry,
            results: storage.results,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> usize { self.max_upload_bytes }

    pub fn artifacts_loaded(&self) -> bool { self.transform.is_some() && self.predictor.is_some() }

    /// Transform then predict. Pure: touches neither registry nor store.
    fn run_model(&self, records: &[UserRecord]) -> Result<Vec<PredictionResult>, ServiceError> {
        let transform = self
            .transform
            .as_ref()
            .ok_or_else(|| TransformError("pipeline artifact not loaded".into()))?;
        let frame = transform.transform(records)?;
        if frame.len() != records.len() {
            return Err(TransformError(format!("pipeline returned {} rows for {} records", frame.len(), records.len())).into());
        }
        let predictor = self
            .predictor
            .as_ref()
            .ok_or_else(|| PredictError("model artifact not loaded".into()))?;
        let labels = predictor.predict(&frame)?;
        if labels.len() != frame.len() {
            return Err(PredictError(format!("model returned {} labels for {} rows", labels.len(), frame.len())).into());
        }
        metrics::record_rows(labels.len());
        Ok(frame
            .rows()
            .iter()
            .zip(labels)
            .map(|(row, label)| PredictionResult::from_row(row, label))
            .collect())
    }

    #[instrument(skip(self, record), fields(user_id = ?record.user_id))]
    pub fn predict_one(&self, record: UserRecord) -> Result<Predictions, ServiceError> {
        let record = record.validate()?;
        let result = self
            .run_model(std::slice::from_ref(&record))?
            .pop()
            .ok_or_else(|| PredictError("model returned no rows".into()))?;
        let user_id = self.registry.allocate_or_validate(record.user_id)?;
        let entry = Predictions::from([(user_id, result)]);
        self.results.merge(&entry)?;
        info!(user_id, prediction = entry[&user_id].predictions, "prediction stored");
        Ok(entry)
    }

    /// Whole-batch semantics: the CSV is fully parsed and scored before any id
    /// is allocated, so a failure leaves both stores untouched.
    #[instrument(skip(self, csv), fields(bytes = csv.len()))]
    pub fn predict_bulk(&self, csv: &[u8]) -> Result<Predictions, ServiceError> {
        let records = bulk::parse_csv(csv)?;
        debug!(rows = records.len(), "csv parsed");
        let results = self.run_model(&records)?;
        let requested: Vec<Option<UserId>> = records.iter().map(|r| r.user_id).collect();
        let ids = self.registry.allocate_batch(&requested)?;
        let out: Predictions = ids.into_iter().zip(results).collect();
        self.results.merge(&out)?;
        info!(rows = records.len(), users = out.len(), "bulk predictions stored");
        Ok(out)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<UserLookup, ServiceError> {
        let user_data = self.results.get(user_id)?.ok_or(ServiceError::NotFound(user_id))?;
        Ok(UserLookup { user_id, user_data })
    }

    /// Fails without touching anything when the store has no entry; registry
    /// removal is best-effort.
    #[instrument(skip(self))]
    pub fn delete_user(&self, user_id: UserId) -> Result<(), ServiceError> {
        if !self.results.remove(user_id)? {
            return Err(ServiceError::NotFound(user_id));
        }
        if !self.registry.remove(user_id)? {
            debug!(user_id, "user had results but no registry entry");
        }
        info!(user_id, "user deleted");
        Ok(())
    }

    pub fn model_info(&self) -> serde_json::Value {
        serde_json::json!({
            "inputs": INPUT_COLUMNS,
            "features": FEATURE_COLUMNS,
            "pipeline": {
                "loaded": self.transform.is_some(),
                "details": self.transform.as_ref().map(|t| t.describe()),
            },
            "model": {
                "loaded": self.predictor.is_some(),
                "details": self.predictor.as_ref().map(|p| p.describe()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ModelArtifact, PipelineArtifact};
    use crate::config::ServiceConfig;
    use chrono::NaiveDate;
    use std::path::Path;

    const HEADER: &str = "user_id,city,gender,registered_via,payment_method_id,payment_plan_days,actual_amount_paid,is_auto_renew,transaction_date,membership_expire_date";

    fn model() -> ModelArtifact {
        ModelArtifact::LogisticRegression {
            coefficients: vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0],
            intercept: -2.0,
            threshold: 0.5,
        }
    }

    fn context(dir: &Path, artifacts: Artifacts) -> ServiceContext {
        let cfg = ServiceConfig::rooted_at(dir).unwrap();
        ServiceContext::new(artifacts, Storage::open(&cfg).unwrap(), cfg.max_upload_bytes)
    }

    fn loaded(dir: &Path) -> ServiceContext {
        context(dir, Artifacts::new(PipelineArtifact::default(), model()))
    }

    fn record(user_id: Option<UserId>) -> UserRecord {
        UserRecord {
            user_id,
            city: 1,
            gender: "female".into(),
            registered_via: 7,
            payment_method_id: 41,
            payment_plan_days: 30,
            actual_amount_paid: 149,
            is_auto_renew: 1,
            transaction_date: NaiveDate::from_ymd_opt(2017, 3, 1).unwrap(),
            membership_expire_date: NaiveDate::from_ymd_opt(2017, 3, 31).unwrap(),
        }
    }

    #[test]
    fn predict_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        let out = ctx.predict_one(record(Some(42))).unwrap();
        let stored = &out[&42];
        assert_eq!(stored.duration_of_subscription, 30.0);
        assert_eq!(stored.predictions, 1);
        assert_eq!(ctx.get_user(42).unwrap().user_data, *stored);
    }

    #[test]
    fn predict_without_id_allocates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        assert!(ctx.predict_one(record(None)).unwrap().contains_key(&1));
        assert!(ctx.predict_one(record(None)).unwrap().contains_key(&2));
    }

    #[test]
    fn delete_removes_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        ctx.predict_one(record(Some(42))).unwrap();
        ctx.delete_user(42).unwrap();
        assert!(matches!(ctx.get_user(42), Err(ServiceError::NotFound(42))));
        assert!(!ctx.registry.users().unwrap().contains(&42));
        assert!(matches!(ctx.delete_user(42), Err(ServiceError::NotFound(42))));
    }

    #[test]
    fn delete_unknown_leaves_registry_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        ctx.registry.allocate_or_validate(Some(5)).unwrap();
        assert!(matches!(ctx.delete_user(5), Err(ServiceError::NotFound(5))));
        assert_eq!(ctx.registry.users().unwrap(), vec![5]);
    }

    #[test]
    fn bulk_allocates_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        ctx.predict_one(record(Some(10))).unwrap();
        let row = ",1,male,7,41,30,149,0,2017-03-01,2017-04-01";
        let csv = format!("{HEADER}\n{row}\n{row}\n{row}\n");
        let out = ctx.predict_bulk(csv.as_bytes()).unwrap();
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec![11, 12, 13]);
        for id in [10, 11, 12, 13] {
            assert!(ctx.get_user(id).is_ok());
        }
        assert_eq!(out[&11].predictions, 0);
    }

    fn stored_bytes(dir: &Path) -> (Vec<u8>, Vec<u8>) {
        (
            std::fs::read(dir.join("users.json")).unwrap(),
            std::fs::read(dir.join("userdata.json")).unwrap(),
        )
    }

    #[test]
    fn failed_bulk_leaves_existing_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        ctx.predict_one(record(Some(10))).unwrap();
        let before = stored_bytes(dir.path());

        let err = ctx.predict_bulk(b"user_id,city\n\"unterminated,1\n").unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(stored_bytes(dir.path()), before);

        // parses fine but the second row fails the transform
        let csv = format!("{HEADER}\n,1,male,7,41,30,149,0,2017-03-01,2017-04-01\n,1,other,7,41,30,149,0,2017-03-01,2017-04-01\n");
        assert!(matches!(ctx.predict_bulk(csv.as_bytes()), Err(ServiceError::Transform(_))));
        assert_eq!(stored_bytes(dir.path()), before);
    }

    #[test]
    fn transform_failure_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = loaded(dir.path());
        let mut bad = record(None);
        bad.gender = "unknown".into();
        assert!(matches!(ctx.predict_one(bad), Err(ServiceError::Transform(_))));
        assert!(ctx.registry.users().unwrap().is_empty());
    }

    #[test]
    fn missing_artifacts_surface_faults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Artifacts::default());
        assert!(!ctx.artifacts_loaded());
        assert!(matches!(ctx.predict_one(record(Some(1))), Err(ServiceError::Transform(_))));

        let half = Artifacts { transform: Some(Arc::new(PipelineArtifact::default())), predictor: None };
        let ctx = context(dir.path(), half);
        assert!(matches!(ctx.predict_one(record(Some(1))), Err(ServiceError::Predict(_))));
        assert_eq!(ctx.model_info()["model"]["loaded"], false);
    }
}
