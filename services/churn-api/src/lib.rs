//! Churn prediction service: scores subscription records with a pre-trained
//! pipeline and model, and keeps per-user results on local storage.

pub mod api;
pub mod artifacts;
pub mod bulk;
pub mod config;
pub mod error;
pub mod metrics;
pub mod record;
pub mod service;
pub mod storage;

pub use artifacts::{Artifacts, FeatureTransform, ModelArtifact, PipelineArtifact, Predictor};
pub use config::{ServiceConfig, StorageBackend};
pub use error::ServiceError;
pub use record::{PredictionResult, UserId, UserRecord};
pub use service::{Predictions, ServiceContext};
pub use storage::Storage;
