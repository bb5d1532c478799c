use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, warn};

use crate::record::UserId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("corrupt data in {location}: {source}")]
    Corrupt { location: String, #[source] source: serde_json::Error },
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("malformed key in tree {tree}")]
    MalformedKey { tree: &'static str },
    #[error("user id space exhausted")]
    IdSpaceExhausted,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PredictError(pub String);

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
    #[error("invalid artifact: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not able to transform data through the pipeline: {0}")]
    Transform(#[from] TransformError),
    #[error("prediction failed: {0}")]
    Predict(#[from] PredictError),
    #[error("user {0} does not exist")]
    NotFound(UserId),
    #[error("upload too large: {0}")]
    PayloadTooLarge(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Transform(_) | ServiceError::Predict(_) | ServiceError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used as the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::Transform(_) => "transform",
            ServiceError::Predict(_) => "predict",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::PayloadTooLarge(_) => "too_large",
            ServiceError::Storage(_) => "storage",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();
        if status.is_server_error() {
            error!(error = %detail, kind = self.kind(), "request failed");
        } else {
            warn!(error = %detail, kind = self.kind(), "request rejected");
        }
        (status, Json(serde_json::json!({ "detail": detail, "status": status.as_u16() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServiceError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::NotFound(4).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::PayloadTooLarge("x".into()).status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ServiceError::from(TransformError("t".into())).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ServiceError::from(PredictError("p".into())).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ServiceError::from(StorageError::IdSpaceExhausted).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
