//! Routes. Handlers only decode the request, call the service and record metrics.

use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::QueryRejection, DefaultBodyLimit, Multipart, Query, State,
    },
    http::{StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ServiceError;
use crate::metrics;
use crate::record::{UserId, UserRecord};
use crate::service::{Predictions, ServiceContext, UserLookup};

type Ctx = State<Arc<ServiceContext>>;

const UPLOAD_FIELD: &str = "file";

pub fn router(ctx: Arc<ServiceContext>) -> Router {
    let upload_limit = ctx.max_upload_bytes();
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/modelinfo", get(model_info))
        .route("/predict", post(predict))
        .route("/bulkpredict", post(bulk_predict).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/getuser", post(get_user))
        .route("/deleteuser", post(delete_user))
        .merge(churn_core::health_router::<Arc<ServiceContext>>())
        .with_state(ctx)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "User Churn Prediction",
        "description": "Takes in user data and predicts whether the user is going to renew their membership",
        "endpoints": {
            "/health": "Returns the current health of the API",
            "/modelinfo": "Describes the loaded pipeline and model",
            "/predict": {
                "description": "Predicts renewal for a single user (query parameters or JSON body)",
                "parameters": {
                    "user_id": "optional; allocated when absent",
                    "city": "city of residence",
                    "gender": "gender of the user",
                    "registered_via": "registration medium",
                    "payment_method_id": "payment method of the user",
                    "payment_plan_days": "current payment plan of the user",
                    "actual_amount_paid": "amount the user paid for the subscription",
                    "is_auto_renew": "whether the subscription auto-renews",
                    "transaction_date": "YYYY-MM-DD",
                    "membership_expire_date": "YYYY-MM-DD"
                }
            },
            "/bulkpredict": {
                "description": "Predicts renewal for a CSV upload (multipart field `file`); first column is user_id"
            },
            "/getuser": "POST ?target=<id>; returns the stored prediction for a user",
            "/deleteuser": "POST ?target=<id>; removes a user and their prediction"
        }
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "message": "API is healthy"}))
}

async fn model_info(State(ctx): Ctx) -> Json<serde_json::Value> {
    Json(ctx.model_info())
}

/// Query string wins when present; otherwise the body must be a JSON record.
fn decode_record(uri: &Uri, body: &[u8]) -> Result<UserRecord, ServiceError> {
    match uri.query() {
        Some(q) if !q.is_empty() => Query::<UserRecord>::try_from_uri(uri)
            .map(|Query(r)| r)
            .map_err(|e| ServiceError::Validation(e.body_text())),
        _ if !body.is_empty() => {
            serde_json::from_slice(body).map_err(|e| ServiceError::Validation(format!("malformed JSON record: {e}")))
        }
        _ => Err(ServiceError::Validation(
            "record fields must be given as query parameters or a JSON body".into(),
        )),
    }
}

async fn predict(State(ctx): Ctx, uri: Uri, body: Bytes) -> Result<Json<Predictions>, ServiceError> {
    let started = Instant::now();
    let out = decode_record(&uri, &body).and_then(|r| ctx.predict_one(r));
    metrics::observe("predict", started, &out);
    out.map(Json)
}

/// Body-limit overruns keep their 413; anything else is a bad request.
fn upload_error(e: MultipartError) -> ServiceError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge(e.body_text())
    } else {
        ServiceError::Validation(format!("multipart error: {}", e.body_text()))
    }
}

async fn read_upload(multipart: Result<Multipart, MultipartRejection>) -> Result<Bytes, ServiceError> {
    let mut multipart = multipart.map_err(|e| ServiceError::Validation(e.body_text()))?;
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() == Some(UPLOAD_FIELD) {
            return field.bytes().await.map_err(upload_error);
        }
    }
    Err(ServiceError::Validation(format!("multipart upload must include a `{UPLOAD_FIELD}` field")))
}

async fn bulk_predict(
    State(ctx): Ctx,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Predictions>, ServiceError> {
    let started = Instant::now();
    let out = match read_upload(multipart).await {
        Ok(csv) => ctx.predict_bulk(&csv),
        Err(e) => Err(e),
    };
    metrics::observe("bulkpredict", started, &out);
    out.map(Json)
}

#[derive(Debug, Deserialize)]
struct Target {
    target: UserId,
}

fn target(q: Result<Query<Target>, QueryRejection>) -> Result<UserId, ServiceError> {
    q.map(|Query(t)| t.target).map_err(|e| ServiceError::Validation(e.body_text()))
}

async fn get_user(State(ctx): Ctx, q: Result<Query<Target>, QueryRejection>) -> Result<Json<UserLookup>, ServiceError> {
    let started = Instant::now();
    let out = target(q).and_then(|id| ctx.get_user(id));
    metrics::observe("getuser", started, &out);
    out.map(Json)
}

async fn delete_user(
    State(ctx): Ctx,
    q: Result<Query<Target>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let started = Instant::now();
    let out = target(q).and_then(|id| ctx.delete_user(id).map(|()| id));
    metrics::observe("deleteuser", started, &out);
    out.map(|id| Json(serde_json::json!({ "message": format!("{id} deleted successfully") })))
}
