//! Core shared utilities for the churn prediction services.
//!
//! Everything here is process-wide: tracing is installed once, readiness is a single
//! atomic flag, and metrics live in the default prometheus registry.

use anyhow::Result;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use config::builder::DefaultState;
use config::ConfigBuilder;
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable naming an optional config file (yaml, toml or json).
pub const CONFIG_FILE_ENV: &str = "CHURN_CONFIG_FILE";
/// Prefix for environment overrides, e.g. `CHURN_BIND_ADDR`.
pub const ENV_PREFIX: &str = "CHURN";
const JSON_LOG_ENV: &str = "CHURN_JSON_LOG";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

fn json_log_enabled() -> bool {
    std::env::var(JSON_LOG_ENV)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))?;
        if json_log_enabled() {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false);
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true);
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        }
        Ok(())
    })?;
    info!(%service, "tracing initialized");
    Ok(())
}

/// Layered config: defaults < file from `CHURN_CONFIG_FILE` < `CHURN_*` env.
///
/// Callers add their own `set_default`s on the returned builder; defaults
/// always rank below the file and environment sources.
pub fn config_builder(service: &str) -> Result<ConfigBuilder<DefaultState>> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?;
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );
    Ok(builder)
}

/// `/live`, `/ready` and `/metrics`, mergeable into any service router.
pub fn health_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": true})) }))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler() -> Response {
    let ready = is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({"ready": ready}))).into_response()
}

async fn metrics_handler() -> Response {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

/// Resolves on ctrl-c and flips readiness off so load balancers drain first.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error=?e, "ctrl_c listener failed");
    }
    clear_ready();
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn ready_endpoint_follows_flag() {
        let app: Router = health_router();
        clear_ready();
        let resp = app.clone().oneshot(Request::get("/ready").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        mark_ready();
        let resp = app.oneshot(Request::get("/ready").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn live_endpoint_always_answers() {
        let app: Router = health_router();
        let resp = app.oneshot(Request::get("/live").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap()["live"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_text() {
        let app: Router = health_router();
        let resp = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(ct.starts_with("text/plain"));
    }

    #[test]
    fn builder_applies_defaults() {
        let cfg = config_builder("unit").unwrap().build().unwrap();
        assert_eq!(cfg.get_string("service_name").unwrap(), "unit");
    }
}
