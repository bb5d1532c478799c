use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use churn_api::{api, metrics, Artifacts, ServiceConfig, ServiceContext, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = ServiceConfig::load().context("loading configuration")?;
    churn_core::init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(
        bind = %cfg.bind_addr,
        backend = ?cfg.storage_backend,
        model = %cfg.model_path.display(),
        pipeline = %cfg.pipeline_path.display(),
        "starting churn-api"
    );
    metrics::register();

    let artifacts = Artifacts::from_config(&cfg);
    let storage = Storage::open(&cfg).context("opening storage")?;
    let ctx = Arc::new(ServiceContext::new(artifacts, storage, cfg.max_upload_bytes));
    let loaded = ctx.artifacts_loaded();
    let app = api::router(ctx);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    if loaded {
        churn_core::mark_ready();
    } else {
        warn!("artifacts missing; serving but /ready reports 503 and predictions fail");
    }
    info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(churn_core::shutdown_signal())
        .await
        .context("server error")?;
    info!("shutdown complete");
    Ok(())
}
