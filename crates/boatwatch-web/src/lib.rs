//! HTTP surface: the boats snapshot for the map client, the refresh trigger
//! and a health check.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use boatwatch_core::BoatRow;
use boatwatch_storage::BoatSnapshotSource;
use boatwatch_sync::{
    build_pipeline, connect_store, maybe_build_scheduler, SyncConfig, SyncPipeline,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "boatwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub boats: Arc<dyn BoatSnapshotSource>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, boats: Arc<dyn BoatSnapshotSource>) -> Self {
        Self { pipeline, boats }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/boats-data", get(boats_data_handler))
        .route("/refresh-boats", get(refresh_boats_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("BOATWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    let pipeline = Arc::new(build_pipeline(config, store.clone()).await?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %pipeline.config().sync_cron, "scheduled refresh enabled");
    }

    let state = AppState::new(pipeline, store);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn boats_data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.boats.list_boats().await {
        Ok(rows) => Json::<Vec<BoatRow>>(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Runs one gated cycle. The cycle runs on its own task so a client that
/// hangs up does not abandon a half-finished upsert.
async fn refresh_boats_handler(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    match tokio::spawn(async move { pipeline.run_cycle().await }).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(anyhow::anyhow!("refresh task failed: {err}")),
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "ok": true, "atolls": state.pipeline.regions().len() })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": err.to_string() })),
    )
        .into_response()
}
