//! HTTP surface: task submission, status, and cancellation.
//!
//! Submission validates the body, allocates a task id, spawns the pipeline,
//! and replies immediately; it never waits on pipeline progress.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use uuid::Uuid;

use parley_core::broker::{Broker, HttpBroker};
use parley_core::filestore::{FileStore, RemoteFileStore};

use crate::config::GatewayConfig;
use crate::pipeline::Pipeline;
use crate::task::{self, CancelOutcome, TaskRegistry, TaskSpec, TaskView};

pub struct AppState {
    pub cfg: GatewayConfig,
    pub pool: MySqlPool,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn FileStore>,
    pub registry: TaskRegistry,
}

/// Build the shared state from config.
///
/// The engine pool is lazy: the store is restarted *by* the pipeline, so it
/// need not be reachable at gateway boot. The mirror schema is attempted
/// here so a reachable store is ready before the first task; mirror writes
/// re-ensure it either way.
pub async fn build_state(cfg: GatewayConfig) -> anyhow::Result<Arc<AppState>> {
    let pool = MySqlPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(&cfg.engine_database_url)
        .context("parse engine database URL")?;

    let timeout = Duration::from_secs(cfg.http_timeout_secs);
    let broker: Arc<dyn Broker> =
        Arc::new(HttpBroker::new(&cfg.broker_url, timeout).context("init broker client")?);
    let store: Arc<dyn FileStore> = Arc::new(
        RemoteFileStore::new(&cfg.filestore_url, cfg.filestore_api_key.clone(), timeout)
            .context("init file-store client")?,
    );

    let state = Arc::new(AppState {
        cfg,
        pool,
        broker,
        store,
        registry: TaskRegistry::default(),
    });

    if let Err(err) = task::ensure_schema(&state.pool).await {
        tracing::warn!(
            event = "gateway.schema.deferred",
            error = %err,
            "task mirror schema not ready; store may still be down"
        );
    }

    Ok(state)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/:task_id", get(task_status))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: Uuid,
    status: &'static str,
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<Json<SubmitResponse>> {
    if spec.owner.trim().is_empty() || spec.dataset.trim().is_empty() {
        return Err(ApiError::bad_request("owner and dataset are required"));
    }

    let task_id = Uuid::new_v4();
    let cancel = state.registry.insert(task_id, &spec).await;
    tracing::info!(
        event = "gateway.task.submitted",
        task_id = %task_id,
        owner = %spec.owner,
        dataset = %spec.dataset,
        "task submitted"
    );

    let pipeline = Pipeline::new(state.clone());
    tokio::spawn(pipeline.run(task_id, spec, cancel));

    Ok(Json(SubmitResponse {
        task_id,
        status: "submitted",
    }))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskView>> {
    state
        .registry
        .view(task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("unknown task"))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.registry.cancel(task_id).await {
        CancelOutcome::Unknown => Err(ApiError::not_found("unknown task")),
        CancelOutcome::AlreadyFinished => Err(ApiError::conflict("task already finished")),
        CancelOutcome::Requested => {
            tracing::info!(
                event = "gateway.task.cancel_requested",
                task_id = %task_id,
                "cancellation requested"
            );
            Ok(Json(serde_json::json!({
                "task_id": task_id,
                "status": "cancelling",
            })))
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn conflict(message: &'static str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
