use std::path::PathBuf;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::RpcError, rpc_state::RpcState};

#[derive(Debug, Deserialize)]
pub struct IngestStartParams {
    pub paths: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Serialize)]
pub struct IngestStartResponse {
    pub task_id: String,
}

pub async fn ingest_start(
    State(state): State<RpcState>,
    Json(params): Json<IngestStartParams>,
) -> Result<impl IntoResponse, RpcError> {
    let paths: Vec<PathBuf> = params.paths.iter().map(PathBuf::from).collect();
    info!(
        roots = paths.len(),
        recursive = params.recursive,
        watch = params.watch,
        "ingest.start received"
    );

    let task_id = state
        .pipeline
        .ingest(paths, params.recursive, params.watch)?;

    Ok((StatusCode::OK, Json(IngestStartResponse { task_id })))
}

#[derive(Debug, Deserialize)]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct IngestStatusResponse {
    pub status: ingestion_pipeline::TaskStatus,
    pub processed: usize,
    pub total: usize,
    pub written: usize,
    pub errors: Vec<ingestion_pipeline::task::TaskError>,
}

pub async fn ingest_status(
    State(state): State<RpcState>,
    Json(params): Json<TaskIdParams>,
) -> Result<impl IntoResponse, RpcError> {
    let snapshot = state
        .pipeline
        .status(&params.task_id)
        .ok_or_else(|| RpcError::NotFound(format!("task '{}'", params.task_id)))?;

    Ok((
        StatusCode::OK,
        Json(IngestStatusResponse {
            status: snapshot.status,
            processed: snapshot.processed,
            total: snapshot.total,
            written: snapshot.written,
            errors: snapshot.errors.clone(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn ingest_cancel(
    State(state): State<RpcState>,
    Json(params): Json<TaskIdParams>,
) -> Result<impl IntoResponse, RpcError> {
    if state.pipeline.status(&params.task_id).is_none() {
        return Err(RpcError::NotFound(format!("task '{}'", params.task_id)));
    }

    let ok = state.pipeline.cancel(&params.task_id);
    info!(task_id = %params.task_id, ok, "ingest.cancel received");
    Ok((StatusCode::OK, Json(OkResponse { ok })))
}
