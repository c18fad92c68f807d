use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use retrieval_pipeline::{SearchHit, SearchRequest};
use serde::Serialize;

use crate::{error::RpcError, rpc_state::RpcState};

#[derive(Debug, Serialize)]
pub struct DegradedFlags {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SearchRpcResponse {
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<DegradedFlags>,
}

pub async fn search(
    State(state): State<RpcState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, RpcError> {
    let response = state.retrieval.search(request).await?;

    let degraded = response.degraded_rerank.then_some(DegradedFlags {
        rerank: Some(true),
    });

    Ok((
        StatusCode::OK,
        Json(SearchRpcResponse {
            results: response.results,
            degraded,
        }),
    ))
}
