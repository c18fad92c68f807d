use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::backends::BackendStatus;
use serde::Serialize;
use storage_coordinator::TierHealth;

use crate::{error::RpcError, rpc_state::RpcState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub backends: Vec<BackendStatus>,
    pub tiers: Vec<TierHealth>,
}

pub async fn health(State(state): State<RpcState>) -> Result<impl IntoResponse, RpcError> {
    let backends = state.registry.health().await;
    let tiers = state.coordinator.tier_health().await;

    Ok((StatusCode::OK, Json(HealthResponse { backends, tiers })))
}
