use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::debug;

use crate::{
    error::RpcError,
    routes::ingest::OkResponse,
    rpc_state::{RpcState, SessionEvent},
};

/// Best-effort: a full queue drops the event rather than blocking the
/// caller; the ack still goes out.
pub async fn session_event(
    State(state): State<RpcState>,
    Json(event): Json<SessionEvent>,
) -> Result<impl IntoResponse, RpcError> {
    match state.session_events.try_send(event) {
        Ok(()) => {}
        Err(err) => {
            debug!(error = %err, "session event dropped");
        }
    }

    Ok((StatusCode::OK, Json(OkResponse { ok: true })))
}
