#![allow(clippy::missing_docs_in_private_items)]

use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use routes::{
    health::health,
    ingest::{ingest_cancel, ingest_start, ingest_status},
    search::search,
    session::session_event,
};

pub mod error;
pub mod routes;
pub mod rpc_state;

pub use rpc_state::{session_channel, RpcState, SessionEvent};

/// Router for the local RPC surface, version 1. One request, one response;
/// ingest progress is polled via `ingest/status`.
pub fn rpc_routes_v1<S>(_state: &RpcState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    RpcState: FromRef<S>,
{
    Router::new()
        .route("/ingest/start", post(ingest_start))
        .route("/ingest/status", post(ingest_status))
        .route("/ingest/cancel", post(ingest_cancel))
        .route("/search", post(search))
        .route("/session_event", post(session_event))
        .route("/health", get(health))
}
