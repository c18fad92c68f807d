use std::sync::Arc;

use common::backends::registry::BackendRegistry;
use ingestion_pipeline::IngestionPipeline;
use retrieval_pipeline::RetrievalEngine;
use serde::{Deserialize, Serialize};
use storage_coordinator::StorageCoordinator;
use tokio::sync::mpsc;

/// Best-effort editor/session signal; queued for background enrichment,
/// never persisted on the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Bounded queue between the RPC surface and the enrichment consumer.
pub fn session_channel(capacity: usize) -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(capacity.max(1))
}

#[derive(Clone)]
pub struct RpcState {
    pub pipeline: Arc<IngestionPipeline>,
    pub retrieval: Arc<RetrievalEngine>,
    pub coordinator: Arc<StorageCoordinator>,
    pub registry: Arc<BackendRegistry>,
    pub session_events: mpsc::Sender<SessionEvent>,
}
