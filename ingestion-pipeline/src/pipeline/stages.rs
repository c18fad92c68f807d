use std::collections::BTreeMap;
use std::path::PathBuf;

use common::{
    backends::{registry::BackendRegistry, EmbeddingModality},
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkPayloadV1, ContentKind},
        source::Source,
        vector_record::{VectorPoint, VectorRecord},
    },
    utils::hashing::content_hash,
};
use state_machines::core::GuardError;
use storage_coordinator::{ChunkBatch, StorageCoordinator, UpsertReport};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    chunker::{classify, file_type, Chunker, RawChunk},
    tracker::{FileTracker, IngestDecision},
};

use super::state::{
    Chunked, Decided, Embedded, FileMachine, Persisted, Ready, Recorded,
};

/// Schema for the optional semantic-key enrichment step.
pub fn qntm_key_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "keys": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": 8
            }
        },
        "required": ["keys"],
        "additionalProperties": false
    })
}

const QNTM_KEY_SYSTEM_MESSAGE: &str = "You assign short semantic tags to developer \
documents. Return 2-8 lowercase hyphenated tags capturing the document's topics. \
Respond only with JSON matching the provided schema.";

/// Transient-error retry budget for backend and tier calls inside stages.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &common::utils::config::IngestConfig) -> Self {
        Self {
            attempts: config.retries,
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
        }
    }
}

async fn retried<T, F, Fut>(policy: &RetryPolicy, action: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let strategy = ExponentialBackoff::from_millis(policy.base_ms)
        .max_delay(std::time::Duration::from_millis(policy.max_ms))
        .map(jitter)
        .take(policy.attempts);
    RetryIf::spawn(strategy, action, |err: &AppError| err.is_retryable()).await
}

/// Everything one file's ingestion accumulates while walking the machine.
pub struct FileContext<'a> {
    pub tracker: &'a FileTracker,
    pub coordinator: &'a StorageCoordinator,
    pub registry: &'a BackendRegistry,
    pub chunker: &'a Chunker,
    pub cancel: &'a CancellationToken,
    pub retry: RetryPolicy,

    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub file_hash: String,
    pub file_mtime: i64,
    pub source_id: String,

    pub decision: Option<IngestDecision>,
    pub raw_chunks: Vec<RawChunk>,
    pub qntm_keys: Vec<String>,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<VectorPoint>,
    pub report: Option<UpsertReport>,
}

impl<'a> FileContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: &'a FileTracker,
        coordinator: &'a StorageCoordinator,
        registry: &'a BackendRegistry,
        chunker: &'a Chunker,
        cancel: &'a CancellationToken,
        retry: RetryPolicy,
        path: PathBuf,
        bytes: Vec<u8>,
        file_mtime: i64,
    ) -> Self {
        let file_hash = content_hash(&bytes);
        let source_id = Source::id_for_path(&path.to_string_lossy());
        Self {
            tracker,
            coordinator,
            registry,
            chunker,
            cancel,
            retry,
            path,
            bytes,
            file_hash,
            file_mtime,
            source_id,
            decision: None,
            raw_chunks: Vec::new(),
            qntm_keys: Vec::new(),
            chunks: Vec::new(),
            vectors: Vec::new(),
            report: None,
        }
    }

    fn check_cancelled(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid file ingestion transition during {event}: {guard:?}"
    ))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path.display()))]
pub async fn decide(
    machine: FileMachine<(), Ready>,
    ctx: &mut FileContext<'_>,
) -> Result<FileMachine<(), Decided>, AppError> {
    ctx.check_cancelled()?;

    let decision = ctx
        .tracker
        .needs_ingestion(&ctx.path, &ctx.file_hash, ctx.file_mtime)
        .await;
    debug!(path = %ctx.path.display(), ?decision, "change check complete");
    ctx.decision = Some(decision);

    machine
        .decide()
        .map_err(|(_, guard)| map_guard_error("decide", &guard))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path.display()))]
pub fn split(
    machine: FileMachine<(), Decided>,
    ctx: &mut FileContext<'_>,
) -> Result<FileMachine<(), Chunked>, AppError> {
    ctx.raw_chunks = ctx.chunker.chunk(&ctx.path, &ctx.bytes);
    debug!(
        path = %ctx.path.display(),
        chunks = ctx.raw_chunks.len(),
        "file split into chunks"
    );

    machine
        .split()
        .map_err(|(_, guard)| map_guard_error("split", &guard))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path.display()))]
pub async fn embed(
    machine: FileMachine<(), Chunked>,
    ctx: &mut FileContext<'_>,
) -> Result<FileMachine<(), Embedded>, AppError> {
    ctx.check_cancelled()?;

    ctx.qntm_keys = enrich_keys(ctx).await;

    let total = ctx.raw_chunks.len() as u32;
    let file_path = ctx.path.to_string_lossy().into_owned();
    let file_name = ctx
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.clone());
    let extension = file_type(&ctx.path);

    let mut chunks = Vec::with_capacity(ctx.raw_chunks.len());
    for (index, raw) in ctx.raw_chunks.iter().enumerate() {
        let payload = ChunkPayloadV1 {
            original_text: raw.text.clone(),
            file_path: file_path.clone(),
            file_name: file_name.clone(),
            file_type: extension.clone(),
            content_type: raw.content_type,
            byte_start: raw.byte_start,
            byte_end: raw.byte_end,
            qntm_keys: ctx.qntm_keys.clone(),
            embedding_models: BTreeMap::new(),
            merge: None,
            extra: BTreeMap::new(),
        };
        chunks.push(Chunk::new(
            ctx.source_id.clone(),
            index as u32,
            total,
            content_hash(raw.text.as_bytes()),
            payload,
        ));
    }

    let kind = classify(&ctx.path);
    let mut vectors = Vec::new();
    for modality in EmbeddingModality::ALL {
        if !modality_applies(modality, kind) {
            continue;
        }
        ctx.check_cancelled()?;

        // Absent backends mean the modality is skipped, never fabricated.
        let backend = match ctx.registry.embedding(modality).await {
            Ok(backend) => backend,
            Err(AppError::CapabilityUnavailable(capability)) => {
                debug!(%capability, "embedding modality unavailable; skipping");
                continue;
            }
            Err(err) => return Err(err),
        };

        let inputs: Vec<String> = chunks
            .iter()
            .map(|chunk| modality_input(modality, chunk))
            .collect();
        let embeddings = retried(&ctx.retry, || backend.embed(&inputs))
            .await
            .map_err(|err| err.in_operation("embed", &ctx.source_id))?;

        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk
                .payload
                .v1_mut()
                .embedding_models
                .insert(modality.as_str().to_string(), backend.id().to_string());
            vectors.push(VectorPoint {
                modality,
                record: VectorRecord::for_chunk(chunk, embedding),
            });
        }
    }

    ctx.chunks = chunks;
    ctx.vectors = vectors;

    machine
        .embed()
        .map_err(|(_, guard)| map_guard_error("embed", &guard))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path.display()))]
pub async fn persist(
    machine: FileMachine<(), Embedded>,
    ctx: &mut FileContext<'_>,
) -> Result<FileMachine<(), Persisted>, AppError> {
    ctx.check_cancelled()?;

    let batch = ChunkBatch {
        source: Source::new(
            ctx.path.to_string_lossy().into_owned(),
            ctx.file_hash.clone(),
            ctx.file_mtime,
        ),
        chunks: ctx.chunks.clone(),
        vectors: ctx.vectors.clone(),
    };
    let report = retried(&ctx.retry, || ctx.coordinator.upsert_batch(batch.clone()))
        .await
        .map_err(|err| err.in_operation("persist", &ctx.source_id))?;
    ctx.report = Some(report);

    machine
        .persist()
        .map_err(|(_, guard)| map_guard_error("persist", &guard))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path.display()))]
pub async fn record(
    machine: FileMachine<(), Persisted>,
    ctx: &mut FileContext<'_>,
) -> Result<FileMachine<(), Recorded>, AppError> {
    ctx.tracker
        .record_ingestion(&ctx.path, &ctx.file_hash, ctx.file_mtime)
        .await?;

    machine
        .record()
        .map_err(|(_, guard)| map_guard_error("record", &guard))
}

const fn modality_applies(modality: EmbeddingModality, kind: ContentKind) -> bool {
    match modality {
        EmbeddingModality::Text => true,
        EmbeddingModality::Code => matches!(kind, ContentKind::Code),
        EmbeddingModality::Contextualized => matches!(kind, ContentKind::Prose),
    }
}

fn modality_input(modality: EmbeddingModality, chunk: &Chunk) -> String {
    let payload = chunk.payload.v1();
    match modality {
        EmbeddingModality::Text | EmbeddingModality::Code => payload.original_text.clone(),
        // The contextualized space sees the document location alongside the body.
        EmbeddingModality::Contextualized => {
            format!("{}\n{}", payload.file_path, payload.original_text)
        }
    }
}

/// Character budget for the enrichment prompt.
const ENRICHMENT_PREVIEW_CHARS: usize = 4_000;

/// Ask the json-completion capability for semantic keys. Best effort: an
/// absent backend or an unusable answer leaves the file untagged.
async fn enrich_keys(ctx: &FileContext<'_>) -> Vec<String> {
    let backend = match ctx.registry.completion().await {
        Ok(backend) => backend,
        Err(AppError::CapabilityUnavailable(_)) => return Vec::new(),
        Err(err) => {
            warn!(error = %err, "completion backend unavailable for key enrichment");
            return Vec::new();
        }
    };

    let preview: String = ctx
        .raw_chunks
        .iter()
        .flat_map(|chunk| chunk.text.chars())
        .take(ENRICHMENT_PREVIEW_CHARS)
        .collect();
    let user = format!("File: {}\n\n{}", ctx.path.display(), preview);

    match backend
        .complete_json(QNTM_KEY_SYSTEM_MESSAGE, &user, "semantic_keys", qntm_key_schema(), 0.0)
        .await
    {
        Ok(value) => value
            .get("keys")
            .and_then(|keys| keys.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| key.as_str())
                    .map(common::storage::types::qntm_key::normalize_key)
                    .filter(|key| !key.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, path = %ctx.path.display(), "key enrichment failed; continuing untagged");
            Vec::new()
        }
    }
}
