#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Reduces redundancy by letting a JSON-capable LLM judge pairwise chunk
//! relationships. Consolidation only ever supersedes; physical removal stays
//! behind the coordinator's grace-window vacuum.

pub mod judgment;
pub mod pairs;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{
    backends::{registry::BackendRegistry, CompletionBackend, EmbeddingModality},
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkPayloadV1, MergeProvenance},
        vector_record::{VectorPoint, VectorRecord},
    },
    utils::{config::ConsolidationConfig, hashing::content_hash},
};
use storage_coordinator::StorageCoordinator;
use tracing::{debug, info, instrument, warn};

pub use judgment::{KeepSide, MergeDirection, PairJudgment, PairRelation};
pub use pairs::{CandidatePair, ProximityStrategy};

use judgment::{judgment_schema, JUDGMENT_SYSTEM_MESSAGE};

/// Character budget per chunk inside the judgment prompt.
const PROMPT_CHUNK_CHARS: usize = 6_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub judged: usize,
    pub superseded: usize,
    pub merged: usize,
    pub unrelated: usize,
    pub schema_failures: usize,
}

pub struct ConsolidationEngine {
    coordinator: Arc<StorageCoordinator>,
    registry: Arc<BackendRegistry>,
    config: ConsolidationConfig,
    strategy: ProximityStrategy,
}

impl ConsolidationEngine {
    pub fn new(
        coordinator: Arc<StorageCoordinator>,
        registry: Arc<BackendRegistry>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            config,
            strategy: ProximityStrategy::HashAndAdjacency,
        }
    }

    pub fn with_strategy(mut self, strategy: ProximityStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// One bounded consolidation pass: select pairs, judge each, apply the
    /// verdicts through the coordinator's normal write protocol.
    #[instrument(skip_all)]
    pub async fn run_once(&self) -> Result<ConsolidationReport, AppError> {
        let backend = self.registry.completion().await?;

        let pairs = pairs::select_pairs(
            &self.coordinator,
            &self.registry,
            self.strategy,
            self.config.similarity_floor,
            self.config.max_pairs_per_run,
        )
        .await?;

        let mut report = ConsolidationReport::default();
        for pair in pairs {
            // Judgments for earlier pairs may have superseded one side.
            if !self.still_active(&pair.first.id).await? || !self.still_active(&pair.second.id).await? {
                continue;
            }

            report.judged += 1;
            let (judgment, schema_failed) = self.judge(&backend, &pair).await;
            if schema_failed {
                report.schema_failures += 1;
            }
            debug!(
                first = %pair.first.id,
                second = %pair.second.id,
                relation = ?judgment.relation,
                keep = ?judgment.keep,
                "pair judged"
            );

            match judgment.relation {
                PairRelation::Unrelated => report.unrelated += 1,
                PairRelation::ContextualConvergence => {
                    self.apply_merge(&pair, &judgment).await?;
                    report.merged += 1;
                }
                PairRelation::DuplicateWork | PairRelation::SequentialIteration => {
                    match judgment.keep {
                        KeepSide::Both => report.unrelated += 1,
                        KeepSide::First => {
                            self.apply_supersede(&pair.second, &pair.first).await?;
                            report.superseded += 1;
                        }
                        KeepSide::Second => {
                            self.apply_supersede(&pair.first, &pair.second).await?;
                            report.superseded += 1;
                        }
                    }
                }
            }
        }

        info!(
            judged = report.judged,
            superseded = report.superseded,
            merged = report.merged,
            unrelated = report.unrelated,
            schema_failures = report.schema_failures,
            "consolidation run finished"
        );
        Ok(report)
    }

    async fn still_active(&self, chunk_id: &str) -> Result<bool, AppError> {
        Ok(self.coordinator.get_chunk(chunk_id).await?.is_some())
    }

    /// Ask for a verdict with temperature 0; invalid JSON is re-asked a
    /// bounded number of times, then the pair is recorded unrelated.
    async fn judge(
        &self,
        backend: &Arc<dyn CompletionBackend>,
        pair: &CandidatePair,
    ) -> (PairJudgment, bool) {
        let user = format!(
            "First chunk ({first_path}):\n{first}\n\nSecond chunk ({second_path}):\n{second}",
            first_path = pair.first.payload.file_path(),
            second_path = pair.second.payload.file_path(),
            first = truncate(pair.first.payload.text(), PROMPT_CHUNK_CHARS),
            second = truncate(pair.second.payload.text(), PROMPT_CHUNK_CHARS),
        );

        let attempts = self.config.schema_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let value = match backend
                .complete_json(
                    JUDGMENT_SYSTEM_MESSAGE,
                    &user,
                    "pair_judgment",
                    judgment_schema(),
                    self.config.temperature,
                )
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(attempt, error = %err, "judgment call failed");
                    continue;
                }
            };

            match serde_json::from_value::<PairJudgment>(value)
                .map_err(|err| err.to_string())
                .and_then(PairJudgment::validate)
            {
                Ok(judgment) => return (judgment, false),
                Err(err) => {
                    warn!(attempt, error = %err, "judgment failed schema validation");
                }
            }
        }

        (
            PairJudgment::unrelated("judgment did not validate within retry budget"),
            true,
        )
    }

    async fn apply_supersede(&self, loser: &Chunk, winner: &Chunk) -> Result<(), AppError> {
        self.coordinator
            .supersede_chunks(&[(loser.id.clone(), Some(winner.id.clone()))])
            .await?;

        let mut survivor = winner.clone();
        survivor.consolidation_level += 1;
        survivor.updated_at = chrono::Utc::now();
        let vectors = self.embed_for_text(&survivor).await;
        self.coordinator.upsert_chunk(survivor, vectors).await
    }

    /// Convergence: persist the synthesized chunk one level above its
    /// parents, then supersede both parents with it.
    async fn apply_merge(
        &self,
        pair: &CandidatePair,
        judgment: &PairJudgment,
    ) -> Result<(), AppError> {
        let Some(merged_text) = judgment.merged_text.as_deref() else {
            // validate() keeps this unreachable; stay defensive at the API edge.
            return Err(AppError::LLMParsing(
                "convergence verdict without merged text".into(),
            ));
        };

        let base = pair.first.payload.v1();
        let merged_payload = ChunkPayloadV1 {
            original_text: merged_text.to_string(),
            file_path: base.file_path.clone(),
            file_name: base.file_name.clone(),
            file_type: base.file_type.clone(),
            content_type: base.content_type,
            byte_start: 0,
            byte_end: merged_text.len() as u64,
            qntm_keys: merged_keys(&pair.first, &pair.second),
            embedding_models: BTreeMap::new(),
            merge: Some(MergeProvenance {
                merged_from: vec![pair.first.id.clone(), pair.second.id.clone()],
                relation: "contextual_convergence".to_string(),
            }),
            extra: BTreeMap::new(),
        };

        let mut merged = Chunk::new(
            pair.first.source_id.clone(),
            pair.first.chunk_index,
            pair.first.total_chunks,
            content_hash(merged_text.as_bytes()),
            merged_payload,
        );
        merged.consolidation_level = pair
            .first
            .consolidation_level
            .max(pair.second.consolidation_level)
            + 1;

        let vectors = self.embed_for_text(&merged).await;
        self.coordinator.upsert_chunk(merged.clone(), vectors).await?;
        self.coordinator
            .supersede_chunks(&[
                (pair.first.id.clone(), Some(merged.id.clone())),
                (pair.second.id.clone(), Some(merged.id.clone())),
            ])
            .await
    }

    /// Text-modality vector for a rewritten chunk; missing backends leave
    /// the chunk searchable through full-text only.
    async fn embed_for_text(&self, chunk: &Chunk) -> Vec<VectorPoint> {
        let backend = match self.registry.embedding(EmbeddingModality::Text).await {
            Ok(backend) => backend,
            Err(_) => return Vec::new(),
        };
        match backend
            .embed(std::slice::from_ref(&chunk.payload.text().to_string()))
            .await
        {
            Ok(mut embeddings) if !embeddings.is_empty() => vec![VectorPoint {
                modality: EmbeddingModality::Text,
                record: VectorRecord::for_chunk(chunk, embeddings.remove(0)),
            }],
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(chunk_id = %chunk.id, error = %err, "embedding for consolidated chunk failed");
                Vec::new()
            }
        }
    }
}

fn merged_keys(first: &Chunk, second: &Chunk) -> Vec<String> {
    let mut keys: Vec<String> = first
        .payload
        .qntm_keys()
        .iter()
        .chain(second.payload.qntm_keys())
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
