use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    backends::{registry::BackendRegistry, EmbeddingModality},
    error::AppError,
    storage::{tiers::ScoredId, types::chunk::Chunk},
    utils::config::{RerankingConfig, RetrievalConfig},
};
use storage_coordinator::StorageCoordinator;
use tracing::{debug, info, instrument, warn};

use crate::{
    budget,
    filter::{self, SplitFilter},
    reranking::RerankerAdapter,
    scoring::{min_max_normalize, reciprocal_rank_fusion, FusedCandidate},
    RawScores, SearchHit, SearchMode, SearchRequest, SearchResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Embed,
    CollectCandidates,
    Hydrate,
    Rerank,
    Pack,
}

/// Wall-clock per stage, logged with the response for tuning.
#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }
}

struct SearchContext {
    request: SearchRequest,
    split: SplitFilter,
    query_embedding: Option<Vec<f32>>,
    semantic: Vec<ScoredId>,
    fulltext: Vec<ScoredId>,
    fused: Vec<FusedCandidate>,
    hits: Vec<(Chunk, RawScores, f32)>,
    degraded_rerank: bool,
    timings: PipelineStageTimings,
}

/// Executes semantic, full-text, and hybrid queries against the coordinator,
/// with optional reranking and token-budget packing.
pub struct RetrievalEngine {
    coordinator: Arc<StorageCoordinator>,
    registry: Arc<BackendRegistry>,
    config: RetrievalConfig,
    adapter: RerankerAdapter,
}

impl RetrievalEngine {
    pub fn new(
        coordinator: Arc<StorageCoordinator>,
        registry: Arc<BackendRegistry>,
        config: RetrievalConfig,
        reranking: &RerankingConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            config,
            adapter: RerankerAdapter::new(reranking.max_docs_per_call),
        }
    }

    #[instrument(skip_all, fields(mode = %request.mode, limit = request.limit))]
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, AppError> {
        if request.query.trim().is_empty() {
            return Err(AppError::Validation("query must not be empty".into()));
        }
        if request.limit == 0 {
            return Err(AppError::Validation("limit must be at least 1".into()));
        }

        let split = filter::split(request.filter.as_ref());
        let mut ctx = SearchContext {
            request,
            split,
            query_embedding: None,
            semantic: Vec::new(),
            fulltext: Vec::new(),
            fused: Vec::new(),
            hits: Vec::new(),
            degraded_rerank: false,
            timings: PipelineStageTimings::default(),
        };

        let start = Instant::now();
        self.embed_query(&mut ctx).await?;
        ctx.timings.record(StageKind::Embed, start.elapsed());

        let start = Instant::now();
        self.collect_candidates(&mut ctx).await?;
        ctx.timings.record(StageKind::CollectCandidates, start.elapsed());

        let start = Instant::now();
        self.hydrate(&mut ctx).await?;
        ctx.timings.record(StageKind::Hydrate, start.elapsed());

        let start = Instant::now();
        self.rerank(&mut ctx).await;
        ctx.timings.record(StageKind::Rerank, start.elapsed());

        let start = Instant::now();
        let response = self.pack(&mut ctx);
        ctx.timings.record(StageKind::Pack, start.elapsed());

        info!(
            results = response.results.len(),
            degraded_rerank = response.degraded_rerank,
            embed_ms = ctx.timings.stage_ms(StageKind::Embed) as u64,
            candidates_ms = ctx.timings.stage_ms(StageKind::CollectCandidates) as u64,
            hydrate_ms = ctx.timings.stage_ms(StageKind::Hydrate) as u64,
            rerank_ms = ctx.timings.stage_ms(StageKind::Rerank) as u64,
            "search complete"
        );
        Ok(response)
    }

    async fn embed_query(&self, ctx: &mut SearchContext) -> Result<(), AppError> {
        if ctx.request.mode == SearchMode::Fulltext {
            return Ok(());
        }

        match self.registry.embedding(EmbeddingModality::Text).await {
            Ok(backend) => {
                let mut embeddings = backend
                    .embed(std::slice::from_ref(&ctx.request.query))
                    .await
                    .map_err(|err| err.in_operation("embed query", "search"))?;
                ctx.query_embedding = embeddings.pop();
                Ok(())
            }
            Err(err @ AppError::CapabilityUnavailable(_)) => {
                if ctx.request.mode == SearchMode::Semantic {
                    return Err(err);
                }
                // Hybrid degrades to its full-text half.
                warn!("text embedding unavailable; hybrid search runs full-text only");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn collect_candidates(&self, ctx: &mut SearchContext) -> Result<(), AppError> {
        let overfetch = if ctx.request.rerank {
            self.config.overfetch_rerank
        } else {
            self.config.overfetch
        };
        let take = ((ctx.request.limit as f32 * overfetch).ceil() as usize)
            .clamp(ctx.request.limit, self.config.hard_max_candidates);

        if let Some(embedding) = ctx.query_embedding.clone() {
            ctx.semantic = self
                .coordinator
                .semantic_candidates(EmbeddingModality::Text, embedding, take, &ctx.split.tier)
                .await?;
        }
        if matches!(ctx.request.mode, SearchMode::Fulltext | SearchMode::Hybrid) {
            ctx.fulltext = self
                .coordinator
                .fulltext_candidates(&ctx.request.query, take, &ctx.split.tier)
                .await?;
        }

        ctx.fused = match ctx.request.mode {
            SearchMode::Semantic => single_list(&ctx.semantic, true),
            SearchMode::Fulltext => single_list(&ctx.fulltext, false),
            SearchMode::Hybrid => {
                reciprocal_rank_fusion(&ctx.semantic, &ctx.fulltext, self.config.rrf_k)
            }
        };

        debug!(
            semantic = ctx.semantic.len(),
            fulltext = ctx.fulltext.len(),
            fused = ctx.fused.len(),
            take,
            "candidates collected"
        );
        Ok(())
    }

    async fn hydrate(&self, ctx: &mut SearchContext) -> Result<(), AppError> {
        let ids: Vec<String> = ctx
            .fused
            .iter()
            .map(|candidate| candidate.chunk_id.clone())
            .collect();
        let chunks = self.coordinator.hydrate(&ids).await?;

        let mut hits = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if !ctx.split.residual.matches(&chunk) {
                continue;
            }
            let Some(candidate) = ctx.fused.iter().find(|c| c.chunk_id == chunk.id) else {
                continue;
            };
            let raw = RawScores {
                semantic: candidate.semantic,
                fulltext: candidate.fulltext,
                fused: Some(candidate.fused),
                rerank: None,
            };
            hits.push((chunk, raw, candidate.fused));
        }
        ctx.hits = hits;
        Ok(())
    }

    /// Optional second stage. Every failure path degrades gracefully: the
    /// response keeps its first-stage ranking and carries the degraded flag.
    async fn rerank(&self, ctx: &mut SearchContext) {
        if !ctx.request.rerank || ctx.hits.is_empty() {
            return;
        }

        let backend = match self.registry.reranker().await {
            Ok(backend) => backend,
            Err(AppError::CapabilityUnavailable(_)) => {
                debug!("no reranking backend bound; skipping rerank");
                ctx.degraded_rerank = true;
                return;
            }
            Err(err) => {
                warn!(error = %err, "reranker resolution failed; skipping rerank");
                ctx.degraded_rerank = true;
                return;
            }
        };

        let documents: Vec<String> = ctx
            .hits
            .iter()
            .map(|(chunk, _, _)| chunk.payload.text().to_string())
            .collect();
        let scored = match self
            .adapter
            .rerank(&backend, &ctx.request.query, documents)
            .await
        {
            Ok(scored) => scored,
            Err(err) => {
                warn!(error = %err, "rerank failed; returning first-stage ranking");
                ctx.degraded_rerank = true;
                return;
            }
        };

        let mut reranked = Vec::with_capacity(scored.len());
        for result in scored {
            if let Some((chunk, mut raw, _)) = ctx
                .hits
                .get(result.index)
                .map(|(chunk, raw, order)| (chunk.clone(), *raw, *order))
            {
                raw.rerank = Some(result.score);
                reranked.push((chunk, raw, result.score));
            }
        }
        ctx.hits = reranked;
    }

    fn pack(&self, ctx: &mut SearchContext) -> SearchResponse {
        let hits = std::mem::take(&mut ctx.hits);
        let degraded_rerank = ctx.degraded_rerank;

        let ordering_scores: Vec<f32> = hits.iter().map(|(_, _, order)| *order).collect();
        let normalized = min_max_normalize(&ordering_scores);

        let mut results: Vec<SearchHit> = hits
            .into_iter()
            .zip(normalized)
            .map(|((chunk, raw, _), score)| {
                let payload = chunk.payload.v1();
                SearchHit {
                    id: chunk.id.clone(),
                    score,
                    raw_scores: raw,
                    text: payload.original_text.clone(),
                    file_path: payload.file_path.clone(),
                    file_name: payload.file_name.clone(),
                    qntm_keys: payload.qntm_keys.clone(),
                    consolidation_level: chunk.consolidation_level,
                }
            })
            .collect();

        results.truncate(ctx.request.limit);
        if let Some(budget_tokens) = ctx.request.budget_tokens {
            results = budget::pack(results, budget_tokens, self.config.per_result_token_overhead);
        }

        SearchResponse {
            results,
            degraded_rerank,
        }
    }
}

fn single_list(hits: &[ScoredId], semantic: bool) -> Vec<FusedCandidate> {
    hits.iter()
        .map(|hit| FusedCandidate {
            chunk_id: hit.chunk_id.clone(),
            fused: hit.score,
            semantic: semantic.then_some(hit.score),
            fulltext: (!semantic).then_some(hit.score),
        })
        .collect()
}
