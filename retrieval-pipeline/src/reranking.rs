use std::cmp::Ordering;
use std::sync::Arc;

use common::{
    backends::{RerankScore, RerankerBackend},
    error::AppError,
};
use tracing::debug;

/// Second-stage scorer over any backend declaring `text-reranking`. Inputs
/// beyond the per-call bound are split into batches whose results are
/// concatenated and resorted; ties break on the original candidate index.
pub struct RerankerAdapter {
    max_docs_per_call: usize,
}

impl RerankerAdapter {
    pub fn new(max_docs_per_call: usize) -> Self {
        Self {
            max_docs_per_call: max_docs_per_call.max(1),
        }
    }

    pub async fn rerank(
        &self,
        backend: &Arc<dyn RerankerBackend>,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankScore>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<RerankScore> = Vec::with_capacity(documents.len());
        let mut offset = 0usize;

        for batch in documents.chunks(self.max_docs_per_call) {
            let results = backend
                .rerank(query, batch.to_vec(), false)
                .await
                .map_err(|err| err.in_operation("rerank", backend.id()))?;

            // Indices come back batch-local; rebase into the caller's order.
            scored.extend(results.into_iter().map(|result| RerankScore {
                index: result.index + offset,
                score: result.score,
                document: result.document,
            }));
            offset += batch.len();
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });

        debug!(
            backend = backend.id(),
            documents = offset,
            batches = offset.div_ceil(self.max_docs_per_call),
            "rerank complete"
        );
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Scores each document by its parsed numeric suffix; counts calls so
    /// batching is observable.
    struct SuffixScorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RerankerBackend for SuffixScorer {
        fn id(&self) -> &str {
            "suffix-scorer"
        }

        async fn ensure_available(&self) -> Result<(), AppError> {
            Ok(())
        }

        async fn rerank(
            &self,
            _query: &str,
            documents: Vec<String>,
            _return_documents: bool,
        ) -> Result<Vec<RerankScore>, AppError> {
            self.calls.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(documents
                .iter()
                .enumerate()
                .map(|(index, doc)| RerankScore {
                    index,
                    score: doc
                        .rsplit('-')
                        .next()
                        .and_then(|suffix| suffix.parse::<f32>().ok())
                        .unwrap_or(0.0),
                    document: None,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn oversized_input_is_batched_and_resorted_globally() {
        let backend: Arc<dyn RerankerBackend> = Arc::new(SuffixScorer {
            calls: AtomicUsize::new(0),
        });
        let adapter = RerankerAdapter::new(2);

        let docs = vec![
            "doc-1".to_string(),
            "doc-9".to_string(),
            "doc-5".to_string(),
            "doc-7".to_string(),
            "doc-3".to_string(),
        ];
        let scored = adapter
            .rerank(&backend, "query", docs)
            .await
            .expect("rerank");

        let order: Vec<usize> = scored.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![1, 3, 2, 4, 0]);
        assert!(scored.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn ties_break_on_original_candidate_index() {
        struct ConstantScorer;

        #[async_trait]
        impl RerankerBackend for ConstantScorer {
            fn id(&self) -> &str {
                "constant"
            }
            async fn ensure_available(&self) -> Result<(), AppError> {
                Ok(())
            }
            async fn rerank(
                &self,
                _query: &str,
                documents: Vec<String>,
                _return_documents: bool,
            ) -> Result<Vec<RerankScore>, AppError> {
                Ok(documents
                    .iter()
                    .enumerate()
                    .map(|(index, _)| RerankScore {
                        index,
                        score: 0.5,
                        document: None,
                    })
                    .collect())
            }
        }

        let backend: Arc<dyn RerankerBackend> = Arc::new(ConstantScorer);
        let adapter = RerankerAdapter::new(2);
        let scored = adapter
            .rerank(
                &backend,
                "query",
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .expect("rerank");

        let order: Vec<usize> = scored.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let backend: Arc<dyn RerankerBackend> = Arc::new(SuffixScorer {
            calls: AtomicUsize::new(0),
        });
        let adapter = RerankerAdapter::new(4);
        let scored = adapter
            .rerank(&backend, "query", Vec::new())
            .await
            .expect("rerank");
        assert!(scored.is_empty());
    }
}
