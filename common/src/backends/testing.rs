//! Deterministic in-process backends for the test suites. No network, no
//! model downloads; embeddings reflect token overlap so similarity-based
//! assertions behave predictably.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    backends::{
        BackendInstance, CompletionBackend, EmbeddingBackend, RerankScore, RerankerBackend,
    },
    error::AppError,
};

#[derive(Debug, Clone, Copy)]
pub enum FixtureKind {
    Embedding,
    Completion,
    Reranker,
}

pub fn fixture_instance(id: &str, dimension: usize, kind: FixtureKind) -> BackendInstance {
    match kind {
        FixtureKind::Embedding => {
            BackendInstance::Embedding(Arc::new(FixtureEmbeddingBackend::new(id, dimension)))
        }
        FixtureKind::Completion => {
            BackendInstance::Completion(Arc::new(FixtureCompletionBackend::new(id)))
        }
        FixtureKind::Reranker => {
            BackendInstance::Reranker(Arc::new(FixtureRerankerBackend::new(id)))
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Token-bucket embedding: each token increments one dimension, then the
/// vector is L2-normalized. Shared vocabulary yields positive cosine
/// similarity, which is all the retrieval tests need.
pub fn fixture_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dimension.max(1)];
    for token in tokenize(text) {
        let index = (fnv1a(&token) % vector.len() as u64) as usize;
        if let Some(slot) = vector.get_mut(index) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

pub struct FixtureEmbeddingBackend {
    id: String,
    dimension: usize,
}

impl FixtureEmbeddingBackend {
    pub fn new(id: &str, dimension: usize) -> Self {
        Self {
            id: id.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for FixtureEmbeddingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(inputs
            .iter()
            .map(|input| fixture_embedding(input, self.dimension))
            .collect())
    }
}

/// Scripted completions: tests queue responses, calls drain the queue.
/// An empty queue yields an empty object, which callers treat as a schema
/// failure.
pub struct FixtureCompletionBackend {
    id: String,
    responses: Mutex<VecDeque<serde_json::Value>>,
}

impl FixtureCompletionBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_response(&self, response: serde_json::Value) {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(response);
    }
}

#[async_trait]
impl CompletionBackend for FixtureCompletionBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn complete_json(
        &self,
        _system: &str,
        _user: &str,
        _schema_name: &str,
        _schema: serde_json::Value,
        _temperature: f32,
    ) -> Result<serde_json::Value, AppError> {
        let next = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or_else(|| serde_json::json!({})))
    }
}

/// Scores each document by query-token overlap; deterministic and cheap.
pub struct FixtureRerankerBackend {
    id: String,
}

impl FixtureRerankerBackend {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl RerankerBackend for FixtureRerankerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
        return_documents: bool,
    ) -> Result<Vec<RerankScore>, AppError> {
        let query_tokens: Vec<String> = tokenize(query).collect();

        let mut scored: Vec<RerankScore> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_tokens: Vec<String> = tokenize(doc).collect();
                let overlap = query_tokens
                    .iter()
                    .filter(|token| doc_tokens.contains(token))
                    .count();
                let score = if doc_tokens.is_empty() {
                    0.0
                } else {
                    overlap as f32 / doc_tokens.len() as f32
                };
                RerankScore {
                    index,
                    score,
                    document: return_documents.then(|| doc.clone()),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });

        Ok(scored)
    }
}

/// A backend whose readiness probe always fails; used to exercise
/// degradation paths.
pub struct UnavailableRerankerBackend {
    id: String,
}

impl UnavailableRerankerBackend {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl RerankerBackend for UnavailableRerankerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        Err(AppError::Transient("reranker is down".into()))
    }

    async fn rerank(
        &self,
        _query: &str,
        _documents: Vec<String>,
        _return_documents: bool,
    ) -> Result<Vec<RerankScore>, AppError> {
        Err(AppError::Transient("reranker is down".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_embeddings_are_deterministic_and_normalized() {
        let a = fixture_embedding("hello world", 32);
        let b = fixture_embedding("hello world", 32);
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_tokens_score_higher_than_disjoint() {
        let query = fixture_embedding("hello world", 32);
        let near = fixture_embedding("hello universe", 32);
        let far = fixture_embedding("quarterly revenue report", 32);

        let cos = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b).map(|(x, y)| x * y).sum()
        };
        assert!(cos(&query, &near) > cos(&query, &far));
    }

    #[tokio::test]
    async fn reranker_prefers_documents_sharing_query_tokens() {
        let reranker = FixtureRerankerBackend::new("fixture");
        let results = reranker
            .rerank(
                "tokio scheduler",
                vec![
                    "gardening tips".to_string(),
                    "the tokio scheduler explained".to_string(),
                ],
                false,
            )
            .await
            .expect("rerank");

        assert_eq!(results[0].index, 1);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn completion_queue_drains_in_order() {
        let backend = FixtureCompletionBackend::new("fixture");
        backend.push_response(serde_json::json!({"first": true}));
        backend.push_response(serde_json::json!({"second": true}));

        let first = backend
            .complete_json("s", "u", "schema", serde_json::json!({}), 0.0)
            .await
            .expect("first");
        assert_eq!(first, serde_json::json!({"first": true}));

        let second = backend
            .complete_json("s", "u", "schema", serde_json::json!({}), 0.0)
            .await
            .expect("second");
        assert_eq!(second, serde_json::json!({"second": true}));

        let drained = backend
            .complete_json("s", "u", "schema", serde_json::json!({}), 0.0)
            .await
            .expect("drained");
        assert_eq!(drained, serde_json::json!({}));
    }
}
