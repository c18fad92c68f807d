#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod budget;
pub mod filter;
pub mod pipeline;
pub mod reranking;
pub mod scoring;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pipeline::RetrievalEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Fulltext,
    Hybrid,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Semantic => "semantic",
            Self::Fulltext => "fulltext",
            Self::Hybrid => "hybrid",
        };
        f.write_str(label)
    }
}

/// Structural constraints on a search, split by the engine into a cheap
/// tier-side part and a residual post-filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub path_globs: Vec<String>,
    #[serde(default)]
    pub qntm_keys: Vec<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_consolidation_level: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub limit: usize,
    #[serde(default)]
    pub filter: Option<SearchFilter>,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default)]
    pub budget_tokens: Option<usize>,
}

/// Raw per-stage scores kept alongside the normalized response score.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RawScores {
    pub semantic: Option<f32>,
    pub fulltext: Option<f32>,
    pub fused: Option<f32>,
    pub rerank: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Normalized to [0,1] within this response.
    pub score: f32,
    pub raw_scores: RawScores,
    pub text: String,
    pub file_path: String,
    pub file_name: String,
    pub qntm_keys: Vec<String>,
    pub consolidation_level: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Set when reranking was requested but skipped or failed.
    pub degraded_rerank: bool,
}
