use common::storage::{tiers::TierFilter, types::chunk::Chunk, types::qntm_key::normalize_key};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::SearchFilter;

/// A request filter split into the part each tier evaluates in its own query
/// and the residual applied after hydration.
pub struct SplitFilter {
    pub tier: TierFilter,
    pub residual: ResidualFilter,
}

/// What the tiers cannot evaluate: path glob membership.
#[derive(Default)]
pub struct ResidualFilter {
    path_globs: Option<GlobSet>,
}

impl ResidualFilter {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        match &self.path_globs {
            None => true,
            Some(globs) => globs.is_match(chunk.payload.file_path()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path_globs.is_none()
    }
}

/// Push key membership, date range, and consolidation level down into the
/// tier queries; keep path globs for the post-filter.
pub fn split(filter: Option<&SearchFilter>) -> SplitFilter {
    let Some(filter) = filter else {
        return SplitFilter {
            tier: TierFilter::default(),
            residual: ResidualFilter::default(),
        };
    };

    let tier = TierFilter {
        qntm_keys: filter.qntm_keys.iter().map(|k| normalize_key(k)).collect(),
        created_after: filter.created_after,
        created_before: filter.created_before,
        max_consolidation_level: filter.max_consolidation_level,
    };

    let path_globs = if filter.path_globs.is_empty() {
        None
    } else {
        let mut builder = GlobSetBuilder::new();
        for pattern in &filter.path_globs {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!(pattern, error = %err, "ignoring invalid path glob in filter"),
            }
        }
        builder.build().ok()
    };

    SplitFilter {
        tier,
        residual: ResidualFilter { path_globs },
    }
}
