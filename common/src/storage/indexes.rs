use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{backends::EmbeddingModality, error::AppError, storage::db::SurrealDbClient};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Bounded wait for background DDL before startup gives up.
pub const DEFAULT_SCHEMA_WAIT: Duration = Duration::from_secs(10);
const FTS_ANALYZER_NAME: &str = "atlas_en_fts_analyzer";

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
    options: &'static str,
}

fn hnsw_spec_for(modality: EmbeddingModality) -> HnswIndexSpec {
    let (index_name, table) = match modality {
        EmbeddingModality::Text => ("idx_embedding_chunk_text", "chunk_embedding_text"),
        EmbeddingModality::Code => ("idx_embedding_chunk_code", "chunk_embedding_code"),
        EmbeddingModality::Contextualized => (
            "idx_embedding_chunk_contextualized",
            "chunk_embedding_contextualized",
        ),
    };
    HnswIndexSpec {
        index_name,
        table,
        options: "DIST COSINE TYPE F32 EFC 100 M 8 CONCURRENTLY",
    }
}

impl HnswIndexSpec {
    fn definition_if_not_exists(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            dimension = dimension,
            options = self.options,
        )
    }

    fn definition_overwrite(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            dimension = dimension,
            options = self.options,
        )
    }
}

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const fn fts_index_specs() -> [FtsIndexSpec; 2] {
    [
        FtsIndexSpec {
            index_name: "fulltext_docs_text_idx",
            table: "fulltext_docs",
            field: "original_text",
        },
        FtsIndexSpec {
            index_name: "fulltext_docs_file_name_idx",
            table: "fulltext_docs",
            field: "file_name",
        },
    ]
}

impl FtsIndexSpec {
    fn definition(&self) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {analyzer} BM25 CONCURRENTLY;",
            index = self.index_name,
            table = self.table,
            field = self.field,
            analyzer = FTS_ANALYZER_NAME,
        )
    }
}

/// Plain lookup indexes over the metadata tables.
const PLAIN_INDEX_DEFINITIONS: [&str; 6] = [
    "DEFINE INDEX IF NOT EXISTS idx_sources_path ON TABLE sources FIELDS path UNIQUE;",
    "DEFINE INDEX IF NOT EXISTS idx_chunks_source ON TABLE chunks FIELDS source_id;",
    "DEFINE INDEX IF NOT EXISTS idx_chunks_content_hash ON TABLE chunks FIELDS content_hash;",
    "DEFINE INDEX IF NOT EXISTS idx_chunk_keys_chunk ON TABLE chunk_qntm_keys FIELDS chunk_id;",
    "DEFINE INDEX IF NOT EXISTS idx_chunk_keys_key ON TABLE chunk_qntm_keys FIELDS qntm_key;",
    "DEFINE INDEX IF NOT EXISTS idx_analytics_chunk ON TABLE chunk_analytics FIELDS chunk_id;",
];

/// Verify (and idempotently create) every table, analyzer, and index the
/// tiers rely on. HNSW definitions are overwritten when the embedding
/// dimension for a modality changed. Background builds are awaited up to
/// `wait` per index; a build still running past the deadline is an error so
/// the daemon refuses to start half-indexed.
pub async fn ensure_schema(
    db: &SurrealDbClient,
    embedding_dimensions: &HashMap<EmbeddingModality, usize>,
    wait: Duration,
) -> Result<(), AppError> {
    ensure_schema_inner(db, embedding_dimensions, wait)
        .await
        .map_err(|err| AppError::FatalInit(err.to_string()))
}

async fn ensure_schema_inner(
    db: &SurrealDbClient,
    embedding_dimensions: &HashMap<EmbeddingModality, usize>,
    wait: Duration,
) -> Result<()> {
    create_fts_analyzer(db).await?;

    for definition in PLAIN_INDEX_DEFINITIONS {
        db.client
            .query(definition)
            .await
            .context("defining plain index")?
            .check()
            .context("plain index definition rejected")?;
    }

    // Sequential on purpose: concurrent DDL trips Surreal's read/write
    // conflict detection.
    for spec in fts_index_specs() {
        if index_exists(db, spec.table, spec.index_name).await? {
            continue;
        }
        create_index_with_polling(db, spec.definition(), spec.index_name, spec.table, wait)
            .await?;
    }

    for (&modality, &dimension) in embedding_dimensions {
        let spec = hnsw_spec_for(modality);
        match existing_hnsw_dimension(db, &spec).await? {
            None => {
                create_index_with_polling(
                    db,
                    spec.definition_if_not_exists(dimension),
                    spec.index_name,
                    spec.table,
                    wait,
                )
                .await?;
            }
            Some(current) if current == dimension => {}
            Some(current) => {
                debug!(
                    index = spec.index_name,
                    existing_dimension = current,
                    target_dimension = dimension,
                    "Overwriting HNSW index to match new embedding dimension"
                );
                create_index_with_polling(
                    db,
                    spec.definition_overwrite(dimension),
                    spec.index_name,
                    spec.table,
                    wait,
                )
                .await?;
            }
        }
    }

    Ok(())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    // Prefer snowball stemming when the running Surreal build supports it;
    // fall back to ascii-only otherwise.
    let snowball_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii, snowball(english);"
    );

    match db.client.query(snowball_query).await {
        Ok(res) => {
            if res.check().is_ok() {
                return Ok(());
            }
            warn!("Snowball analyzer check failed; attempting ascii fallback definition");
        }
        Err(err) => {
            warn!(
                error = %err,
                "Snowball analyzer creation errored; attempting ascii fallback definition"
            );
        }
    }

    let fallback_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii;"
    );

    db.client
        .query(fallback_query)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("fallback FTS analyzer definition rejected")?;

    Ok(())
}

async fn create_index_with_polling(
    db: &SurrealDbClient,
    definition: String,
    index_name: &str,
    table: &str,
    wait: Duration,
) -> Result<()> {
    let mut attempts = 0;
    const MAX_ATTEMPTS: usize = 3;
    loop {
        attempts += 1;
        let res = db
            .client
            .query(definition.clone())
            .await
            .with_context(|| format!("creating index {index_name} on table {table}"))?;
        match res.check() {
            Ok(_) => break,
            Err(err) => {
                let conflict = err.to_string().contains("read or write conflict");
                warn!(
                    index = %index_name,
                    table = %table,
                    error = ?err,
                    attempt = attempts,
                    "Index definition failed"
                );
                if conflict && attempts < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                return Err(err).with_context(|| {
                    format!("index definition failed for {index_name} on {table}")
                });
            }
        }
    }

    poll_index_until_ready(db, index_name, table, wait).await
}

async fn poll_index_until_ready(
    db: &SurrealDbClient,
    index_name: &str,
    table: &str,
    wait: Duration,
) -> Result<()> {
    let deadline = std::time::Instant::now() + wait;

    loop {
        let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
        let mut info_res = db
            .client
            .query(info_query)
            .await
            .with_context(|| format!("checking index build status for {index_name}"))?;

        let info: Option<Value> = info_res
            .take(0)
            .context("failed to deserialize INFO FOR INDEX result")?;

        let status = info
            .as_ref()
            .and_then(|i| i.get("building"))
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
            // No `building` block means the index is not building anymore.
            .unwrap_or("ready")
            .to_string();

        if status.eq_ignore_ascii_case("ready") {
            debug!(index = %index_name, table = %table, "Index is ready");
            return Ok(());
        }
        if status.eq_ignore_ascii_case("error") {
            anyhow::bail!("index {index_name} on {table} reported error status during build");
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!(
                "index {index_name} on {table} still building after {}s",
                wait.as_secs()
            );
        }

        tokio::time::sleep(INDEX_POLL_INTERVAL).await;
    }
}

async fn existing_hnsw_dimension(
    db: &SurrealDbClient,
    spec: &HnswIndexSpec,
) -> Result<Option<usize>> {
    let Some(indexes) = table_index_definitions(db, spec.table).await? else {
        return Ok(None);
    };

    let Some(definition) = indexes
        .get(spec.index_name)
        .and_then(|details| details.get("Strand"))
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };

    Ok(extract_dimension(definition).and_then(|d| usize::try_from(d).ok()))
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}

async fn table_index_definitions(
    db: &SurrealDbClient,
    table: &str,
) -> Result<Option<Map<String, Value>>> {
    let info_query = format!("INFO FOR TABLE {table};");
    let mut response = db
        .client
        .query(info_query)
        .await
        .with_context(|| format!("fetching table info for {table}"))?;

    let info: surrealdb::Value = response
        .take(0)
        .context("failed to take table info response")?;

    let info_json: Value =
        serde_json::to_value(info).context("serializing table info to JSON for parsing")?;

    Ok(info_json
        .get("Object")
        .and_then(|o| o.get("indexes"))
        .and_then(|i| i.get("Object"))
        .and_then(|i| i.as_object())
        .cloned())
}

async fn index_exists(db: &SurrealDbClient, table: &str, index_name: &str) -> Result<bool> {
    let Some(indexes) = table_index_definitions(db, table).await? else {
        return Ok(false);
    };

    Ok(indexes.contains_key(index_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_dimensions() -> HashMap<EmbeddingModality, usize> {
        let mut dims = HashMap::new();
        dims.insert(EmbeddingModality::Text, 3);
        dims.insert(EmbeddingModality::Code, 3);
        dims
    }

    #[test]
    fn extract_dimension_parses_value() {
        let definition = "DEFINE INDEX idx_embedding_chunk_text ON TABLE chunk_embedding_text FIELDS embedding HNSW DIMENSION 1536 DIST COSINE TYPE F32 EFC 100 M 8;";
        assert_eq!(extract_dimension(definition), Some(1536));
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let namespace = "indexes_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        ensure_schema(&db, &test_dimensions(), DEFAULT_SCHEMA_WAIT)
            .await
            .expect("initial schema creation");

        // Second run should be a no-op and still succeed
        ensure_schema(&db, &test_dimensions(), DEFAULT_SCHEMA_WAIT)
            .await
            .expect("second schema creation");
    }

    #[tokio::test]
    async fn ensure_schema_overwrites_hnsw_dimension() {
        let namespace = "indexes_dim";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        ensure_schema(&db, &test_dimensions(), DEFAULT_SCHEMA_WAIT)
            .await
            .expect("initial schema creation");

        let mut larger = HashMap::new();
        larger.insert(EmbeddingModality::Text, 8);
        ensure_schema(&db, &larger, DEFAULT_SCHEMA_WAIT)
            .await
            .expect("overwritten schema creation");

        let spec = hnsw_spec_for(EmbeddingModality::Text);
        let dimension = existing_hnsw_dimension(&db, &spec)
            .await
            .expect("dimension lookup");
        assert_eq!(dimension, Some(8));
    }
}
