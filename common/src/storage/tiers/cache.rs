use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::storage::{tiers::CacheTier, types::chunk::Chunk};

/// Hot-path chunk lookups with bounded capacity and TTL. Entries are only a
/// convenience copy of the Metadata tier, so eviction is always safe.
pub struct InMemoryCacheTier {
    cache: Cache<String, Chunk>,
}

impl InMemoryCacheTier {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheTier for InMemoryCacheTier {
    async fn get(&self, chunk_id: &str) -> Option<Chunk> {
        self.cache.get(chunk_id).await
    }

    async fn insert(&self, chunk: Chunk) {
        self.cache.insert(chunk.id.clone(), chunk).await;
    }

    async fn invalidate(&self, chunk_ids: &[String]) {
        for id in chunk_ids {
            self.cache.invalidate(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::storage::types::chunk::{ChunkPayloadV1, ContentKind};

    fn chunk(id_source: &str) -> Chunk {
        Chunk::new(
            id_source.to_string(),
            0,
            1,
            "hash".to_string(),
            ChunkPayloadV1 {
                original_text: "cached body".to_string(),
                file_path: "/tmp/a.md".to_string(),
                file_name: "a.md".to_string(),
                file_type: "md".to_string(),
                content_type: ContentKind::Prose,
                byte_start: 0,
                byte_end: 11,
                qntm_keys: vec![],
                embedding_models: BTreeMap::new(),
                merge: None,
                extra: BTreeMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn insert_then_get_then_invalidate() {
        let tier = InMemoryCacheTier::new(16, Duration::from_secs(60));
        let chunk = chunk("src-a");
        let id = chunk.id.clone();

        assert!(tier.get(&id).await.is_none());

        tier.insert(chunk.clone()).await;
        assert_eq!(tier.get(&id).await, Some(chunk));

        tier.invalidate(std::slice::from_ref(&id)).await;
        assert!(tier.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let tier = InMemoryCacheTier::new(16, Duration::from_millis(20));
        let chunk = chunk("src-b");
        let id = chunk.id.clone();

        tier.insert(chunk).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tier.get(&id).await.is_none());
    }
}
