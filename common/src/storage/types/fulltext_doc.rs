use crate::{storage::types::chunk::Chunk, stored_object};

stored_object!(FullTextDoc, "fulltext_docs", {
    original_text: String,
    file_path: String,
    file_name: String,
    qntm_keys: Vec<String>,
    file_type: String,
    consolidation_level: u32,
    content_type: String
});

impl FullTextDoc {
    /// Project a chunk into its full-text document. The document shares the
    /// chunk's id so tier reconciliation can key on one identifier.
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let payload = chunk.payload.v1();
        Self {
            id: chunk.get_id().to_string(),
            created_at: chunk.created_at,
            updated_at: chunk.updated_at,
            original_text: payload.original_text.clone(),
            file_path: payload.file_path.clone(),
            file_name: payload.file_name.clone(),
            qntm_keys: payload.qntm_keys.clone(),
            file_type: payload.file_type.clone(),
            consolidation_level: chunk.consolidation_level,
            content_type: payload.content_type.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::storage::types::chunk::{ChunkPayloadV1, ContentKind};

    #[test]
    fn projection_shares_the_chunk_id() {
        let chunk = Chunk::new(
            "src".into(),
            3,
            5,
            "hash".into(),
            ChunkPayloadV1 {
                original_text: "foo bar baz".into(),
                file_path: "/tmp/b.md".into(),
                file_name: "b.md".into(),
                file_type: "md".into(),
                content_type: ContentKind::Prose,
                byte_start: 0,
                byte_end: 11,
                qntm_keys: vec!["foo".into()],
                embedding_models: BTreeMap::new(),
                merge: None,
                extra: BTreeMap::new(),
            },
        );

        let doc = FullTextDoc::from_chunk(&chunk);
        assert_eq!(doc.id, chunk.id);
        assert_eq!(doc.original_text, "foo bar baz");
        assert_eq!(doc.file_name, "b.md");
        assert_eq!(doc.content_type, "prose");
    }
}
