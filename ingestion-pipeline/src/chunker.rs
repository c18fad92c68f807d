use std::path::Path;

use common::storage::types::chunk::ContentKind;
use text_splitter::{ChunkCapacity, ChunkConfig, TextSplitter};

/// Extensions treated as code for modality selection.
const CODE_EXTENSIONS: [&str; 18] = [
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp", "rb", "sh",
    "sql", "toml", "yaml", "yml",
];

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    /// Upper bound on the placeholder emitted for undecodable files.
    pub binary_preview_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chars: 500,
            max_chars: 2_000,
            binary_preview_chars: 256,
        }
    }
}

/// One bounded slice of a file, byte-addressed for future diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub text: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub content_type: ContentKind,
}

/// Deterministic splitter: identical input always yields identical chunk
/// boundaries and indices. Breaks prefer paragraph and sentence boundaries
/// over mid-token cuts.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, path: &Path, bytes: &[u8]) -> Vec<RawChunk> {
        if let Some(text) = decode_utf8(bytes) {
            let kind = classify(path);
            return self.split_text(&text, kind);
        }

        // Undecodable bytes: one bounded placeholder chunk tagged binary.
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let preview: String = String::from_utf8_lossy(bytes)
            .chars()
            .filter(|c| !c.is_control())
            .take(self.config.binary_preview_chars)
            .collect();
        vec![RawChunk {
            text: format!("[binary file {name}, {} bytes] {preview}", bytes.len()),
            byte_start: 0,
            byte_end: bytes.len() as u64,
            content_type: ContentKind::Binary,
        }]
    }

    fn split_text(&self, text: &str, kind: ContentKind) -> Vec<RawChunk> {
        let capacity = ChunkCapacity::new(self.config.min_chars)
            .with_max(self.config.max_chars)
            .unwrap_or_else(|_| ChunkCapacity::new(self.config.max_chars));
        let splitter = TextSplitter::new(ChunkConfig::new(capacity));

        let mut chunks: Vec<RawChunk> = splitter
            .chunk_indices(text)
            .map(|(offset, chunk)| RawChunk {
                text: chunk.to_string(),
                byte_start: offset as u64,
                byte_end: (offset + chunk.len()) as u64,
                content_type: kind,
            })
            .collect();

        if chunks.is_empty() {
            chunks.push(RawChunk {
                text: String::new(),
                byte_start: 0,
                byte_end: 0,
                content_type: kind,
            });
        }

        chunks
    }
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    // NUL bytes early in the file are the cheapest binary signal; a full
    // UTF-8 decode catches the rest.
    let probe_len = bytes.len().min(8 * 1024);
    if bytes[..probe_len].contains(&0) {
        return None;
    }
    std::str::from_utf8(bytes).ok().map(str::to_owned)
}

/// File-type heuristics for embedding modality selection.
pub fn classify(path: &Path) -> ContentKind {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    if let Some(ext) = &extension {
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            return ContentKind::Code;
        }
    }

    match mime_guess::from_path(path).first() {
        Some(mime) if mime.type_() == mime_guess::mime::TEXT => ContentKind::Prose,
        Some(mime) if mime.type_() == mime_guess::mime::APPLICATION => ContentKind::Code,
        _ => ContentKind::Prose,
    }
}

/// Extension string carried in payloads and the full-text tier.
pub fn file_type(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn chunker() -> Chunker {
        Chunker::new(ChunkerConfig {
            min_chars: 20,
            max_chars: 80,
            binary_preview_chars: 32,
        })
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = chunker();
        let path = PathBuf::from("/tmp/notes.md");
        let text = "First paragraph about Rust.\n\nSecond paragraph about async IO. \
                    It runs a bit longer so the splitter has something to divide.\n\n\
                    Third paragraph closes the document."
            .as_bytes();

        let first = chunker.chunk(&path, text);
        let second = chunker.chunk(&path, text);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn chunks_stay_within_bounds_and_are_contiguous() {
        let chunker = chunker();
        let path = PathBuf::from("/tmp/notes.md");
        let body = "word ".repeat(200);

        let chunks = chunker.chunk(&path, body.as_bytes());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 80, "chunk exceeded max_chars");
            assert!(chunk.byte_end > chunk.byte_start);
        }
        for window in chunks.windows(2) {
            assert!(window[1].byte_start >= window[0].byte_start);
        }
    }

    #[test]
    fn offsets_point_back_into_the_source() {
        let chunker = chunker();
        let path = PathBuf::from("/tmp/notes.md");
        let body = "Alpha paragraph text.\n\nBeta paragraph text that is noticeably longer.";

        for chunk in chunker.chunk(&path, body.as_bytes()) {
            let slice = &body[chunk.byte_start as usize..chunk.byte_end as usize];
            assert_eq!(slice, chunk.text);
        }
    }

    #[test]
    fn binary_input_yields_single_bounded_chunk() {
        let chunker = chunker();
        let path = PathBuf::from("/tmp/image.png");
        let mut bytes = vec![0u8, 159, 146, 150];
        bytes.extend(std::iter::repeat(7u8).take(1024));

        let chunks = chunker.chunk(&path, &bytes);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content_type, ContentKind::Binary);
        assert!(chunks[0].text.contains("image.png"));
        assert!(chunks[0].text.len() < 512);
    }

    #[test]
    fn empty_file_yields_one_empty_chunk() {
        let chunker = chunker();
        let chunks = chunker.chunk(&PathBuf::from("/tmp/empty.md"), b"");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn classification_distinguishes_code_from_prose() {
        assert_eq!(classify(Path::new("/a/lib.rs")), ContentKind::Code);
        assert_eq!(classify(Path::new("/a/setup.py")), ContentKind::Code);
        assert_eq!(classify(Path::new("/a/readme.md")), ContentKind::Prose);
        assert_eq!(classify(Path::new("/a/notes.txt")), ContentKind::Prose);
    }

    #[test]
    fn file_type_is_lowercased_extension() {
        assert_eq!(file_type(Path::new("/a/Notes.MD")), "md");
        assert_eq!(file_type(Path::new("/a/no_extension")), "");
    }
}
