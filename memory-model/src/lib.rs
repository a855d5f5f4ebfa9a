//! Shared models used across crates

use serde::{Deserialize, Serialize};

/// Store-assigned document id. Unique and monotonically increasing within a corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub i64);

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Chat,
    File,
    Webpage,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Chat => "chat",
            MemoryKind::File => "file",
            MemoryKind::Webpage => "webpage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(MemoryKind::Chat),
            "file" => Some(MemoryKind::File),
            "webpage" => Some(MemoryKind::Webpage),
            _ => None,
        }
    }
}

/// Context attached to a stored memory. `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub kind: MemoryKind,
    pub session_id: Option<String>,
    pub file_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub timestamp: i64,
    pub chunk_index: Option<u32>,
    pub total_chunks: Option<u32>,
    pub role: Option<String>,
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
}

impl MemoryMetadata {
    pub fn new(kind: MemoryKind, timestamp: i64) -> Self {
        Self {
            kind,
            session_id: None,
            file_id: None,
            url: None,
            title: None,
            timestamp,
            chunk_index: None,
            total_chunks: None,
            role: None,
            chat_id: None,
            message_id: None,
        }
    }
}

/// A stored memory: content plus its embedding in raw and normalized form.
///
/// `normalized_embedding` has unit L2 norm whenever `embedding` is non-zero.
/// Documents are immutable once stored; updates are delete + re-store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: DocId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub normalized_embedding: Vec<f32>,
    pub norm: f32,
    pub metadata: MemoryMetadata,
}

/// A bounded segment of source text produced for independent embedding.
/// `start`/`end` are char offsets into the source; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Semantic search hit: a document plus its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticHit {
    pub document: VectorDocument,
    pub similarity: f32,
}

/// Keyword search hit with the query terms found in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub id: DocId,
    pub score: f32,
    pub document: Option<VectorDocument>,
    pub matched_terms: Vec<String>,
}

/// Process-wide retrieval configuration. Read fresh on each call path that
/// needs it; callers supply a provider closure so settings changes take
/// effect without restarting the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Number of texts sent to the embedding provider per request.
    pub batch_size: usize,
    pub enable_caching: bool,
    /// Per-file embedding cap; 0 disables the check.
    pub max_embeddings_per_file: usize,
    /// Total corpus budget in megabytes; 0 means unlimited.
    pub max_storage_mb: u64,
    pub auto_cleanup: bool,
    pub cleanup_days_old: u32,
    pub default_search_limit: usize,
    pub default_min_similarity: f32,
    pub search_cache_ttl_minutes: u64,
    pub search_cache_max_size: usize,
    pub use_hnsw: bool,
    /// Minimum corpus size before the ANN index is consulted.
    pub hnsw_min_vectors: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            enable_caching: true,
            max_embeddings_per_file: 500,
            max_storage_mb: 512,
            auto_cleanup: false,
            cleanup_days_old: 90,
            default_search_limit: 10,
            default_min_similarity: 0.3,
            search_cache_ttl_minutes: 5,
            search_cache_max_size: 100,
            use_hnsw: true,
            hnsw_min_vectors: 100,
        }
    }
}
