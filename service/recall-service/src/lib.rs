//! Hybrid retrieval orchestrator.
//!
//! Composes the vector store, the derived ANN and keyword indexes, the
//! result cache and the embedding provider into the engine that answers
//! semantic, keyword and fused queries and produces RAG context strings.

mod engine;
mod fusion;

pub use engine::{IndexStats, RecallEngine};
pub use fusion::{fuse_scores, FusedScore};

use std::sync::Arc;

use memory_model::EmbeddingConfig;
use memory_store::{IndexError, MemoryFilter, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("chunking error: {0}")]
    Chunk(#[from] text_chunker::ChunkError),
    #[error("embedding provider error: {0}")]
    Provider(#[from] embedding_provider::ProviderError),
}

/// Settings source consulted fresh on every operation, so external settings
/// changes take effect without restarting the engine.
pub type ConfigProvider = Arc<dyn Fn() -> EmbeddingConfig + Send + Sync>;

/// Fixed provider for a static configuration.
pub fn static_config(config: EmbeddingConfig) -> ConfigProvider {
    Arc::new(move || config.clone())
}

/// Options for semantic search. Unset fields fall back to the configured
/// defaults at call time.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub min_similarity: Option<f32>,
    pub filter: MemoryFilter,
}

/// Options for hybrid (keyword + semantic) search.
#[derive(Debug, Clone)]
pub struct HybridSearchOptions {
    pub keyword_weight: f32,
    pub semantic_weight: f32,
    pub limit: Option<usize>,
    pub min_similarity: Option<f32>,
    pub filter: MemoryFilter,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        Self {
            keyword_weight: 0.3,
            semantic_weight: 0.7,
            limit: None,
            min_similarity: None,
            filter: MemoryFilter::default(),
        }
    }
}

/// A fused search hit with its score components.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridHit {
    pub document: memory_model::VectorDocument,
    pub score: f32,
    pub keyword_score: f32,
    pub semantic_score: f32,
    pub matched_terms: Vec<String>,
}

/// Progress events emitted during ingestion and index builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Start { total_chunks: usize },
    EmbedBatch { done: usize, total: usize },
    Stored { done: usize, total: usize },
    IndexBuild { processed: usize, total: usize },
    Finished { stored: usize },
}
