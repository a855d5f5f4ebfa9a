//! Durable vector corpus and its derived in-memory indexes.
//!
//! The vector store is the single source of truth. The ANN and keyword
//! indexes are volatile caches over it: they may legitimately be empty or
//! stale at any time and are rebuilt from the store alone.

pub mod hnsw_index;
pub mod keyword_index;
pub mod search_cache;
pub mod sqlite_backend;
pub mod vector_math;
pub mod vector_store;

use std::collections::BTreeMap;

use memory_model::{DocId, MemoryKind, MemoryMetadata, VectorDocument};

/// Fixed batch size for cooperative scans (cleanup, eviction, index builds,
/// brute-force search). Work yields to the runtime between batches.
pub const SCAN_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("per-file embedding limit reached for `{file_id}` (limit {limit})")]
    QuotaExceeded { file_id: String, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index backend error: {0}")]
    Backend(String),
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index is not initialized")]
    NotInitialized,
}

/// Conjunctive metadata filter over stored memories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    pub kind: Option<MemoryKind>,
    pub session_id: Option<String>,
    pub file_id: Option<String>,
    /// Restrict to any of these file ids (context retrieval scoping).
    pub file_ids: Option<Vec<String>>,
    pub url: Option<String>,
}

impl MemoryFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.session_id.is_none()
            && self.file_id.is_none()
            && self.file_ids.is_none()
            && self.url.is_none()
    }

    pub fn for_kind(kind: MemoryKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn for_file(file_id: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.into()),
            ..Self::default()
        }
    }

    pub fn for_file_ids(file_ids: Vec<String>) -> Self {
        Self {
            file_ids: Some(file_ids),
            ..Self::default()
        }
    }

    /// Whether a document's metadata satisfies every clause of this filter.
    /// Used to post-filter index hits that were fetched without one.
    pub fn matches(&self, metadata: &MemoryMetadata) -> bool {
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if metadata.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(file_id) = &self.file_id {
            if metadata.file_id.as_deref() != Some(file_id.as_str()) {
                return false;
            }
        }
        if let Some(file_ids) = &self.file_ids {
            match &metadata.file_id {
                Some(fid) if file_ids.iter().any(|f| f == fid) => {}
                _ => return false,
            }
        }
        if let Some(url) = &self.url {
            if metadata.url.as_deref() != Some(url.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Insert payload for a memory row. The store computes ids; callers supply
/// both the raw and pre-normalized embedding.
#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub content: &'a str,
    pub embedding: &'a [f32],
    pub normalized_embedding: &'a [f32],
    pub norm: f32,
    pub metadata: &'a MemoryMetadata,
}

/// Corpus statistics; `total_size_mb` is an estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageStats {
    pub total_vectors: usize,
    pub total_size_mb: f64,
    pub counts_by_kind: BTreeMap<MemoryKind, usize>,
}

/// Abstract persistence backend: any ordered, filterable document store
/// satisfies this contract. The reference backend is embedded SQLite.
pub trait MemoryBackend {
    fn insert(&mut self, doc: &NewDocument<'_>) -> Result<DocId, StoreError>;
    fn get(&self, id: DocId) -> Result<Option<VectorDocument>, StoreError>;
    fn get_by_ids(&self, ids: &[DocId]) -> Result<Vec<VectorDocument>, StoreError>;
    /// Existing document with the same session and identical content, if any.
    fn find_session_duplicate(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<Option<DocId>, StoreError>;
    fn count(&self, filter: &MemoryFilter) -> Result<usize, StoreError>;
    /// Matching documents ordered by metadata timestamp ascending.
    fn scan(&self, filter: &MemoryFilter) -> Result<Vec<VectorDocument>, StoreError>;
    /// Page through matching documents in id order (stable across batches).
    fn scan_page(
        &self,
        filter: &MemoryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<VectorDocument>, StoreError>;
    fn ids_by_filter(&self, filter: &MemoryFilter) -> Result<Vec<DocId>, StoreError>;
    /// Ids in eviction order: oldest metadata timestamp first.
    fn oldest_ids(&self, limit: usize) -> Result<Vec<DocId>, StoreError>;
    fn ids_older_than(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<DocId>, StoreError>;
    /// Rows duplicating `(content, session_id, file_id, url)`; the earliest
    /// row of each group is kept out of the result.
    fn duplicate_ids(&self) -> Result<Vec<DocId>, StoreError>;
    fn delete_by_ids(&mut self, ids: &[DocId]) -> Result<usize, StoreError>;
    fn estimated_size_bytes(&self) -> Result<u64, StoreError>;
    fn counts_by_kind(&self) -> Result<BTreeMap<MemoryKind, usize>, StoreError>;
}

/// Read-side view used by index rebuilds, store-agnostic and object safe.
pub trait DocumentReader {
    fn document_count(&self) -> Result<usize, StoreError>;
    fn page_documents(&self, offset: usize, limit: usize)
        -> Result<Vec<VectorDocument>, StoreError>;
}

/// Nearest-neighbor search seam. The engine consults an implementation of
/// this trait for the fast path and falls back to a brute-force store scan
/// when it fails, so alternative index structures can be swapped in behind
/// the same contract.
pub trait VectorSearcher: Send + Sync {
    fn name(&self) -> &'static str;
    /// Top-k ids by cosine similarity, descending, filtered by
    /// `min_similarity`. An empty index yields an empty result.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(DocId, f32)>, IndexError>;
    /// Number of live (non-deleted) vectors currently held.
    fn live_len(&self) -> usize;
}

/// Outcome of a full index rebuild request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built { indexed: usize },
    /// Another build was already running; the request was a safe no-op.
    AlreadyInFlight,
}
