//! Durable vector corpus with dedup, quota and eviction lifecycle.
//!
//! The store owns the persistence backend and is the single source of truth.
//! Incremental updates to the derived ANN/keyword indexes are best-effort:
//! a failure there (e.g. an index not yet initialized) is logged and
//! swallowed, and a later full rebuild from the store recovers it. Such a
//! failure never fails the store operation itself.

use std::path::Path;

use chrono::Utc;
use memory_model::{DocId, EmbeddingConfig, MemoryMetadata, VectorDocument};
use tracing::{debug, warn};

use crate::hnsw_index::HnswIndex;
use crate::keyword_index::KeywordIndex;
use crate::sqlite_backend::SqliteBackend;
use crate::vector_math;
use crate::{
    DocumentReader, MemoryBackend, MemoryFilter, NewDocument, StorageStats, StoreError, SCAN_BATCH,
};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

pub struct VectorStore<B: MemoryBackend = SqliteBackend> {
    backend: B,
}

impl VectorStore<SqliteBackend> {
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(SqliteBackend::in_memory()?))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::new(SqliteBackend::open(path)?))
    }
}

impl<B: MemoryBackend> VectorStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Persist one memory. Returns the id of an existing row when the same
    /// `(session_id, content)` pair is already stored (idempotent insert).
    ///
    /// Enforces the per-file quota before inserting, runs age-based cleanup
    /// when enabled, then best-effort updates the derived indexes and
    /// finally enforces the global size budget by evicting the oldest
    /// documents.
    pub async fn store_vector(
        &mut self,
        content: &str,
        embedding: &[f32],
        metadata: MemoryMetadata,
        config: &EmbeddingConfig,
        hnsw: &HnswIndex,
        keyword: &KeywordIndex,
    ) -> Result<DocId, StoreError> {
        if let Some(session_id) = &metadata.session_id {
            if let Some(existing) = self.backend.find_session_duplicate(session_id, content)? {
                debug!(id = %existing, "duplicate session content; returning existing id");
                return Ok(existing);
            }
        }

        if config.max_embeddings_per_file > 0 {
            if let Some(file_id) = &metadata.file_id {
                let count = self.backend.count(&MemoryFilter::for_file(file_id.clone()))?;
                if count >= config.max_embeddings_per_file {
                    return Err(StoreError::QuotaExceeded {
                        file_id: file_id.clone(),
                        limit: config.max_embeddings_per_file,
                    });
                }
            }
        }

        if config.auto_cleanup {
            let cutoff = Utc::now().timestamp_millis()
                - i64::from(config.cleanup_days_old) * MS_PER_DAY;
            self.delete_older_than(cutoff, hnsw, keyword).await?;
        }

        let (normalized, norm) = vector_math::normalize(embedding);
        let id = self.backend.insert(&NewDocument {
            content,
            embedding,
            normalized_embedding: &normalized,
            norm,
            metadata: &metadata,
        })?;

        // Derived-index maintenance is best-effort by design; a full rebuild
        // from the store recovers any skipped update.
        if let Err(err) = hnsw.add_vector(id, &normalized) {
            warn!(id = %id, error = %err, "hnsw incremental add skipped");
        }
        if let Err(err) = keyword.add_document(id, content) {
            warn!(id = %id, error = %err, "keyword incremental add skipped");
        }

        if config.max_storage_mb > 0 {
            self.enforce_size_budget(config.max_storage_mb, id, hnsw, keyword)
                .await?;
        }

        Ok(id)
    }

    /// Delete all memories matching `filter`, mirroring the deletions into
    /// the derived indexes. Returns the number of rows removed.
    pub async fn delete_vectors(
        &mut self,
        filter: &MemoryFilter,
        hnsw: &HnswIndex,
        keyword: &KeywordIndex,
    ) -> Result<usize, StoreError> {
        let ids = self.backend.ids_by_filter(filter)?;
        let mut deleted = 0usize;
        for batch in ids.chunks(SCAN_BATCH) {
            deleted += self.backend.delete_by_ids(batch)?;
            mirror_removals(hnsw, keyword, batch);
            tokio::task::yield_now().await;
        }
        Ok(deleted)
    }

    /// Matching documents ordered by timestamp ascending.
    pub fn get_vectors_by_context(
        &self,
        filter: &MemoryFilter,
    ) -> Result<Vec<VectorDocument>, StoreError> {
        self.backend.scan(filter)
    }

    pub fn storage_stats(&self) -> Result<StorageStats, StoreError> {
        let total_vectors = self.backend.count(&MemoryFilter::default())?;
        let total_size_mb =
            self.backend.estimated_size_bytes()? as f64 / (1024.0 * 1024.0);
        let counts_by_kind = self.backend.counts_by_kind()?;
        Ok(StorageStats {
            total_vectors,
            total_size_mb,
            counts_by_kind,
        })
    }

    /// Collapse documents sharing `(content, session_id, file_id, url)`,
    /// keeping the earliest of each group. Returns the removed count.
    pub async fn remove_duplicate_vectors(
        &mut self,
        hnsw: &HnswIndex,
        keyword: &KeywordIndex,
    ) -> Result<usize, StoreError> {
        let ids = self.backend.duplicate_ids()?;
        let mut removed = 0usize;
        for batch in ids.chunks(SCAN_BATCH) {
            removed += self.backend.delete_by_ids(batch)?;
            mirror_removals(hnsw, keyword, batch);
            tokio::task::yield_now().await;
        }
        Ok(removed)
    }

    /// Delete documents older than `cutoff_ms`, in cooperative batches.
    pub async fn delete_older_than(
        &mut self,
        cutoff_ms: i64,
        hnsw: &HnswIndex,
        keyword: &KeywordIndex,
    ) -> Result<usize, StoreError> {
        let mut deleted = 0usize;
        loop {
            let ids = self.backend.ids_older_than(cutoff_ms, SCAN_BATCH)?;
            if ids.is_empty() {
                break;
            }
            deleted += self.backend.delete_by_ids(&ids)?;
            mirror_removals(hnsw, keyword, &ids);
            tokio::task::yield_now().await;
        }
        if deleted > 0 {
            debug!(deleted, cutoff_ms, "age-based cleanup removed documents");
        }
        Ok(deleted)
    }

    /// Evict oldest-timestamped documents until the estimated corpus size is
    /// within `max_storage_mb`. The just-inserted document always survives.
    async fn enforce_size_budget(
        &mut self,
        max_storage_mb: u64,
        protected: DocId,
        hnsw: &HnswIndex,
        keyword: &KeywordIndex,
    ) -> Result<(), StoreError> {
        let budget_bytes = max_storage_mb * 1024 * 1024;
        loop {
            if self.backend.estimated_size_bytes()? <= budget_bytes {
                break;
            }
            let mut ids = self.backend.oldest_ids(SCAN_BATCH)?;
            ids.retain(|id| *id != protected);
            if ids.is_empty() {
                break;
            }
            let deleted = self.backend.delete_by_ids(&ids)?;
            mirror_removals(hnsw, keyword, &ids);
            debug!(deleted, "size budget eviction");
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    pub fn count(&self, filter: &MemoryFilter) -> Result<usize, StoreError> {
        self.backend.count(filter)
    }

    pub fn get(&self, id: DocId) -> Result<Option<VectorDocument>, StoreError> {
        self.backend.get(id)
    }

    pub fn get_by_ids(&self, ids: &[DocId]) -> Result<Vec<VectorDocument>, StoreError> {
        self.backend.get_by_ids(ids)
    }

    pub fn scan_page(
        &self,
        filter: &MemoryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<VectorDocument>, StoreError> {
        self.backend.scan_page(filter, offset, limit)
    }
}

impl<B: MemoryBackend> DocumentReader for VectorStore<B> {
    fn document_count(&self) -> Result<usize, StoreError> {
        self.backend.count(&MemoryFilter::default())
    }

    fn page_documents(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<VectorDocument>, StoreError> {
        self.backend.scan_page(&MemoryFilter::default(), offset, limit)
    }
}

fn mirror_removals(hnsw: &HnswIndex, keyword: &KeywordIndex, ids: &[DocId]) {
    hnsw.remove(ids);
    for id in ids {
        if let Err(err) = keyword.remove_document(*id) {
            warn!(id = %id, error = %err, "keyword index removal skipped");
        }
    }
}
