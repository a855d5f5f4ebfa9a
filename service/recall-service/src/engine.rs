use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use embedding_provider::Embedder;
use memory_model::{DocId, EmbeddingConfig, MemoryMetadata, SemanticHit, VectorDocument};
use memory_store::hnsw_index::HnswIndex;
use memory_store::keyword_index::{KeywordIndex, KeywordSearchOptions};
use memory_store::search_cache::SearchCache;
use memory_store::vector_math;
use memory_store::vector_store::VectorStore;
use memory_store::{
    DocumentReader, MemoryFilter, StorageStats, StoreError, VectorSearcher, SCAN_BATCH,
};
use text_chunker::ChunkConfig;
use tracing::{debug, warn};

use crate::{
    fusion, ConfigProvider, EngineError, HybridHit, HybridSearchOptions, ProgressEvent,
    SearchOptions,
};

/// Readiness and size snapshot of the derived caches.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub total_documents: usize,
    pub ann_vectors: usize,
    pub keyword_documents: usize,
    pub cache_entries: usize,
    pub indexes_ready: bool,
}

/// The hybrid retrieval engine.
///
/// Owns the durable store (source of truth) plus the derived ANN and keyword
/// indexes and the search cache. The indexes are volatile: after a process
/// restart they are rebuilt lazily from the store on first use.
pub struct RecallEngine {
    store: VectorStore,
    hnsw: Arc<HnswIndex>,
    /// Search seam consulted for the ANN fast path; normally the HNSW index
    /// itself, but any searcher honoring the same contract can be swapped in.
    ann: Arc<dyn VectorSearcher>,
    keyword: KeywordIndex,
    cache: SearchCache,
    embedder: Arc<dyn Embedder>,
    config_provider: ConfigProvider,
    indexes_ready: bool,
}

impl RecallEngine {
    /// Engine over an in-memory store (tests, ephemeral sessions).
    pub fn in_memory(
        embedder: Arc<dyn Embedder>,
        config_provider: ConfigProvider,
    ) -> Result<Self, EngineError> {
        Self::with_store(VectorStore::in_memory()?, embedder, config_provider)
    }

    /// Engine over a file-backed store at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        embedder: Arc<dyn Embedder>,
        config_provider: ConfigProvider,
    ) -> Result<Self, EngineError> {
        Self::with_store(VectorStore::open(path)?, embedder, config_provider)
    }

    fn with_store(
        store: VectorStore,
        embedder: Arc<dyn Embedder>,
        config_provider: ConfigProvider,
    ) -> Result<Self, EngineError> {
        let hnsw = Arc::new(HnswIndex::new());
        let ann: Arc<dyn VectorSearcher> = Arc::clone(&hnsw) as Arc<dyn VectorSearcher>;
        Ok(Self {
            store,
            hnsw,
            ann,
            keyword: KeywordIndex::new()?,
            cache: SearchCache::new(),
            embedder,
            config_provider,
            indexes_ready: false,
        })
    }

    /// Substitute the ANN search implementation behind the same contract.
    pub fn with_vector_searcher(mut self, searcher: Arc<dyn VectorSearcher>) -> Self {
        self.ann = searcher;
        self
    }

    fn config(&self) -> EmbeddingConfig {
        (self.config_provider)()
    }

    /// Rebuild the derived indexes from the store if they have not been
    /// built in this process yet. Cheap once ready.
    pub async fn ensure_ready(&mut self) -> Result<(), EngineError> {
        if self.indexes_ready {
            return Ok(());
        }
        let total = self.store.document_count()?;
        if total > 0 {
            debug!(total, "rebuilding derived indexes from the store");
            self.hnsw.build_index(&self.store, None).await?;
            let docs = self.collect_all_documents().await?;
            self.keyword.build_from_documents(&docs, None).await?;
        }
        self.indexes_ready = true;
        Ok(())
    }

    async fn collect_all_documents(&self) -> Result<Vec<VectorDocument>, StoreError> {
        let mut docs = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self
                .store
                .scan_page(&MemoryFilter::default(), offset, SCAN_BATCH)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            docs.extend(page);
            tokio::task::yield_now().await;
        }
        Ok(docs)
    }

    /// Persist one memory and incrementally maintain the derived indexes.
    pub async fn store_memory(
        &mut self,
        content: &str,
        embedding: &[f32],
        metadata: MemoryMetadata,
    ) -> Result<DocId, EngineError> {
        let config = self.config();
        // First vector fixes the ANN dimension so incremental adds can start
        // before any explicit build.
        if self.hnsw.dimension().is_none() {
            self.hnsw.initialize(embedding.len());
        }
        let id = self
            .store
            .store_vector(content, embedding, metadata, &config, &self.hnsw, &self.keyword)
            .await?;
        Ok(id)
    }

    /// Chunk, embed and store a text. Per-chunk provider failures are logged
    /// and skipped so one bad chunk never aborts the rest; quota errors
    /// propagate to the caller.
    pub async fn ingest_text(
        &mut self,
        text: &str,
        base_metadata: MemoryMetadata,
        chunk_config: &ChunkConfig,
        mut progress: Option<&mut (dyn FnMut(ProgressEvent) + Send)>,
    ) -> Result<Vec<DocId>, EngineError> {
        let chunks = text_chunker::chunk_text_async(text, chunk_config).await?;
        if let Some(cb) = progress.as_mut() {
            cb(ProgressEvent::Start {
                total_chunks: chunks.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = {
            let mut embed_progress = |done: usize, total: usize| {
                if let Some(cb) = progress.as_mut() {
                    cb(ProgressEvent::EmbedBatch { done, total });
                }
            };
            self.embedder
                .embed_batch(&texts, Some(&mut embed_progress))
                .await
        };

        // Chunks inherit the caller's timestamp; an unset one is stamped now.
        let timestamp = if base_metadata.timestamp != 0 {
            base_metadata.timestamp
        } else {
            chrono::Utc::now().timestamp_millis()
        };

        let total = chunks.len();
        let mut ids = Vec::new();
        for (i, (chunk, embedding)) in chunks.iter().zip(embeddings.into_iter()).enumerate() {
            let embedding = match embedding {
                Ok(embedding) => embedding,
                Err(err) => {
                    warn!(chunk = i, error = %err, "skipping chunk; embedding failed");
                    continue;
                }
            };
            let mut metadata = base_metadata.clone();
            metadata.timestamp = timestamp;
            metadata.chunk_index = Some(i as u32);
            metadata.total_chunks = Some(total as u32);
            let id = self.store_memory(&chunk.text, &embedding, metadata).await?;
            ids.push(id);
            if let Some(cb) = progress.as_mut() {
                cb(ProgressEvent::Stored {
                    done: i + 1,
                    total,
                });
            }
        }
        if let Some(cb) = progress.as_mut() {
            cb(ProgressEvent::Finished { stored: ids.len() });
        }
        Ok(ids)
    }

    /// Nearest-neighbor search over the corpus.
    ///
    /// Consults the result cache, then chooses the ANN path or a brute-force
    /// store scan. An ANN failure falls back to brute force transparently:
    /// the caller always gets correct results, never the index error.
    pub async fn search_similar_vectors(
        &mut self,
        query_embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SemanticHit>, EngineError> {
        let config = self.config();
        self.ensure_ready().await?;

        let limit = options.limit.unwrap_or(config.default_search_limit);
        let min_similarity = options
            .min_similarity
            .unwrap_or(config.default_min_similarity);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ttl = Duration::from_secs(config.search_cache_ttl_minutes * 60);
        let cache_key = SearchCache::fingerprint(
            query_embedding,
            &options_key(limit, min_similarity, &options.filter),
        );
        if config.enable_caching {
            if let Some(hit) = self.cache.get(&cache_key, ttl) {
                debug!("search cache hit");
                return Ok(hit);
            }
        }

        let (query_normalized, query_norm) = vector_math::normalize(query_embedding);
        let candidates = self.store.count(&options.filter)?;

        let use_ann = config.use_hnsw
            && candidates >= config.hnsw_min_vectors
            && self.ann.live_len() > 0;

        let results = if use_ann {
            match self.ann_search(&query_normalized, limit, min_similarity, &options.filter) {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(
                        searcher = self.ann.name(),
                        error = %err,
                        "ann search failed; falling back to brute force"
                    );
                    self.brute_force(&query_normalized, query_norm, limit, min_similarity, &options.filter)
                        .await?
                }
            }
        } else {
            self.brute_force(&query_normalized, query_norm, limit, min_similarity, &options.filter)
                .await?
        };

        if config.enable_caching {
            self.cache
                .insert(cache_key, results.clone(), ttl, config.search_cache_max_size);
        }
        Ok(results)
    }

    fn ann_search(
        &self,
        query_normalized: &[f32],
        limit: usize,
        min_similarity: f32,
        filter: &MemoryFilter,
    ) -> Result<Vec<SemanticHit>, EngineError> {
        // Over-fetch when a metadata filter will be applied afterwards.
        let k = if filter.is_empty() { limit } else { limit * 3 };
        let matches = self.ann.search(query_normalized, k, min_similarity)?;
        let ids: Vec<DocId> = matches.iter().map(|(id, _)| *id).collect();
        let docs = self.store.get_by_ids(&ids)?;

        let mut by_id: std::collections::HashMap<DocId, VectorDocument> =
            docs.into_iter().map(|d| (d.id, d)).collect();
        let mut out = Vec::with_capacity(limit);
        for (id, similarity) in matches {
            let Some(document) = by_id.remove(&id) else {
                // Index briefly ahead of or behind the store; skip the row.
                continue;
            };
            if !filter.matches(&document.metadata) {
                continue;
            }
            out.push(SemanticHit {
                document,
                similarity,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Exhaustive scan over filtered candidates in cooperative batches.
    async fn brute_force(
        &self,
        query_normalized: &[f32],
        query_norm: f32,
        limit: usize,
        min_similarity: f32,
        filter: &MemoryFilter,
    ) -> Result<Vec<SemanticHit>, EngineError> {
        let mut hits: Vec<SemanticHit> = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self.store.scan_page(filter, offset, SCAN_BATCH)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for document in page {
                match vector_math::cosine_similarity_optimized(
                    query_normalized,
                    query_norm,
                    &document.embedding,
                    Some(document.norm),
                    Some(&document.normalized_embedding),
                ) {
                    Ok(similarity) if similarity >= min_similarity => hits.push(SemanticHit {
                        document,
                        similarity,
                    }),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(id = %document.id, error = %err, "skipping malformed document");
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Keyword-only search, with each hit's document materialized from the
    /// store and filtered by `filter`.
    pub async fn search_keywords(
        &mut self,
        query: &str,
        options: &KeywordSearchOptions,
        filter: &MemoryFilter,
    ) -> Result<Vec<memory_model::KeywordHit>, EngineError> {
        self.ensure_ready().await?;
        let mut hits = self.keyword.search(query, options)?;
        let ids: Vec<DocId> = hits.iter().map(|h| h.id).collect();
        let docs = self.store.get_by_ids(&ids)?;
        let mut by_id: std::collections::HashMap<DocId, VectorDocument> =
            docs.into_iter().map(|d| (d.id, d)).collect();
        hits.retain_mut(|hit| match by_id.remove(&hit.id) {
            Some(doc) if filter.matches(&doc.metadata) => {
                hit.document = Some(doc);
                true
            }
            _ => false,
        });
        Ok(hits)
    }

    /// Keyword and semantic search run independently (each over-fetching
    /// three times the requested limit), then their rankings are fused by
    /// weighted sum.
    pub async fn search_hybrid(
        &mut self,
        query_text: &str,
        query_embedding: &[f32],
        options: &HybridSearchOptions,
    ) -> Result<Vec<HybridHit>, EngineError> {
        let config = self.config();
        self.ensure_ready().await?;
        let limit = options.limit.unwrap_or(config.default_search_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = limit * 3;

        let keyword_hits = self.keyword.search(
            query_text,
            &KeywordSearchOptions {
                limit: fetch,
                ..KeywordSearchOptions::default()
            },
        )?;
        // Materialize keyword matches and drop those outside the filter
        // before normalization, so scores reflect the visible result set.
        let keyword_ids: Vec<DocId> = keyword_hits.iter().map(|h| h.id).collect();
        let keyword_docs = self.store.get_by_ids(&keyword_ids)?;
        let mut docs_by_id: std::collections::HashMap<DocId, VectorDocument> =
            keyword_docs.into_iter().map(|d| (d.id, d)).collect();
        let mut matched_by_id: std::collections::HashMap<DocId, Vec<String>> =
            std::collections::HashMap::new();
        let mut keyword_scored: Vec<(DocId, f32)> = Vec::new();
        for hit in keyword_hits {
            let Some(doc) = docs_by_id.get(&hit.id) else {
                continue;
            };
            if !options.filter.matches(&doc.metadata) {
                continue;
            }
            matched_by_id.insert(hit.id, hit.matched_terms);
            keyword_scored.push((hit.id, hit.score));
        }

        let semantic_hits = self
            .search_similar_vectors(
                query_embedding,
                &SearchOptions {
                    limit: Some(fetch),
                    min_similarity: options.min_similarity,
                    filter: options.filter.clone(),
                },
            )
            .await?;
        let semantic_scored: Vec<(DocId, f32)> = semantic_hits
            .iter()
            .map(|h| (h.document.id, h.similarity))
            .collect();
        for hit in semantic_hits {
            docs_by_id.entry(hit.document.id).or_insert(hit.document);
        }

        let fused = fusion::fuse_scores(
            &keyword_scored,
            &semantic_scored,
            options.keyword_weight,
            options.semantic_weight,
        );

        let mut out = Vec::with_capacity(limit);
        for (id, score) in fused {
            let Some(document) = docs_by_id.remove(&id) else {
                continue;
            };
            out.push(HybridHit {
                document,
                score: score.fused,
                keyword_score: score.keyword,
                semantic_score: score.semantic,
                matched_terms: matched_by_id.remove(&id).unwrap_or_default(),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Build the RAG context string for a chat prompt.
    ///
    /// Fails open: a provider or retrieval failure yields an empty string so
    /// the calling chat flow is never blocked on retrieval.
    pub async fn retrieve_context(
        &mut self,
        query: &str,
        file_ids: Option<Vec<String>>,
        options: &SearchOptions,
    ) -> String {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "context retrieval failed open: embedding unavailable");
                return String::new();
            }
        };

        let filter = match file_ids {
            Some(ids) if !ids.is_empty() => MemoryFilter::for_file_ids(ids),
            _ => options.filter.clone(),
        };
        let hybrid_options = HybridSearchOptions {
            limit: options.limit,
            min_similarity: options.min_similarity,
            filter,
            ..HybridSearchOptions::default()
        };

        let hits = match self.search_hybrid(query, &embedding, &hybrid_options).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "context retrieval failed open: search error");
                return String::new();
            }
        };

        let blocks: Vec<String> = hits
            .iter()
            .map(|hit| {
                let meta = &hit.document.metadata;
                let source = meta
                    .title
                    .as_deref()
                    .or(meta.url.as_deref())
                    .unwrap_or_else(|| meta.kind.as_str());
                format!("Source: {source}\n{}", hit.document.content)
            })
            .collect();
        blocks.join("\n\n")
    }

    /// Delete memories matching `filter` across the store and both indexes.
    pub async fn delete_memories(&mut self, filter: &MemoryFilter) -> Result<usize, EngineError> {
        let deleted = self
            .store
            .delete_vectors(filter, &self.hnsw, &self.keyword)
            .await?;
        Ok(deleted)
    }

    /// Matching memories ordered by timestamp ascending.
    pub fn memories_by_context(
        &self,
        filter: &MemoryFilter,
    ) -> Result<Vec<VectorDocument>, EngineError> {
        Ok(self.store.get_vectors_by_context(filter)?)
    }

    pub fn storage_stats(&self) -> Result<StorageStats, EngineError> {
        Ok(self.store.storage_stats()?)
    }

    pub async fn remove_duplicates(&mut self) -> Result<usize, EngineError> {
        Ok(self
            .store
            .remove_duplicate_vectors(&self.hnsw, &self.keyword)
            .await?)
    }

    /// Force a full rebuild of both derived indexes from the store.
    pub async fn build_indexes(
        &mut self,
        mut progress: Option<&mut (dyn FnMut(ProgressEvent) + Send)>,
    ) -> Result<(), EngineError> {
        {
            let mut cb = |processed: usize, total: usize| {
                if let Some(cb) = progress.as_mut() {
                    cb(ProgressEvent::IndexBuild { processed, total });
                }
            };
            self.hnsw.build_index(&self.store, Some(&mut cb)).await?;
        }
        let docs = self.collect_all_documents().await?;
        {
            let mut cb = |processed: usize, total: usize| {
                if let Some(cb) = progress.as_mut() {
                    cb(ProgressEvent::IndexBuild { processed, total });
                }
            };
            self.keyword.build_from_documents(&docs, Some(&mut cb)).await?;
        }
        self.indexes_ready = true;
        Ok(())
    }

    /// Drop both derived indexes and the result cache. They rebuild lazily
    /// from the store on next use.
    pub fn clear_indexes(&mut self) -> Result<(), EngineError> {
        self.hnsw.clear();
        self.keyword.clear()?;
        self.cache.clear();
        self.indexes_ready = false;
        Ok(())
    }

    pub fn index_stats(&self) -> Result<IndexStats, EngineError> {
        Ok(IndexStats {
            total_documents: self.store.document_count()?,
            ann_vectors: self.ann.live_len(),
            keyword_documents: self.keyword.len(),
            cache_entries: self.cache.len(),
            indexes_ready: self.indexes_ready,
        })
    }
}

fn options_key(limit: usize, min_similarity: f32, filter: &MemoryFilter) -> String {
    format!(
        "limit={limit};min={min_similarity:.4};kind={:?};session={:?};file={:?};files={:?};url={:?}",
        filter.kind, filter.session_id, filter.file_id, filter.file_ids, filter.url
    )
}
