use std::sync::Arc;

use embedding_provider::{Embedder, FailingEmbedder, HashEmbedder};
use memory_model::{DocId, EmbeddingConfig, MemoryKind, MemoryMetadata};
use memory_store::{IndexError, MemoryFilter, VectorSearcher};
use recall_service::{
    static_config, HybridSearchOptions, ProgressEvent, RecallEngine, SearchOptions,
};
use text_chunker::{ChunkConfig, ChunkStrategy};

const DIM: usize = 4;

fn config() -> EmbeddingConfig {
    EmbeddingConfig {
        enable_caching: false,
        use_hnsw: false,
        auto_cleanup: false,
        max_storage_mb: 0,
        ..EmbeddingConfig::default()
    }
}

fn engine_with(config: EmbeddingConfig) -> RecallEngine {
    RecallEngine::in_memory(Arc::new(HashEmbedder::new(DIM)), static_config(config))
        .expect("create engine")
}

fn meta(kind: MemoryKind, ts: i64) -> MemoryMetadata {
    MemoryMetadata::new(kind, ts)
}

fn unit(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

/// Searcher that always fails, standing in for a corrupt ANN structure.
struct FailingSearcher;

impl VectorSearcher for FailingSearcher {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn search(
        &self,
        _query: &[f32],
        _k: usize,
        _min_similarity: f32,
    ) -> Result<Vec<(DocId, f32)>, IndexError> {
        Err(IndexError::Backend("simulated index corruption".into()))
    }

    fn live_len(&self) -> usize {
        1
    }
}

#[tokio::test]
async fn search_on_an_empty_store_returns_nothing() {
    let mut engine = engine_with(config());
    let hits = engine
        .search_similar_vectors(&[1.0, 0.0, 0.0, 0.0], &SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn semantic_search_ranks_by_similarity_and_respects_limit() {
    let mut engine = engine_with(config());

    let close = engine
        .store_memory("close", &unit(&[1.0, 0.05, 0.0, 0.0]), meta(MemoryKind::Chat, 1))
        .await
        .unwrap();
    let closer = engine
        .store_memory("closer", &unit(&[1.0, 0.01, 0.0, 0.0]), meta(MemoryKind::Chat, 2))
        .await
        .unwrap();
    engine
        .store_memory("far", &unit(&[0.0, 1.0, 0.0, 0.0]), meta(MemoryKind::Chat, 3))
        .await
        .unwrap();

    let options = SearchOptions {
        limit: Some(2),
        min_similarity: Some(0.5),
        ..SearchOptions::default()
    };
    let hits = engine
        .search_similar_vectors(&[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document.id, closer);
    assert_eq!(hits[1].document.id, close);
    assert!(hits[0].similarity >= hits[1].similarity);
    assert!(hits.iter().all(|h| h.similarity >= 0.5));
}

#[tokio::test]
async fn semantic_search_applies_metadata_filters() {
    let mut engine = engine_with(config());

    let mut chat = meta(MemoryKind::Chat, 1);
    chat.session_id = Some("s1".into());
    engine
        .store_memory("session one", &unit(&[1.0, 0.0, 0.0, 0.0]), chat)
        .await
        .unwrap();
    let mut other = meta(MemoryKind::Chat, 2);
    other.session_id = Some("s2".into());
    engine
        .store_memory("session two", &unit(&[1.0, 0.0, 0.0, 0.0]), other)
        .await
        .unwrap();

    let options = SearchOptions {
        min_similarity: Some(0.0),
        filter: MemoryFilter::for_session("s1"),
        ..SearchOptions::default()
    };
    let hits = engine
        .search_similar_vectors(&[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document.content, "session one");
}

#[tokio::test]
async fn ann_failure_falls_back_to_brute_force_transparently() {
    let ann_config = EmbeddingConfig {
        use_hnsw: true,
        hnsw_min_vectors: 1,
        ..config()
    };

    // Baseline: plain engine, brute-force path.
    let mut baseline = engine_with(ann_config.clone());
    // Engine whose ANN path always fails.
    let mut failing = engine_with(ann_config).with_vector_searcher(Arc::new(FailingSearcher));

    for (content, embedding, ts) in [
        ("alpha", unit(&[1.0, 0.1, 0.0, 0.0]), 1i64),
        ("beta", unit(&[0.8, 0.6, 0.0, 0.0]), 2),
        ("gamma", unit(&[0.0, 0.0, 1.0, 0.0]), 3),
    ] {
        baseline
            .store_memory(content, &embedding, meta(MemoryKind::Chat, ts))
            .await
            .unwrap();
        failing
            .store_memory(content, &embedding, meta(MemoryKind::Chat, ts))
            .await
            .unwrap();
    }

    let options = SearchOptions {
        limit: Some(2),
        min_similarity: Some(0.1),
        ..SearchOptions::default()
    };
    let query = unit(&[1.0, 0.0, 0.0, 0.0]);

    let expected = baseline.search_similar_vectors(&query, &options).await.unwrap();
    let actual = failing.search_similar_vectors(&query, &options).await.unwrap();

    assert!(!actual.is_empty());
    let ids = |hits: &[memory_model::SemanticHit]| {
        hits.iter().map(|h| h.document.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&actual), ids(&expected));
}

#[tokio::test]
async fn hybrid_fusion_weighs_keyword_and_semantic_signals() {
    let mut engine = engine_with(config());

    // Document A only matches the query text; document B only the embedding
    // (cosine 0.9 against the query). Equal weights rank A (0.5) over B (0.45).
    let a = engine
        .store_memory(
            "the zebra fact sheet",
            &unit(&[0.0, 0.0, 1.0, 0.0]),
            meta(MemoryKind::Webpage, 1),
        )
        .await
        .unwrap();
    let b = engine
        .store_memory(
            "unrelated wording entirely",
            &unit(&[0.9, (1.0f32 - 0.81).sqrt(), 0.0, 0.0]),
            meta(MemoryKind::Webpage, 2),
        )
        .await
        .unwrap();

    let options = HybridSearchOptions {
        keyword_weight: 0.5,
        semantic_weight: 0.5,
        limit: Some(10),
        min_similarity: Some(0.0),
        ..HybridSearchOptions::default()
    };
    let hits = engine
        .search_hybrid("zebra", &[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document.id, a);
    assert!((hits[0].score - 0.5).abs() < 1e-3);
    assert_eq!(hits[0].matched_terms, vec!["zebra".to_string()]);
    assert_eq!(hits[1].document.id, b);
    assert!((hits[1].score - 0.45).abs() < 1e-3);
}

#[tokio::test]
async fn documents_matching_both_signals_rank_first() {
    let mut engine = engine_with(config());

    let both = engine
        .store_memory(
            "rust retrieval engine notes",
            &unit(&[1.0, 0.0, 0.0, 0.0]),
            meta(MemoryKind::Chat, 1),
        )
        .await
        .unwrap();
    engine
        .store_memory(
            "rust cooking recipes",
            &unit(&[0.0, 1.0, 0.0, 0.0]),
            meta(MemoryKind::Chat, 2),
        )
        .await
        .unwrap();

    let options = HybridSearchOptions {
        min_similarity: Some(0.0),
        ..HybridSearchOptions::default()
    };
    let hits = engine
        .search_hybrid("rust", &[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();
    assert_eq!(hits[0].document.id, both);
    assert!(hits[0].score > hits[1].score);
}

#[tokio::test]
async fn keyword_search_is_case_insensitive_and_materializes_documents() {
    use memory_store::keyword_index::KeywordSearchOptions;

    let mut engine = engine_with(config());
    engine
        .store_memory(
            "Python is a programming language",
            &unit(&[1.0, 0.0, 0.0, 0.0]),
            meta(MemoryKind::Webpage, 1),
        )
        .await
        .unwrap();
    engine
        .store_memory(
            "Rust is a systems language",
            &unit(&[0.0, 1.0, 0.0, 0.0]),
            meta(MemoryKind::Webpage, 2),
        )
        .await
        .unwrap();

    let opts = KeywordSearchOptions::default();
    let filter = MemoryFilter::default();
    let ids = |hits: &[memory_model::KeywordHit]| hits.iter().map(|h| h.id).collect::<Vec<_>>();

    let lower = engine.search_keywords("python", &opts, &filter).await.unwrap();
    let upper = engine.search_keywords("PYTHON", &opts, &filter).await.unwrap();
    let mixed = engine.search_keywords("Python", &opts, &filter).await.unwrap();

    assert_eq!(lower.len(), 1);
    assert_eq!(ids(&lower), ids(&upper));
    assert_eq!(ids(&lower), ids(&mixed));
    let doc = lower[0].document.as_ref().expect("document materialized");
    assert!(doc.content.starts_with("Python"));
    assert_eq!(lower[0].matched_terms, vec!["python".to_string()]);
}

#[tokio::test]
async fn retrieve_context_formats_source_blocks() {
    let mut engine = engine_with(config());
    let embedder = HashEmbedder::new(DIM);

    let content = "hybrid search blends keyword and vector signals";
    let embedding = embedder.embed(content).await.unwrap();
    let mut m = meta(MemoryKind::Webpage, 1);
    m.title = Some("Search Notes".into());
    engine.store_memory(content, &embedding, m).await.unwrap();

    let context = engine.retrieve_context(content, None, &SearchOptions::default()).await;
    assert_eq!(
        context,
        format!("Source: Search Notes\n{content}")
    );
}

#[tokio::test]
async fn retrieve_context_falls_back_to_url_then_kind_for_the_source_label() {
    let mut engine = engine_with(config());
    let embedder = HashEmbedder::new(DIM);

    let content = "page without a title";
    let embedding = embedder.embed(content).await.unwrap();
    let mut m = meta(MemoryKind::Webpage, 1);
    m.url = Some("https://example.com/notes".into());
    engine.store_memory(content, &embedding, m).await.unwrap();

    let context = engine.retrieve_context(content, None, &SearchOptions::default()).await;
    assert!(context.starts_with("Source: https://example.com/notes\n"));
}

#[tokio::test]
async fn retrieve_context_fails_open_when_the_provider_is_down() {
    let mut engine = RecallEngine::in_memory(
        Arc::new(FailingEmbedder::new(DIM)),
        static_config(config()),
    )
    .unwrap();

    let context = engine
        .retrieve_context("anything", None, &SearchOptions::default())
        .await;
    assert_eq!(context, "");
}

#[tokio::test]
async fn retrieve_context_scopes_to_the_given_file_ids() {
    let mut engine = engine_with(config());
    let embedder = HashEmbedder::new(DIM);

    let content = "shared interesting paragraph";
    let embedding = embedder.embed(content).await.unwrap();
    let mut in_scope = meta(MemoryKind::File, 1);
    in_scope.file_id = Some("f1".into());
    in_scope.title = Some("Doc One".into());
    engine.store_memory(content, &embedding, in_scope).await.unwrap();

    let other = "different paragraph elsewhere";
    let other_embedding = embedder.embed(other).await.unwrap();
    let mut out_of_scope = meta(MemoryKind::File, 2);
    out_of_scope.file_id = Some("f2".into());
    engine
        .store_memory(other, &other_embedding, out_of_scope)
        .await
        .unwrap();

    let context = engine
        .retrieve_context(content, Some(vec!["f1".into()]), &SearchOptions::default())
        .await;
    assert!(context.contains("Doc One"));
    assert!(!context.contains(other));
}

#[tokio::test]
async fn caching_serves_repeat_queries_and_stays_bounded() {
    let cached_config = EmbeddingConfig {
        enable_caching: true,
        search_cache_ttl_minutes: 5,
        search_cache_max_size: 10,
        ..config()
    };
    let mut engine = engine_with(cached_config);
    engine
        .store_memory("cached doc", &unit(&[1.0, 0.0, 0.0, 0.0]), meta(MemoryKind::Chat, 1))
        .await
        .unwrap();

    let options = SearchOptions {
        min_similarity: Some(0.0),
        ..SearchOptions::default()
    };
    let first = engine
        .search_similar_vectors(&[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();
    assert_eq!(engine.index_stats().unwrap().cache_entries, 1);

    let second = engine
        .search_similar_vectors(&[1.0, 0.0, 0.0, 0.0], &options)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.index_stats().unwrap().cache_entries, 1);
}

#[tokio::test]
async fn indexes_rebuild_lazily_after_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memories.db");
    let ann_config = EmbeddingConfig {
        use_hnsw: true,
        hnsw_min_vectors: 1,
        ..config()
    };

    {
        let mut engine = RecallEngine::open(
            &path,
            Arc::new(HashEmbedder::new(DIM)),
            static_config(ann_config.clone()),
        )
        .unwrap();
        for i in 0..3i64 {
            let angle = i as f32 * 0.4;
            engine
                .store_memory(
                    &format!("memory {i}"),
                    &unit(&[angle.cos(), angle.sin(), 0.0, 0.0]),
                    meta(MemoryKind::Chat, i),
                )
                .await
                .unwrap();
        }
    }

    // Fresh process: derived indexes start empty and rebuild on first use.
    let mut engine = RecallEngine::open(
        &path,
        Arc::new(HashEmbedder::new(DIM)),
        static_config(ann_config),
    )
    .unwrap();
    let stats = engine.index_stats().unwrap();
    assert_eq!(stats.total_documents, 3);
    assert_eq!(stats.ann_vectors, 0);
    assert!(!stats.indexes_ready);

    let hits = engine
        .search_similar_vectors(
            &unit(&[1.0, 0.0, 0.0, 0.0]),
            &SearchOptions {
                min_similarity: Some(0.0),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());

    let stats = engine.index_stats().unwrap();
    assert_eq!(stats.ann_vectors, 3);
    assert_eq!(stats.keyword_documents, 3);
    assert!(stats.indexes_ready);
}

#[tokio::test]
async fn ingest_text_chunks_embeds_and_stores_with_progress() {
    let mut engine = engine_with(config());
    let chunk_config = ChunkConfig {
        chunk_size: 10,
        chunk_overlap: 0,
        strategy: ChunkStrategy::Fixed,
    };

    let text = "y".repeat(100); // 40-char budget: three chunks
    let mut base = meta(MemoryKind::File, 1_000);
    base.file_id = Some("f1".into());

    let mut events = Vec::new();
    let mut cb = |event: ProgressEvent| events.push(event);
    let ids = engine
        .ingest_text(&text, base, &chunk_config, Some(&mut cb))
        .await
        .unwrap();

    assert_eq!(ids.len(), 3);
    assert_eq!(events.first(), Some(&ProgressEvent::Start { total_chunks: 3 }));
    assert_eq!(events.last(), Some(&ProgressEvent::Finished { stored: 3 }));
    assert!(events.contains(&ProgressEvent::EmbedBatch { done: 3, total: 3 }));
    assert!(events.contains(&ProgressEvent::Stored { done: 3, total: 3 }));

    let docs = engine
        .memories_by_context(&MemoryFilter::for_file("f1"))
        .unwrap();
    assert_eq!(docs.len(), 3);
    for (i, doc) in docs.iter().enumerate() {
        assert_eq!(doc.metadata.chunk_index, Some(i as u32));
        assert_eq!(doc.metadata.total_chunks, Some(3));
    }
}

#[tokio::test]
async fn delete_memories_removes_results_from_search() {
    let mut engine = engine_with(config());

    let mut m = meta(MemoryKind::Chat, 1);
    m.session_id = Some("s1".into());
    engine
        .store_memory("to delete", &unit(&[1.0, 0.0, 0.0, 0.0]), m)
        .await
        .unwrap();

    let deleted = engine
        .delete_memories(&MemoryFilter::for_session("s1"))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let hits = engine
        .search_similar_vectors(
            &[1.0, 0.0, 0.0, 0.0],
            &SearchOptions {
                min_similarity: Some(0.0),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn clear_indexes_resets_readiness_and_rebuilds_on_demand() {
    let mut engine = engine_with(config());
    engine
        .store_memory("resident", &unit(&[1.0, 0.0, 0.0, 0.0]), meta(MemoryKind::Chat, 1))
        .await
        .unwrap();

    engine.build_indexes(None).await.unwrap();
    assert!(engine.index_stats().unwrap().indexes_ready);

    engine.clear_indexes().unwrap();
    let stats = engine.index_stats().unwrap();
    assert!(!stats.indexes_ready);
    assert_eq!(stats.ann_vectors, 0);
    assert_eq!(stats.keyword_documents, 0);

    // Searching heals the caches from the store.
    let hits = engine
        .search_similar_vectors(
            &[1.0, 0.0, 0.0, 0.0],
            &SearchOptions {
                min_similarity: Some(0.0),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(engine.index_stats().unwrap().indexes_ready);
}
