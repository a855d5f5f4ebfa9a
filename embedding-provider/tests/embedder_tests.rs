use embedding_provider::{
    Embedder, HashEmbedder, HttpEmbedder, HttpEmbedderConfig, ProviderError, ProviderKind,
};

fn assert_vectors_close(lhs: &[f32], rhs: &[f32]) {
    assert_eq!(lhs.len(), rhs.len(), "vector lengths differ");
    for (index, (a, b)) in lhs.iter().zip(rhs.iter()).enumerate() {
        let diff = (a - b).abs();
        assert!(
            diff <= 1e-6,
            "vectors diverge at position {index}: {a} vs {b} (diff {diff})"
        );
    }
}

#[tokio::test]
async fn hash_embedder_is_deterministic() {
    let embedder = HashEmbedder::new(64);

    let sentence = "Rust makes systems programming safer without sacrificing speed.";
    let a = embedder.embed(sentence).await.expect("first embedding");
    let b = embedder.embed(sentence).await.expect("second embedding");

    assert_eq!(a.len(), 64);
    assert_vectors_close(&a, &b);
    assert!(
        a.iter().any(|component| component.abs() > 1e-3),
        "embedding should not be all zeros"
    );

    let info = embedder.info();
    assert_eq!(info.provider, ProviderKind::Hash);
    assert_eq!(info.dimension, 64);
}

#[tokio::test]
async fn distinct_texts_embed_to_distinct_vectors() {
    let embedder = HashEmbedder::new(32);
    let a = embedder.embed("semantic search").await.unwrap();
    let b = embedder.embed("keyword ranking").await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn embed_batch_matches_individual_embeddings_and_reports_progress() {
    let embedder = HashEmbedder::new(16);
    let inputs = [
        "embeddings unlock semantic search",
        "hybrid ranking mixes bm25 and vectors",
        "caches keep repeated queries cheap",
    ];

    let mut seen: Vec<(usize, usize)> = Vec::new();
    let mut progress = |done: usize, total: usize| seen.push((done, total));
    let batch = embedder.embed_batch(&inputs, Some(&mut progress)).await;

    assert_eq!(batch.len(), inputs.len());
    assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);

    for (input, result) in inputs.iter().zip(batch.iter()) {
        let single = embedder.embed(input).await.unwrap();
        assert_vectors_close(&single, result.as_ref().unwrap());
    }
}

#[tokio::test]
async fn empty_batch_is_allowed() {
    let embedder = HashEmbedder::new(8);
    let empty: [&str; 0] = [];
    let batch = embedder.embed_batch(&empty, None).await;
    assert!(batch.is_empty());
}

#[test]
fn http_embedder_rejects_zero_dimension() {
    let config = HttpEmbedderConfig {
        dimension: 0,
        ..HttpEmbedderConfig::default()
    };
    let err = HttpEmbedder::new(config).expect_err("zero dimension must be rejected");
    assert!(matches!(err, ProviderError::InvalidConfiguration { .. }));
}

#[test]
fn http_embedder_rejects_empty_endpoint() {
    let config = HttpEmbedderConfig {
        endpoint: "  ".into(),
        ..HttpEmbedderConfig::default()
    };
    let err = HttpEmbedder::new(config).expect_err("empty endpoint must be rejected");
    assert!(matches!(err, ProviderError::InvalidConfiguration { .. }));
}

#[test]
fn http_embedder_reports_provider_metadata() {
    let config = HttpEmbedderConfig {
        model: "mock-embed".into(),
        dimension: 12,
        ..HttpEmbedderConfig::default()
    };
    let embedder = HttpEmbedder::new(config).expect("configuration is valid");
    let info = embedder.info();
    assert_eq!(info.provider, ProviderKind::Http);
    assert_eq!(info.dimension, 12);
    assert_eq!(info.embedding_model_id, "mock-embed");
}
