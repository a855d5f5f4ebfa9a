//! TTL + size bounded memo of query fingerprints to search results.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use memory_model::SemanticHit;

struct CacheEntry {
    results: Vec<SemanticHit>,
    timestamp: Instant,
}

/// Keyed by a fingerprint of the query embedding and search options. Entries
/// expire after a TTL; eviction runs opportunistically on writes, dropping
/// expired entries first and then the oldest until within the size bound.
#[derive(Default)]
pub struct SearchCache {
    entries: HashMap<String, CacheEntry>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint a query: a sample of the embedding (first 8 components)
    /// plus a caller-provided key describing the search options.
    pub fn fingerprint(embedding: &[f32], options_key: &str) -> String {
        let mut key = String::with_capacity(96);
        for component in embedding.iter().take(8) {
            key.push_str(&format!("{component:.4},"));
        }
        key.push('|');
        key.push_str(options_key);
        key
    }

    /// A hit only while the entry is younger than `ttl`.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<Vec<SemanticHit>> {
        let entry = self.entries.get(key)?;
        if entry.timestamp.elapsed() >= ttl {
            return None;
        }
        Some(entry.results.clone())
    }

    pub fn insert(
        &mut self,
        key: String,
        results: Vec<SemanticHit>,
        ttl: Duration,
        max_size: usize,
    ) {
        // Expired entries go first; then trim oldest until within budget.
        self.entries
            .retain(|_, entry| entry.timestamp.elapsed() < ttl);
        self.entries.insert(
            key,
            CacheEntry {
                results,
                timestamp: Instant::now(),
            },
        );
        while self.entries.len() > max_size.max(1) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_model::{DocId, MemoryKind, MemoryMetadata, VectorDocument};

    fn hit(id: i64) -> SemanticHit {
        SemanticHit {
            document: VectorDocument {
                id: DocId(id),
                content: format!("doc {id}"),
                embedding: vec![1.0],
                normalized_embedding: vec![1.0],
                norm: 1.0,
                metadata: MemoryMetadata::new(MemoryKind::Chat, id),
            },
            similarity: 0.9,
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn fresh_entries_hit_with_identical_fingerprints() {
        let mut cache = SearchCache::new();
        let key = SearchCache::fingerprint(&[0.1, 0.2, 0.3], "limit=10");
        cache.insert(key.clone(), vec![hit(1)], TTL, 10);

        let again = SearchCache::fingerprint(&[0.1, 0.2, 0.3], "limit=10");
        let results = cache.get(&again, TTL).expect("cache hit");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, DocId(1));
    }

    #[test]
    fn different_options_yield_different_fingerprints() {
        let a = SearchCache::fingerprint(&[0.1, 0.2], "limit=10");
        let b = SearchCache::fingerprint(&[0.1, 0.2], "limit=20");
        let c = SearchCache::fingerprint(&[0.9, 0.2], "limit=10");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let mut cache = SearchCache::new();
        cache.insert("k".into(), vec![hit(1)], TTL, 10);
        assert!(cache.get("k", Duration::ZERO).is_none());
    }

    #[test]
    fn size_bound_evicts_oldest_first() {
        let mut cache = SearchCache::new();
        cache.insert("a".into(), vec![hit(1)], TTL, 2);
        cache.insert("b".into(), vec![hit(2)], TTL, 2);
        cache.insert("c".into(), vec![hit(3)], TTL, 2);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", TTL).is_none(), "oldest entry evicted");
        assert!(cache.get("b", TTL).is_some());
        assert!(cache.get("c", TTL).is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache = SearchCache::new();
        cache.insert("a".into(), vec![hit(1)], TTL, 10);
        cache.clear();
        assert!(cache.is_empty());
    }
}
