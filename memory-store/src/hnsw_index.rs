//! In-memory nearest-neighbor index over the vector corpus.
//!
//! Backed by an HNSW graph (cosine distance). The structure is a derived
//! cache: it never persists, and a full rebuild from the store via
//! [`HnswIndex::build_index`] is always a valid recovery path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use hnsw_rs::prelude::*;
use memory_model::{DocId, EmbeddingConfig};
use tracing::{debug, warn};

use crate::{BuildOutcome, DocumentReader, IndexError, VectorSearcher, SCAN_BATCH};

const MAX_NB_CONN: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const NUM_LAYERS: usize = 16;
const EXPECTED_ELEMENTS: usize = 10_000;

struct HnswInner {
    dim: usize,
    hnsw: Hnsw<'static, f32, DistCosine>,
    /// Map doc id -> internal label
    id_map: HashMap<i64, usize>,
    /// Reverse map internal label -> doc id
    rev_map: Vec<DocId>,
    /// Stored normalized vectors for rebuild-on-reinsert
    vectors: Vec<Vec<f32>>,
    /// Tombstoned labels (HNSW has no true delete)
    tombstones: HashSet<usize>,
}

impl HnswInner {
    fn new(dim: usize) -> Self {
        let hnsw = Hnsw::<f32, DistCosine>::new(
            MAX_NB_CONN,
            EXPECTED_ELEMENTS,
            NUM_LAYERS,
            EF_CONSTRUCTION,
            DistCosine {},
        );
        Self {
            dim,
            hnsw,
            id_map: HashMap::new(),
            rev_map: Vec::new(),
            vectors: Vec::new(),
            tombstones: HashSet::new(),
        }
    }

    fn add(&mut self, id: DocId, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let label = match self.id_map.get(&id.0) {
            // Duplicate id: reinsert under the same label and revive it.
            Some(&label) => {
                self.tombstones.remove(&label);
                self.vectors[label] = vector.to_vec();
                label
            }
            None => {
                let label = self.rev_map.len();
                self.id_map.insert(id.0, label);
                self.rev_map.push(id);
                self.vectors.push(vector.to_vec());
                label
            }
        };
        let _ = self.hnsw.insert((&self.vectors[label][..], label));
        Ok(())
    }

    fn live_len(&self) -> usize {
        self.rev_map.len() - self.tombstones.len()
    }
}

pub struct HnswIndex {
    inner: RwLock<Option<HnswInner>>,
    building: AtomicBool,
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HnswIndex {
    /// Create an uninitialized index. Incremental adds fail (and are treated
    /// as best-effort by the store) until `initialize` or `build_index` runs.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
            building: AtomicBool::new(false),
        }
    }

    /// Reset all state and fix the vector dimension.
    pub fn initialize(&self, dim: usize) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(HnswInner::new(dim));
    }

    /// Drop all indexed vectors, returning to the uninitialized state.
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn dimension(&self) -> Option<usize> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|inner| inner.dim)
    }

    /// Append one vector incrementally. The vector must already be
    /// L2-normalized (the store normalizes before indexing).
    pub fn add_vector(&self, id: DocId, vector: &[f32]) -> Result<(), IndexError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let inner = guard.as_mut().ok_or(IndexError::NotInitialized)?;
        inner.add(id, vector)
    }

    /// Tombstone vectors for deleted documents. Unknown ids are ignored.
    pub fn remove(&self, ids: &[DocId]) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(inner) = guard.as_mut() {
            for id in ids {
                if let Some(&label) = inner.id_map.get(&id.0) {
                    inner.tombstones.insert(label);
                }
            }
        }
    }

    /// Gate for the ANN path: false when disabled by configuration, when the
    /// candidate set is below the configured floor, or when the index holds
    /// no live vectors.
    pub fn should_use_hnsw(&self, total_candidates: usize, config: &EmbeddingConfig) -> bool {
        config.use_hnsw && total_candidates >= config.hnsw_min_vectors && self.live_len() > 0
    }

    /// Full rebuild from the store in fixed-size batches, yielding between
    /// batches and reporting `(processed, total)` progress. A build already
    /// in flight makes this call a no-op rather than queueing or erroring.
    pub async fn build_index(
        &self,
        store: &dyn DocumentReader,
        mut progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<BuildOutcome, IndexError> {
        if self.building.swap(true, Ordering::SeqCst) {
            debug!("hnsw build already in flight; skipping");
            return Ok(BuildOutcome::AlreadyInFlight);
        }
        let result = self.build_inner(store, &mut progress).await;
        self.building.store(false, Ordering::SeqCst);
        result
    }

    async fn build_inner(
        &self,
        store: &dyn DocumentReader,
        progress: &mut Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<BuildOutcome, IndexError> {
        let total = store
            .document_count()
            .map_err(|e| IndexError::Backend(e.to_string()))?;

        let mut indexed = 0usize;
        let mut processed = 0usize;
        let mut offset = 0usize;
        let mut fresh: Option<HnswInner> = None;

        loop {
            let batch = store
                .page_documents(offset, SCAN_BATCH)
                .map_err(|e| IndexError::Backend(e.to_string()))?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();

            for doc in &batch {
                processed += 1;
                let vector = &doc.normalized_embedding;
                let inner =
                    fresh.get_or_insert_with(|| HnswInner::new(vector.len()));
                match inner.add(doc.id, vector) {
                    Ok(()) => indexed += 1,
                    Err(err) => {
                        // Malformed row: skip it, the rest of the batch continues.
                        warn!(id = %doc.id, error = %err, "skipping document during hnsw build");
                    }
                }
            }
            if let Some(cb) = progress.as_mut() {
                cb(processed, total);
            }
            tokio::task::yield_now().await;
        }

        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
        debug!(indexed, total, "hnsw build complete");
        Ok(BuildOutcome::Built { indexed })
    }
}

impl HnswIndex {
    /// Number of live (non-tombstoned) vectors currently indexed.
    pub fn live_len(&self) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(HnswInner::live_len).unwrap_or(0)
    }
}

impl VectorSearcher for HnswIndex {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(DocId, f32)>, IndexError> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let inner = match guard.as_ref() {
            Some(inner) => inner,
            None => return Ok(Vec::new()),
        };
        if k == 0 || inner.live_len() == 0 {
            return Ok(Vec::new());
        }
        if query.len() != inner.dim {
            return Err(IndexError::DimensionMismatch {
                expected: inner.dim,
                actual: query.len(),
            });
        }

        // Over-fetch to survive tombstones and the similarity floor.
        let fetch = k * 5;
        let ef_search = (k * 10).max(k);
        let neighbours = inner.hnsw.search(query, fetch, ef_search);

        let mut out = Vec::with_capacity(k);
        for n in neighbours {
            let label = n.d_id;
            if inner.tombstones.contains(&label) {
                continue;
            }
            let similarity = 1.0f32 - n.distance;
            if similarity < min_similarity {
                continue;
            }
            out.push((inner.rev_map[label], similarity));
            if out.len() >= k {
                break;
            }
        }
        Ok(out)
    }

    fn live_len(&self) -> usize {
        HnswIndex::live_len(self)
    }
}
