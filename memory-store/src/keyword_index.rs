//! In-memory full-text index over document content.
//!
//! Backed by a tantivy index held in RAM plus an `id -> normalized content`
//! map used for matched-term extraction. Like the ANN index this is a
//! derived cache: it never persists and is rebuilt from the store via
//! [`KeywordIndex::build_from_documents`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use memory_model::{DocId, KeywordHit, VectorDocument};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Schema, STORED, STRING, TEXT};
use tantivy::{doc, Index, Term};
use tracing::debug;

use crate::{BuildOutcome, IndexError, SCAN_BATCH};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// How multi-term queries combine: `And` requires every term, `Or` any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineMode {
    And,
    #[default]
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSearchOptions {
    pub limit: usize,
    /// Tolerate small edit-distance typos.
    pub fuzzy: bool,
    /// Match word prefixes.
    pub prefix: bool,
    pub combine: CombineMode,
}

impl Default for KeywordSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            fuzzy: false,
            prefix: false,
            combine: CombineMode::Or,
        }
    }
}

pub struct KeywordIndex {
    index: Index,
    reader: tantivy::IndexReader,
    f_id: tantivy::schema::Field,
    f_content: tantivy::schema::Field,
    /// id -> lowercased content, mirrored for matched-term extraction.
    docs: RwLock<HashMap<i64, String>>,
    building: AtomicBool,
}

impl KeywordIndex {
    pub fn new() -> Result<Self, IndexError> {
        let mut schema_builder = Schema::builder();
        let f_id = schema_builder.add_text_field("id", STRING | STORED);
        let f_content = schema_builder.add_text_field("content", TEXT);
        let schema = schema_builder.build();
        let index = Index::create_in_ram(schema);
        let reader = index.reader().map_err(tantivy_err)?;
        Ok(Self {
            index,
            reader,
            f_id,
            f_content,
            docs: RwLock::new(HashMap::new()),
            building: AtomicBool::new(false),
        })
    }

    /// Index (or re-index) one document. Re-adding the same id replaces the
    /// prior entry rather than duplicating it.
    pub fn add_document(&self, id: DocId, content: &str) -> Result<(), IndexError> {
        let mut writer: tantivy::IndexWriter = self.index.writer(WRITER_HEAP_BYTES).map_err(tantivy_err)?;
        writer.delete_term(Term::from_field_text(self.f_id, &id.to_string()));
        writer
            .add_document(doc! {
                self.f_id => id.to_string(),
                self.f_content => content.to_string(),
            })
            .map_err(tantivy_err)?;
        writer.commit().map_err(tantivy_err)?;
        self.reader.reload().map_err(tantivy_err)?;

        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(id.0, content.to_lowercase());
        Ok(())
    }

    /// Remove one document. Unknown ids are a no-op.
    pub fn remove_document(&self, id: DocId) -> Result<(), IndexError> {
        let mut writer: tantivy::IndexWriter = self.index.writer(WRITER_HEAP_BYTES).map_err(tantivy_err)?;
        writer.delete_term(Term::from_field_text(self.f_id, &id.to_string()));
        writer.commit().map_err(tantivy_err)?;
        self.reader.reload().map_err(tantivy_err)?;

        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.remove(&id.0);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), IndexError> {
        let mut writer: tantivy::IndexWriter = self.index.writer(WRITER_HEAP_BYTES).map_err(tantivy_err)?;
        writer.delete_all_documents().map_err(tantivy_err)?;
        writer.commit().map_err(tantivy_err)?;
        self.reader.reload().map_err(tantivy_err)?;

        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ranked search over indexed content. Empty queries and queries with no
    /// matching terms yield an empty result; hits carry the query terms that
    /// were found in the document.
    pub fn search(
        &self,
        query: &str,
        options: &KeywordSearchOptions,
    ) -> Result<Vec<KeywordHit>, IndexError> {
        use tantivy::schema::Value as _;
        let terms = tokenize(query);
        if terms.is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(terms.len());
        for term in &terms {
            let t = Term::from_field_text(self.f_content, term);
            let distance = if options.fuzzy { fuzzy_distance(term) } else { 0 };
            let query: Box<dyn Query> = if options.prefix {
                Box::new(FuzzyTermQuery::new_prefix(t, distance, true))
            } else if distance > 0 {
                Box::new(FuzzyTermQuery::new(t, distance, true))
            } else {
                Box::new(TermQuery::new(t, IndexRecordOption::WithFreqs))
            };
            let occur = match options.combine {
                CombineMode::And => Occur::Must,
                CombineMode::Or => Occur::Should,
            };
            clauses.push((occur, query));
        }
        let combined = BooleanQuery::from(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&combined, &TopDocs::with_limit(options.limit))
            .map_err(tantivy_err)?;

        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc = searcher
                .doc::<tantivy::schema::document::TantivyDocument>(addr)
                .map_err(tantivy_err)?;
            let Some(id) = doc
                .get_first(self.f_id)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            let matched_terms = docs
                .get(&id)
                .map(|content| matched_terms(content, &terms, options))
                .unwrap_or_default();
            out.push(KeywordHit {
                id: DocId(id),
                score,
                document: None,
                matched_terms,
            });
        }
        Ok(out)
    }

    /// Clear and rebuild from the given documents in cooperative batches,
    /// reporting `(processed, total)` progress. Single-flight: a rebuild
    /// requested while one is running is a safe no-op.
    pub async fn build_from_documents(
        &self,
        documents: &[VectorDocument],
        mut progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<BuildOutcome, IndexError> {
        if self.building.swap(true, Ordering::SeqCst) {
            debug!("keyword build already in flight; skipping");
            return Ok(BuildOutcome::AlreadyInFlight);
        }
        let result = self.build_inner(documents, &mut progress).await;
        self.building.store(false, Ordering::SeqCst);
        result
    }

    async fn build_inner(
        &self,
        documents: &[VectorDocument],
        progress: &mut Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<BuildOutcome, IndexError> {
        self.clear()?;
        let total = documents.len();
        let mut processed = 0usize;

        for batch in documents.chunks(SCAN_BATCH) {
            let mut writer: tantivy::IndexWriter = self.index.writer(WRITER_HEAP_BYTES).map_err(tantivy_err)?;
            {
                let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
                for doc in batch {
                    writer
                        .add_document(doc! {
                            self.f_id => doc.id.to_string(),
                            self.f_content => doc.content.clone(),
                        })
                        .map_err(tantivy_err)?;
                    docs.insert(doc.id.0, doc.content.to_lowercase());
                }
            }
            writer.commit().map_err(tantivy_err)?;
            self.reader.reload().map_err(tantivy_err)?;

            processed += batch.len();
            if let Some(cb) = progress.as_mut() {
                cb(processed, total);
            }
            tokio::task::yield_now().await;
        }
        debug!(indexed = processed, "keyword build complete");
        Ok(BuildOutcome::Built { indexed: processed })
    }
}

fn tantivy_err(e: impl std::fmt::Display) -> IndexError {
    IndexError::Backend(e.to_string())
}

/// Lowercase and split on non-alphanumeric boundaries, deduplicating while
/// preserving first-seen order.
fn tokenize(query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Edit-distance budget for a fuzzy term, scaled to term length.
fn fuzzy_distance(term: &str) -> u8 {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

fn matched_terms(content: &str, terms: &[String], options: &KeywordSearchOptions) -> Vec<String> {
    let words: Vec<&str> = content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    terms
        .iter()
        .filter(|term| {
            words.iter().any(|word| {
                if *word == term.as_str() {
                    return true;
                }
                if options.prefix && word.starts_with(term.as_str()) {
                    return true;
                }
                if options.fuzzy {
                    let budget = fuzzy_distance(term) as usize;
                    if budget > 0 && edit_distance(word, term) <= budget {
                        return true;
                    }
                }
                false
            })
        })
        .cloned()
        .collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
