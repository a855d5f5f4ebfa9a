//! SQLite-backed reference implementation of the persistence contract.

use std::collections::BTreeMap;
use std::path::Path;

use memory_model::{DocId, MemoryKind, MemoryMetadata, VectorDocument};
use rusqlite::{params, Connection};

use crate::{MemoryBackend, MemoryFilter, NewDocument, StoreError};

/// Fixed per-row overhead added to the size estimate (ids, norms, metadata).
const ROW_OVERHEAD_BYTES: u64 = 128;

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open an in-memory store and initialize the schema.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Open a file-backed store at `path`, initializing the schema if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend_err)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        // Pragmas for durability and concurrency
        self.conn
            .pragma_update(None, "journal_mode", &"WAL")
            .map_err(backend_err)?;
        self.conn
            .pragma_update(None, "synchronous", &"NORMAL")
            .map_err(backend_err)?;

        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS memories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    content TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    normalized BLOB NOT NULL,
                    norm REAL NOT NULL,
                    kind TEXT NOT NULL,
                    session_id TEXT,
                    file_id TEXT,
                    url TEXT,
                    title TEXT,
                    timestamp INTEGER NOT NULL,
                    chunk_index INTEGER,
                    total_chunks INTEGER,
                    role TEXT,
                    chat_id TEXT,
                    message_id TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);
                CREATE INDEX IF NOT EXISTS idx_memories_file ON memories(file_id);
                CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp);
                "#,
            )
            .map_err(backend_err)?;
        Ok(())
    }
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(v).to_vec()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Backend(format!(
            "invalid embedding blob length {}",
            blob.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec::<u8, f32>(blob))
}

const DOC_COLUMNS: &str = "id, content, embedding, normalized, norm, kind, session_id, file_id, \
                           url, title, timestamp, chunk_index, total_chunks, role, chat_id, \
                           message_id";

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorDocument> {
    let id: i64 = row.get(0)?;
    let content: String = row.get(1)?;
    let embedding_blob: Vec<u8> = row.get(2)?;
    let normalized_blob: Vec<u8> = row.get(3)?;
    let norm: f64 = row.get(4)?;
    let kind_raw: String = row.get(5)?;

    let kind = MemoryKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown memory kind: {kind_raw}").into(),
        )
    })?;
    let embedding = decode_vector(&embedding_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Blob,
            e.to_string().into(),
        )
    })?;
    let normalized_embedding = decode_vector(&normalized_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Blob,
            e.to_string().into(),
        )
    })?;

    let metadata = MemoryMetadata {
        kind,
        session_id: row.get(6)?,
        file_id: row.get(7)?,
        url: row.get(8)?,
        title: row.get(9)?,
        timestamp: row.get(10)?,
        chunk_index: row
            .get::<_, Option<i64>>(11)?
            .and_then(|v| u32::try_from(v).ok()),
        total_chunks: row
            .get::<_, Option<i64>>(12)?
            .and_then(|v| u32::try_from(v).ok()),
        role: row.get(13)?,
        chat_id: row.get(14)?,
        message_id: row.get(15)?,
    };

    Ok(VectorDocument {
        id: DocId(id),
        content,
        embedding,
        normalized_embedding,
        norm: norm as f32,
        metadata,
    })
}

/// Build a WHERE clause (starting with `WHERE 1=1`) plus bound params for a
/// conjunctive metadata filter.
fn filter_sql(filter: &MemoryFilter) -> (String, Vec<rusqlite::types::Value>) {
    let mut where_sql = String::from("WHERE 1=1");
    let mut params: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(kind) = filter.kind {
        where_sql.push_str(" AND kind = ?");
        params.push(kind.as_str().to_string().into());
    }
    if let Some(session_id) = &filter.session_id {
        where_sql.push_str(" AND session_id = ?");
        params.push(session_id.clone().into());
    }
    if let Some(file_id) = &filter.file_id {
        where_sql.push_str(" AND file_id = ?");
        params.push(file_id.clone().into());
    }
    if let Some(file_ids) = &filter.file_ids {
        if !file_ids.is_empty() {
            where_sql.push_str(" AND file_id IN (");
            for (i, fid) in file_ids.iter().enumerate() {
                if i > 0 {
                    where_sql.push(',');
                }
                where_sql.push('?');
                params.push(fid.clone().into());
            }
            where_sql.push(')');
        }
    }
    if let Some(url) = &filter.url {
        where_sql.push_str(" AND url = ?");
        params.push(url.clone().into());
    }

    (where_sql, params)
}

fn id_placeholders(n: usize) -> String {
    let mut placeholders = String::from("(");
    for i in 0..n {
        if i > 0 {
            placeholders.push(',');
        }
        placeholders.push('?');
    }
    placeholders.push(')');
    placeholders
}

impl MemoryBackend for SqliteBackend {
    fn insert(&mut self, doc: &NewDocument<'_>) -> Result<DocId, StoreError> {
        let meta = doc.metadata;
        self.conn
            .execute(
                r#"
                INSERT INTO memories (
                    content, embedding, normalized, norm, kind, session_id, file_id,
                    url, title, timestamp, chunk_index, total_chunks, role, chat_id, message_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    doc.content,
                    encode_vector(doc.embedding),
                    encode_vector(doc.normalized_embedding),
                    doc.norm as f64,
                    meta.kind.as_str(),
                    meta.session_id,
                    meta.file_id,
                    meta.url,
                    meta.title,
                    meta.timestamp,
                    meta.chunk_index.map(|v| v as i64),
                    meta.total_chunks.map(|v| v as i64),
                    meta.role,
                    meta.chat_id,
                    meta.message_id,
                ],
            )
            .map_err(backend_err)?;
        Ok(DocId(self.conn.last_insert_rowid()))
    }

    fn get(&self, id: DocId) -> Result<Option<VectorDocument>, StoreError> {
        let sql = format!("SELECT {DOC_COLUMNS} FROM memories WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql).map_err(backend_err)?;
        let mut rows = stmt
            .query_map(params![id.0], decode_row)
            .map_err(backend_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(backend_err)?)),
            None => Ok(None),
        }
    }

    fn get_by_ids(&self, ids: &[DocId]) -> Result<Vec<VectorDocument>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {DOC_COLUMNS} FROM memories WHERE id IN {}",
            id_placeholders(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql).map_err(backend_err)?;
        let id_params: Vec<i64> = ids.iter().map(|d| d.0).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(id_params.iter()), decode_row)
            .map_err(backend_err)?;

        let mut by_id = std::collections::HashMap::with_capacity(ids.len());
        for row in rows {
            let doc = row.map_err(backend_err)?;
            by_id.insert(doc.id, doc);
        }
        // Preserve requested order
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = by_id.remove(id) {
                out.push(doc);
            }
        }
        Ok(out)
    }

    fn find_session_duplicate(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<Option<DocId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM memories WHERE session_id = ?1 AND content = ?2 \
                 ORDER BY id LIMIT 1",
            )
            .map_err(backend_err)?;
        let mut rows = stmt
            .query_map(params![session_id, content], |row| {
                row.get::<_, i64>(0).map(DocId)
            })
            .map_err(backend_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(backend_err)?)),
            None => Ok(None),
        }
    }

    fn count(&self, filter: &MemoryFilter) -> Result<usize, StoreError> {
        let (where_sql, params) = filter_sql(filter);
        let sql = format!("SELECT COUNT(*) FROM memories {where_sql}");
        let n: i64 = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(params.into_iter()), |r| {
                r.get(0)
            })
            .map_err(backend_err)?;
        Ok(n as usize)
    }

    fn scan(&self, filter: &MemoryFilter) -> Result<Vec<VectorDocument>, StoreError> {
        let (where_sql, params) = filter_sql(filter);
        let sql =
            format!("SELECT {DOC_COLUMNS} FROM memories {where_sql} ORDER BY timestamp ASC, id ASC");
        let mut stmt = self.conn.prepare(&sql).map_err(backend_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), decode_row)
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn scan_page(
        &self,
        filter: &MemoryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<VectorDocument>, StoreError> {
        let (where_sql, mut params) = filter_sql(filter);
        let sql = format!(
            "SELECT {DOC_COLUMNS} FROM memories {where_sql} ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        params.push((limit as i64).into());
        params.push((offset as i64).into());
        let mut stmt = self.conn.prepare(&sql).map_err(backend_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), decode_row)
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn ids_by_filter(&self, filter: &MemoryFilter) -> Result<Vec<DocId>, StoreError> {
        let (where_sql, params) = filter_sql(filter);
        let sql = format!("SELECT id FROM memories {where_sql} ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql).map_err(backend_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), |row| {
                row.get::<_, i64>(0).map(DocId)
            })
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn oldest_ids(&self, limit: usize) -> Result<Vec<DocId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM memories ORDER BY timestamp ASC, id ASC LIMIT ?1")
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, i64>(0).map(DocId))
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn ids_older_than(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<DocId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM memories WHERE timestamp < ?1 \
                 ORDER BY timestamp ASC, id ASC LIMIT ?2",
            )
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![cutoff_ms, limit as i64], |row| {
                row.get::<_, i64>(0).map(DocId)
            })
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn duplicate_ids(&self) -> Result<Vec<DocId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM memories WHERE id NOT IN (\
                     SELECT MIN(id) FROM memories \
                     GROUP BY content, IFNULL(session_id, ''), IFNULL(file_id, ''), \
                              IFNULL(url, '')\
                 ) ORDER BY id ASC",
            )
            .map_err(backend_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(DocId))
            .map_err(backend_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend_err)?);
        }
        Ok(out)
    }

    fn delete_by_ids(&mut self, ids: &[DocId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM memories WHERE id IN {}",
            id_placeholders(ids.len())
        );
        let id_params: Vec<i64> = ids.iter().map(|d| d.0).collect();
        let n = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(id_params.iter()))
            .map_err(backend_err)?;
        Ok(n)
    }

    fn estimated_size_bytes(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT IFNULL(SUM(LENGTH(content) + LENGTH(embedding) + LENGTH(normalized) \
                 + ?1), 0) FROM memories",
                params![ROW_OVERHEAD_BYTES as i64],
                |r| r.get(0),
            )
            .map_err(backend_err)?;
        Ok(n.max(0) as u64)
    }

    fn counts_by_kind(&self) -> Result<BTreeMap<MemoryKind, usize>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, COUNT(*) FROM memories GROUP BY kind")
            .map_err(backend_err)?;
        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((kind, count))
            })
            .map_err(backend_err)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (kind_raw, count) = row.map_err(backend_err)?;
            if let Some(kind) = MemoryKind::parse(&kind_raw) {
                out.insert(kind, count as usize);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_model::MemoryKind;

    fn meta(kind: MemoryKind, ts: i64) -> MemoryMetadata {
        MemoryMetadata::new(kind, ts)
    }

    fn insert_simple(
        backend: &mut SqliteBackend,
        content: &str,
        metadata: &MemoryMetadata,
    ) -> DocId {
        let embedding = [1.0f32, 2.0, 2.0];
        let doc = NewDocument {
            content,
            embedding: &embedding,
            normalized_embedding: &[1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0],
            norm: 3.0,
            metadata,
        };
        backend.insert(&doc).expect("insert")
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let a = insert_simple(&mut backend, "one", &meta(MemoryKind::Chat, 1));
        let b = insert_simple(&mut backend, "two", &meta(MemoryKind::Chat, 2));
        let c = insert_simple(&mut backend, "three", &meta(MemoryKind::Chat, 3));
        assert!(a < b && b < c);
    }

    #[test]
    fn roundtrips_embeddings_through_blobs() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let id = insert_simple(&mut backend, "hello", &meta(MemoryKind::File, 42));
        let doc = backend.get(id).unwrap().expect("stored document");
        assert_eq!(doc.content, "hello");
        assert_eq!(doc.embedding, vec![1.0, 2.0, 2.0]);
        assert_eq!(doc.norm, 3.0);
        assert_eq!(doc.metadata.kind, MemoryKind::File);
        assert_eq!(doc.metadata.timestamp, 42);
    }

    #[test]
    fn unknown_id_is_absent_not_an_error() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(backend.get(DocId(999)).unwrap().is_none());
    }

    #[test]
    fn filters_compose_conjunctively() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let mut chat = meta(MemoryKind::Chat, 1);
        chat.session_id = Some("s1".into());
        insert_simple(&mut backend, "a", &chat);
        let mut file = meta(MemoryKind::File, 2);
        file.file_id = Some("f1".into());
        insert_simple(&mut backend, "b", &file);

        assert_eq!(backend.count(&MemoryFilter::default()).unwrap(), 2);
        assert_eq!(backend.count(&MemoryFilter::for_session("s1")).unwrap(), 1);
        assert_eq!(backend.count(&MemoryFilter::for_file("f1")).unwrap(), 1);
        assert_eq!(
            backend.count(&MemoryFilter::for_kind(MemoryKind::Webpage)).unwrap(),
            0
        );
    }

    #[test]
    fn scan_orders_by_timestamp_ascending() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        insert_simple(&mut backend, "newer", &meta(MemoryKind::Chat, 200));
        insert_simple(&mut backend, "older", &meta(MemoryKind::Chat, 100));
        let docs = backend.scan(&MemoryFilter::default()).unwrap();
        assert_eq!(docs[0].content, "older");
        assert_eq!(docs[1].content, "newer");
    }

    #[test]
    fn oldest_ids_follow_timestamp_order() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let newer = insert_simple(&mut backend, "newer", &meta(MemoryKind::Chat, 300));
        let oldest = insert_simple(&mut backend, "oldest", &meta(MemoryKind::Chat, 100));
        let middle = insert_simple(&mut backend, "middle", &meta(MemoryKind::Chat, 200));
        assert_eq!(backend.oldest_ids(2).unwrap(), vec![oldest, middle]);
        assert_eq!(backend.oldest_ids(10).unwrap(), vec![oldest, middle, newer]);
    }

    #[test]
    fn duplicate_ids_keep_earliest_of_each_group() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let mut m = meta(MemoryKind::Chat, 1);
        m.session_id = Some("s1".into());
        let first = insert_simple(&mut backend, "same", &m);
        let second = insert_simple(&mut backend, "same", &m);
        let third = insert_simple(&mut backend, "same", &m);
        insert_simple(&mut backend, "different", &m);

        let dups = backend.duplicate_ids().unwrap();
        assert_eq!(dups, vec![second, third]);
        assert!(!dups.contains(&first));
    }

    #[test]
    fn delete_by_ids_reports_affected_rows() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let a = insert_simple(&mut backend, "a", &meta(MemoryKind::Chat, 1));
        let b = insert_simple(&mut backend, "b", &meta(MemoryKind::Chat, 2));
        assert_eq!(backend.delete_by_ids(&[a, b, DocId(999)]).unwrap(), 2);
        assert_eq!(backend.count(&MemoryFilter::default()).unwrap(), 0);
    }

    #[test]
    fn size_estimate_grows_with_content() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let empty = backend.estimated_size_bytes().unwrap();
        assert_eq!(empty, 0);
        insert_simple(&mut backend, "some content here", &meta(MemoryKind::Chat, 1));
        assert!(backend.estimated_size_bytes().unwrap() > 0);
    }
}
