//! Local hybrid index: FTS5 for lexical matching plus stored vectors.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{DocumentResult, SearchIndex};
use crate::db::{Database, DatabaseError};
use crate::error::IndexError;
use crate::model::{IndexDocument, RecordId};

/// A lexical match returned by [`SqliteSearchIndex::search_lexical`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: RecordId,
    pub title: String,
    pub score: f64,
}

/// Search index stored in SQLite.
#[derive(Clone)]
pub struct SqliteSearchIndex {
    db: Database,
}

fn unavailable(err: DatabaseError) -> IndexError {
    IndexError::Unavailable(err.to_string())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Quotes every term so user input cannot break FTS5 query syntax.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl SqliteSearchIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Keyword search over title, body and attribution.
    pub fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let expr = fts_query(query);
        if expr.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT rowid, title, bm25(index_fts) FROM index_fts
                     WHERE index_fts MATCH ?1 ORDER BY bm25(index_fts) LIMIT ?2",
                )?;
                let hits = stmt
                    .query_map(params![expr, limit as i64], |r| {
                        Ok(SearchHit {
                            id: RecordId(r.get(0)?),
                            title: r.get(1)?,
                            score: -r.get::<_, f64>(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(hits)
            })
            .map_err(unavailable)
    }

    /// Reads back an indexed document.
    pub fn document(&self, id: RecordId) -> Result<Option<IndexDocument>, IndexError> {
        self.db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT record_id, entity_kind, version, title, body, attribution,
                                recorded_at, embedding
                         FROM index_documents WHERE record_id = ?1",
                        params![id.0],
                        |r| {
                            let entity_kind: String = r.get(1)?;
                            let version: i64 = r.get(2)?;
                            let recorded_at: Option<String> = r.get(6)?;
                            let embedding: Option<Vec<u8>> = r.get(7)?;
                            Ok(IndexDocument {
                                id: RecordId(r.get(0)?),
                                entity_kind: entity_kind.into(),
                                version: version as u64,
                                title: r.get(3)?,
                                text: r.get(4)?,
                                attribution: r.get(5)?,
                                recorded_at: recorded_at
                                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                                    .map(|t| t.with_timezone(&Utc)),
                                embedding: embedding.map(|b| decode_vector(&b)),
                            })
                        },
                    )
                    .optional()?)
            })
            .map_err(unavailable)
    }

    pub fn count(&self) -> Result<u64, IndexError> {
        self.db
            .with_conn(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM index_documents", [], |r| r.get(0))?;
                Ok(n as u64)
            })
            .map_err(unavailable)
    }
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn upsert_batch(
        &self,
        documents: &[IndexDocument],
    ) -> Result<Vec<DocumentResult>, IndexError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                let mut results = Vec::with_capacity(documents.len());

                for doc in documents {
                    if doc.text.trim().is_empty() {
                        results.push(DocumentResult::rejected(
                            doc.id,
                            IndexError::Rejected(format!("record {} has no text", doc.id)),
                        ));
                        continue;
                    }

                    tx.execute(
                        "INSERT INTO index_documents (record_id, entity_kind, version, title, body,
                         attribution, recorded_at, embedding, indexed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(record_id) DO UPDATE SET
                            entity_kind = excluded.entity_kind,
                            version = excluded.version,
                            title = excluded.title,
                            body = excluded.body,
                            attribution = excluded.attribution,
                            recorded_at = excluded.recorded_at,
                            embedding = excluded.embedding,
                            indexed_at = excluded.indexed_at",
                        params![
                            doc.id.0,
                            doc.entity_kind.as_str(),
                            doc.version as i64,
                            doc.title,
                            doc.text,
                            doc.attribution,
                            doc.recorded_at.map(|t| t.to_rfc3339()),
                            doc.embedding.as_deref().map(encode_vector),
                            now,
                        ],
                    )?;
                    tx.execute("DELETE FROM index_fts WHERE rowid = ?1", params![doc.id.0])?;
                    tx.execute(
                        "INSERT INTO index_fts (rowid, title, body, attribution)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![doc.id.0, doc.title, doc.text, doc.attribution],
                    )?;
                    results.push(DocumentResult::ok(doc.id));
                }

                tx.commit()?;
                Ok(results)
            })
            .map_err(unavailable)
    }

    async fn delete_batch(&self, ids: &[RecordId]) -> Result<(), IndexError> {
        self.db
            .with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                for id in ids {
                    tx.execute(
                        "DELETE FROM index_documents WHERE record_id = ?1",
                        params![id.0],
                    )?;
                    tx.execute("DELETE FROM index_fts WHERE rowid = ?1", params![id.0])?;
                }
                tx.commit()?;
                Ok(())
            })
            .map_err(unavailable)
    }
}
