//! SQLite-based vector store.
//!
//! Cosine similarity is computed in Rust over all stored vectors. Fine for
//! a single-host corpus; swap in a dedicated vector database behind the
//! same trait when the collection outgrows this.

use super::{cosine_similarity, ChunkRecord, ScoredChunk, VectorStore};
use crate::error::{HarkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

/// SQLite-backed vector store.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    submission_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    indexed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_submission ON chunks(submission_id);
"#;

impl SqliteVectorStore {
    /// Open (or create) the store at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized vector store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HarkError::VectorStore(format!("Failed to acquire lock: {}", e)))
    }

    fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().unwrap_or_default();
                f32::from_le_bytes(arr)
            })
            .collect()
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let blob: Vec<u8> = row.get("embedding")?;
    let indexed_at: String = row.get("indexed_at")?;

    Ok(ChunkRecord {
        id: row.get("id")?,
        submission_id: row.get("submission_id")?,
        ordinal: row.get("ordinal")?,
        text: row.get("text")?,
        embedding: SqliteVectorStore::bytes_to_embedding(&blob),
        indexed_at: DateTime::parse_from_rfc3339(&indexed_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_batch(&self, records: &[ChunkRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for record in records {
            tx.execute(
                "INSERT OR REPLACE INTO chunks
                 (id, submission_id, ordinal, text, embedding, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.submission_id,
                    record.ordinal,
                    record.text,
                    Self::embedding_to_bytes(&record.embedding),
                    record.indexed_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        debug!("Upserted {} chunks", records.len());
        Ok(records.len())
    }

    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<ScoredChunk>> {
        let records = self.all_records().await?;

        let mut scored: Vec<ScoredChunk> = records
            .into_iter()
            .map(|record| {
                let score = cosine_similarity(query_embedding, &record.embedding);
                ScoredChunk { record, score }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM chunks WHERE id = ?1")?;

        let mut records = Vec::new();
        for id in ids {
            let found = stmt
                .query_row(params![id], row_to_record)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(record) = found {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn get_by_submission(&self, submission_id: i64) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM chunks WHERE submission_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![submission_id], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn all_records(&self) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM chunks")?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn delete_by_submission(&self, submission_id: i64) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM chunks WHERE submission_id = ?1",
            params![submission_id],
        )?;
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, submission_id: i64, ordinal: u32, text: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            submission_id,
            ordinal,
            text: text.to_string(),
            embedding,
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteVectorStore::in_memory().unwrap();
        let records = vec![
            record("a", 1, 0, "first", vec![1.0, 0.0]),
            record("b", 1, 1, "second", vec![0.0, 1.0]),
        ];

        store.upsert_batch(&records).await.unwrap();
        store.upsert_batch(&records).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert_batch(&[
                record("a", 1, 0, "x-axis", vec![1.0, 0.0]),
                record("b", 1, 1, "y-axis", vec![0.0, 1.0]),
                record("c", 1, 2, "diagonal", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, "a");
        assert_eq!(hits[1].record.id, "c");
    }

    #[tokio::test]
    async fn test_get_by_ids_skips_missing() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert_batch(&[record("a", 1, 0, "x", vec![1.0])])
            .await
            .unwrap();

        let found = store
            .get_by_ids(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn test_delete_by_submission() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert_batch(&[
                record("a", 1, 0, "x", vec![1.0]),
                record("b", 2, 0, "y", vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_by_submission(1).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
