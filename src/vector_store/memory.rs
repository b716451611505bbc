//! In-memory vector store for tests.

use super::{cosine_similarity, ChunkRecord, ScoredChunk, VectorStore};
use crate::error::{HarkError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Vector store held entirely in memory.
#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<HashMap<String, ChunkRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, ChunkRecord>>> {
        self.records
            .read()
            .map_err(|e| HarkError::VectorStore(format!("lock poisoned: {}", e)))
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_batch(&self, records: &[ChunkRecord]) -> Result<usize> {
        let mut map = self
            .records
            .write()
            .map_err(|e| HarkError::VectorStore(format!("lock poisoned: {}", e)))?;
        for record in records {
            map.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<ScoredChunk>> {
        let map = self.read()?;
        let mut scored: Vec<ScoredChunk> = map
            .values()
            .map(|record| ScoredChunk {
                score: cosine_similarity(query_embedding, &record.embedding),
                record: record.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let map = self.read()?;
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn get_by_submission(&self, submission_id: i64) -> Result<Vec<ChunkRecord>> {
        let map = self.read()?;
        let mut records: Vec<ChunkRecord> = map
            .values()
            .filter(|r| r.submission_id == submission_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.ordinal);
        Ok(records)
    }

    async fn all_records(&self) -> Result<Vec<ChunkRecord>> {
        let map = self.read()?;
        let mut records: Vec<ChunkRecord> = map.values().cloned().collect();
        records.sort_by(|a, b| (a.submission_id, a.ordinal).cmp(&(b.submission_id, b.ordinal)));
        Ok(records)
    }

    async fn delete_by_submission(&self, submission_id: i64) -> Result<usize> {
        let mut map = self
            .records
            .write()
            .map_err(|e| HarkError::VectorStore(format!("lock poisoned: {}", e)))?;
        let before = map.len();
        map.retain(|_, r| r.submission_id != submission_id);
        Ok(before - map.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
