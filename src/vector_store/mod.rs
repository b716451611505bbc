//! Vector store abstraction.
//!
//! Stores chunk embeddings under deterministic chunk ids, making writes
//! idempotent; retries after partial failures simply upsert the missing
//! ids.

mod memory;
mod sqlite;

pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An indexed chunk with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Deterministic chunk id (hash of submission id and ordinal).
    pub id: String,
    /// Parent submission.
    pub submission_id: i64,
    /// 0-based position within the submission.
    pub ordinal: u32,
    /// Chunk text.
    pub text: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// When this record was (last) written.
    pub indexed_at: DateTime<Utc>,
}

/// A search hit with similarity score (higher is better).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Trait for vector store implementations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent bulk upsert keyed by chunk id. Returns the count written.
    async fn upsert_batch(&self, records: &[ChunkRecord]) -> Result<usize>;

    /// Top-k by cosine similarity against the query embedding.
    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<ScoredChunk>>;

    /// Fetch records by id; missing ids are simply absent from the result.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ChunkRecord>>;

    /// All records for a submission, ordered by ordinal.
    async fn get_by_submission(&self, submission_id: i64) -> Result<Vec<ChunkRecord>>;

    /// Every stored record. Drives the lexical pass of hybrid search.
    async fn all_records(&self) -> Result<Vec<ChunkRecord>>;

    /// Delete a submission's records. Returns the count removed.
    async fn delete_by_submission(&self, submission_id: i64) -> Result<usize>;

    /// Total record count.
    async fn count(&self) -> Result<usize>;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
