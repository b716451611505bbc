//! Candidate re-ranking.
//!
//! Scores each (query, chunk) pair independently and reorders the hybrid
//! candidates by that score, breaking ties by the original hybrid rank.
//! Pairs are scored as parallel tasks behind a join barrier with a
//! per-task timeout; a task that times out or errors keeps its hybrid
//! position via a zero score.

use super::hybrid::{extract_keywords, HybridHit};
use crate::error::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Scores the relevance of one chunk to one query, in [0,1].
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, text: &str) -> Result<f32>;
}

/// Keyword-overlap scorer with a mild length penalty: prefers chunks that
/// cover the query terms and are neither tiny nor sprawling.
pub struct LexicalOverlapScorer;

#[async_trait]
impl RelevanceScorer for LexicalOverlapScorer {
    async fn score(&self, query: &str, text: &str) -> Result<f32> {
        let query_words: HashSet<String> = extract_keywords(query).into_iter().collect();
        let text_words: HashSet<String> = extract_keywords(text).into_iter().collect();

        let overlap = query_words.intersection(&text_words).count() as f32;
        let coverage = overlap / query_words.len().max(1) as f32;

        let word_count = text.split_whitespace().count();
        let length_penalty = if word_count < 10 {
            0.8
        } else if word_count > 300 {
            0.9
        } else {
            1.0
        };

        Ok(coverage * length_penalty)
    }
}

/// Re-rank hybrid candidates, returning the top `top_n` with their re-rank
/// scores.
pub async fn rerank(
    query: &str,
    hits: Vec<HybridHit>,
    scorer: Arc<dyn RelevanceScorer>,
    top_n: usize,
    per_task_timeout: Duration,
) -> Result<Vec<(HybridHit, f32)>> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let tasks = hits.iter().map(|hit| {
        let scorer = scorer.clone();
        let query = query.to_string();
        let text = hit.record.text.clone();
        async move { tokio::time::timeout(per_task_timeout, scorer.score(&query, &text)).await }
    });

    let results = join_all(tasks).await;

    let mut scored: Vec<(HybridHit, f32)> = hits
        .into_iter()
        .zip(results)
        .map(|(hit, result)| {
            let score = match result {
                Ok(Ok(score)) => score,
                Ok(Err(e)) => {
                    warn!("Scorer failed for chunk {}: {}", hit.record.id, e);
                    0.0
                }
                Err(_) => {
                    warn!("Scorer timed out for chunk {}", hit.record.id);
                    0.0
                }
            };
            (hit, score)
        })
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rank.cmp(&b.rank))
    });
    scored.truncate(top_n);

    debug!("Re-ranked to {} results", scored.len());
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::ChunkRecord;
    use chrono::Utc;

    fn hit(id: &str, text: &str, score: f32, rank: usize) -> HybridHit {
        HybridHit {
            record: ChunkRecord {
                id: id.to_string(),
                submission_id: 1,
                ordinal: rank as u32,
                text: text.to_string(),
                embedding: vec![],
                indexed_at: Utc::now(),
            },
            semantic_score: score,
            lexical_score: 0.0,
            score,
            rank,
        }
    }

    #[tokio::test]
    async fn test_rerank_promotes_overlapping_chunk() {
        let hits = vec![
            hit("a", "entirely unrelated content about weather patterns today", 0.9, 0),
            hit("b", "rust ownership and borrowing explained with examples here", 0.8, 1),
        ];

        let reranked = rerank(
            "rust ownership borrowing",
            hits,
            Arc::new(LexicalOverlapScorer),
            2,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert_eq!(reranked[0].0.record.id, "b");
        assert!(reranked[0].1 > reranked[1].1);
    }

    #[tokio::test]
    async fn test_ties_break_by_hybrid_rank() {
        struct ConstantScorer;

        #[async_trait]
        impl RelevanceScorer for ConstantScorer {
            async fn score(&self, _query: &str, _text: &str) -> Result<f32> {
                Ok(0.5)
            }
        }

        let hits = vec![
            hit("second", "x", 0.7, 1),
            hit("first", "y", 0.9, 0),
        ];

        let reranked = rerank(
            "anything",
            hits,
            Arc::new(ConstantScorer),
            2,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert_eq!(reranked[0].0.record.id, "first");
        assert_eq!(reranked[1].0.record.id, "second");
    }

    #[tokio::test]
    async fn test_timed_out_scorer_falls_back_to_zero() {
        struct SlowScorer;

        #[async_trait]
        impl RelevanceScorer for SlowScorer {
            async fn score(&self, _query: &str, _text: &str) -> Result<f32> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1.0)
            }
        }

        let hits = vec![hit("a", "x", 0.9, 0)];
        let reranked = rerank(
            "q",
            hits,
            Arc::new(SlowScorer),
            1,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(reranked.len(), 1);
        assert_eq!(reranked[0].1, 0.0);
    }
}
