//! Hybrid search: semantic similarity blended with lexical keyword scores.

use crate::embedding::Embedder;
use crate::error::Result;
use crate::vector_store::{ChunkRecord, VectorStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

const STOP_WORDS: &[&str] = &[
    "what", "how", "where", "when", "why", "who", "which", "the", "is", "are",
    "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
    "this", "that", "was", "were", "does", "did", "about",
];

/// A blended search hit.
#[derive(Debug, Clone)]
pub struct HybridHit {
    pub record: ChunkRecord,
    pub semantic_score: f32,
    pub lexical_score: f32,
    /// Blended score.
    pub score: f32,
    /// 0-based rank after blending, used as a re-rank tie-breaker.
    pub rank: usize,
}

/// Extract searchable keywords: lowercase, punctuation stripped, stop words
/// and short tokens removed.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Lexical relevance: keyword match density times keyword coverage.
/// Substring matches inside longer words count half.
pub fn lexical_score(text: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }

    let text_lower = text.to_lowercase();
    let words: Vec<&str> = text_lower.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let mut total_matches = 0.0f32;
    let mut matched_keywords = 0usize;

    for keyword in keywords {
        let exact = text_lower.matches(keyword.as_str()).count() as f32;
        let partial = words
            .iter()
            .filter(|w| w.len() > keyword.len() && w.contains(keyword.as_str()))
            .count() as f32
            * 0.5;

        let count = exact + partial;
        if count > 0.0 {
            matched_keywords += 1;
        }
        total_matches += count;
    }

    let density = total_matches / words.len() as f32;
    let coverage = matched_keywords as f32 / keywords.len() as f32;
    density * coverage
}

/// Bring a score set into [0,1]. Scores already in range pass through
/// unchanged so blending stays exact; out-of-range sets are scaled by their
/// maximum and negatives are clamped.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(0.0f32, f32::max);
    scores
        .iter()
        .map(|s| {
            let s = s.max(0.0);
            if max > 1.0 {
                s / max
            } else {
                s
            }
        })
        .collect()
}

/// Blend normalized semantic and lexical result sets, deduplicating by
/// chunk id and keeping the max score per component.
pub fn blend(
    semantic: Vec<(ChunkRecord, f32)>,
    lexical: Vec<(ChunkRecord, f32)>,
    semantic_weight: f32,
    lexical_weight: f32,
) -> Vec<HybridHit> {
    struct Entry {
        record: ChunkRecord,
        semantic: f32,
        lexical: f32,
    }

    let mut by_id: HashMap<String, Entry> = HashMap::new();

    let semantic_norm = normalize_scores(&semantic.iter().map(|(_, s)| *s).collect::<Vec<_>>());
    for ((record, _), score) in semantic.into_iter().zip(semantic_norm) {
        by_id
            .entry(record.id.clone())
            .and_modify(|e| e.semantic = e.semantic.max(score))
            .or_insert(Entry {
                record,
                semantic: score,
                lexical: 0.0,
            });
    }

    let lexical_norm = normalize_scores(&lexical.iter().map(|(_, s)| *s).collect::<Vec<_>>());
    for ((record, _), score) in lexical.into_iter().zip(lexical_norm) {
        by_id
            .entry(record.id.clone())
            .and_modify(|e| e.lexical = e.lexical.max(score))
            .or_insert(Entry {
                record,
                semantic: 0.0,
                lexical: score,
            });
    }

    let mut hits: Vec<HybridHit> = by_id
        .into_values()
        .map(|e| HybridHit {
            score: semantic_weight * e.semantic + lexical_weight * e.lexical,
            semantic_score: e.semantic,
            lexical_score: e.lexical,
            record: e.record,
            rank: 0,
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i;
    }
    hits
}

/// Hybrid search over a vector store.
pub struct HybridSearch {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    semantic_weight: f32,
    lexical_weight: f32,
}

impl HybridSearch {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        semantic_weight: f32,
        lexical_weight: f32,
    ) -> Self {
        Self {
            vectors,
            embedder,
            semantic_weight,
            lexical_weight,
        }
    }

    /// Semantic top-k only.
    pub async fn semantic(&self, query: &str, limit: usize) -> Result<Vec<HybridHit>> {
        let query_embedding = self.embedder.embed(query).await?;
        let scored = self.vectors.search(&query_embedding, limit).await?;

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, hit)| HybridHit {
                semantic_score: hit.score,
                lexical_score: 0.0,
                score: hit.score,
                record: hit.record,
                rank,
            })
            .collect())
    }

    /// Blended semantic + lexical top-k.
    #[instrument(skip(self), fields(query = %query))]
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<HybridHit>> {
        let query_embedding = self.embedder.embed(query).await?;
        let semantic: Vec<(ChunkRecord, f32)> = self
            .vectors
            .search(&query_embedding, limit * 2)
            .await?
            .into_iter()
            .map(|hit| (hit.record, hit.score))
            .collect();

        let keywords = extract_keywords(query);
        let mut lexical: Vec<(ChunkRecord, f32)> = self
            .vectors
            .all_records()
            .await?
            .into_iter()
            .filter_map(|record| {
                let score = lexical_score(&record.text, &keywords);
                (score > 0.0).then_some((record, score))
            })
            .collect();
        lexical.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        lexical.truncate(limit * 2);

        let mut hits = blend(semantic, lexical, self.semantic_weight, self.lexical_weight);
        hits.truncate(limit);
        debug!("Hybrid search returned {} hits", hits.len());
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            submission_id: 1,
            ordinal: 0,
            text: text.to_string(),
            embedding: vec![],
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_extract_keywords_filters_stopwords() {
        let keywords = extract_keywords("What is the quick brown fox doing?");
        assert_eq!(keywords, vec!["quick", "brown", "fox", "doing"]);
    }

    #[test]
    fn test_lexical_score_rewards_matches() {
        let keywords = extract_keywords("brown fox");
        assert!(lexical_score("the brown fox jumps", &keywords) > 0.0);
        assert_eq!(lexical_score("nothing relevant here", &keywords), 0.0);
        assert_eq!(lexical_score("anything", &[]), 0.0);
    }

    #[test]
    fn test_blend_matches_weighted_formula() {
        // Known in-range scores: the blend must be exactly 0.7*s + 0.3*l.
        let semantic = vec![(record("a", "alpha"), 0.8f32), (record("b", "beta"), 0.4)];
        let lexical = vec![(record("b", "beta"), 0.9f32), (record("c", "gamma"), 0.5)];

        let hits = blend(semantic, lexical, 0.7, 0.3);
        let score_of = |id: &str| hits.iter().find(|h| h.record.id == id).unwrap().score;

        assert!((score_of("a") - 0.7 * 0.8).abs() < 1e-6);
        assert!((score_of("b") - (0.7 * 0.4 + 0.3 * 0.9)).abs() < 1e-6);
        assert!((score_of("c") - 0.3 * 0.5).abs() < 1e-6);

        // Deduplicated: three unique ids.
        assert_eq!(hits.len(), 3);
        // Ranks are assigned in score order.
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
        assert_eq!(hits[0].rank, 0);
    }

    #[test]
    fn test_blend_dedups_keeping_max_score() {
        let semantic = vec![(record("a", "x"), 0.5f32), (record("a", "x"), 0.9)];
        let hits = blend(semantic, vec![], 1.0, 0.0);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_passes_in_range_through() {
        assert_eq!(normalize_scores(&[0.2, 0.9]), vec![0.2, 0.9]);
        let scaled = normalize_scores(&[2.0, 4.0]);
        assert!((scaled[0] - 0.5).abs() < 1e-6);
        assert!((scaled[1] - 1.0).abs() < 1e-6);
        assert_eq!(normalize_scores(&[-0.5, 0.5]), vec![0.0, 0.5]);
    }
}
