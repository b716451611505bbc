//! Query rewriting and rank fusion.
//!
//! Generates query variants through the LLM with a fixed prompt, retrieves
//! per variant, and fuses the ranked lists with reciprocal-rank fusion.

use crate::config::Prompts;
use crate::error::Result;
use crate::llm::ChatModel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// LLM-backed query rewriter.
pub struct QueryRewriter {
    chat: Arc<dyn ChatModel>,
    prompts: Prompts,
    variants: usize,
}

impl QueryRewriter {
    pub fn new(chat: Arc<dyn ChatModel>, prompts: Prompts, variants: usize) -> Self {
        Self {
            chat,
            prompts,
            variants: variants.max(1),
        }
    }

    /// Generate up to `variants` rewritten queries. The original is not
    /// included; callers search it alongside the variants. A rewriting
    /// failure degrades to no variants rather than failing the query.
    #[instrument(skip(self), fields(query = %query))]
    pub async fn rewrite(&self, query: &str) -> Result<Vec<String>> {
        let mut vars = HashMap::new();
        vars.insert("question".to_string(), query.to_string());
        vars.insert("count".to_string(), self.variants.to_string());

        let system = Prompts::render(&self.prompts.rewrite.system, &vars);
        let user = Prompts::render(&self.prompts.rewrite.user, &vars);

        let raw = match self.chat.complete(&system, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Query rewriting failed, searching original only: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut seen = std::collections::HashSet::new();
        seen.insert(query.trim().to_lowercase());

        let variants: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_lowercase()))
            .take(self.variants)
            .map(str::to_string)
            .collect();

        debug!("Generated {} query variants", variants.len());
        Ok(variants)
    }
}

/// Reciprocal-rank fusion over ranked id lists: each item scores
/// Σ 1/(k + rank) across the lists it appears in (rank is 1-based).
/// Returns (id, fused score) ordered best-first.
pub fn rrf_fuse(lists: &[Vec<String>], k: u32) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + (rank + 1) as f64);
        }
    }

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|(id_a, a), (id_b, b)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| id_a.cmp(id_b))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeChat;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_rewrite_dedups_and_caps_variants() {
        let chat = FakeChat::new("variant one\nvariant one\nvariant two\nvariant three\nvariant four");
        let rewriter = QueryRewriter::new(Arc::new(chat), Prompts::default(), 3);

        let variants = rewriter.rewrite("original question").await.unwrap();
        assert_eq!(variants, vec!["variant one", "variant two", "variant three"]);
    }

    #[tokio::test]
    async fn test_rewrite_failure_degrades_to_empty() {
        let rewriter = QueryRewriter::new(Arc::new(FakeChat::failing()), Prompts::default(), 3);
        assert!(rewriter.rewrite("question").await.unwrap().is_empty());
    }

    #[test]
    fn test_rrf_rewards_items_in_many_lists() {
        let lists = vec![ids(&["a", "b", "c"]), ids(&["b", "a"]), ids(&["b"])];
        let fused = rrf_fuse(&lists, 60);
        assert_eq!(fused[0].0, "b");
        assert_eq!(fused[1].0, "a");
    }

    #[test]
    fn test_rrf_is_monotonic_in_rank() {
        // Moving an item earlier in any list must never decrease its score.
        let base = vec![ids(&["x", "y", "z"]), ids(&["p", "q", "x"])];
        let improved = vec![ids(&["x", "y", "z"]), ids(&["x", "p", "q"])];

        let score = |lists: &[Vec<String>]| {
            rrf_fuse(lists, 60)
                .into_iter()
                .find(|(id, _)| id == "x")
                .map(|(_, s)| s)
                .unwrap()
        };

        assert!(score(&improved) > score(&base));
    }

    #[test]
    fn test_rrf_uses_one_based_ranks() {
        let fused = rrf_fuse(&[ids(&["only"])], 60);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
    }
}
