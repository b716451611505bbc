//! Query-time retrieval over the indexed corpus.
//!
//! Composes hybrid search, re-ranking, optional query rewriting, and
//! answer generation. The variant selects how much of that stack runs.

mod engine;
mod hybrid;
mod rerank;
mod rewrite;

pub use engine::{QueryRequest, QueryResponse, RetrievalEngine};
pub use hybrid::{blend, extract_keywords, lexical_score, normalize_scores, HybridHit, HybridSearch};
pub use rerank::{rerank, LexicalOverlapScorer, RelevanceScorer};
pub use rewrite::{rrf_fuse, QueryRewriter};

use serde::{Deserialize, Serialize};

/// Named retrieval configuration, used at serve time and in evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalVariant {
    Semantic,
    Hybrid,
    HybridRerank,
    RewriteHybridRerank,
}

impl RetrievalVariant {
    pub const ALL: [RetrievalVariant; 4] = [
        RetrievalVariant::Semantic,
        RetrievalVariant::Hybrid,
        RetrievalVariant::HybridRerank,
        RetrievalVariant::RewriteHybridRerank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalVariant::Semantic => "semantic",
            RetrievalVariant::Hybrid => "hybrid",
            RetrievalVariant::HybridRerank => "hybrid+rerank",
            RetrievalVariant::RewriteHybridRerank => "rewrite+hybrid+rerank",
        }
    }

    pub fn uses_rewrite(&self) -> bool {
        matches!(self, RetrievalVariant::RewriteHybridRerank)
    }
}

impl std::str::FromStr for RetrievalVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "semantic" => Ok(RetrievalVariant::Semantic),
            "hybrid" => Ok(RetrievalVariant::Hybrid),
            "hybrid+rerank" => Ok(RetrievalVariant::HybridRerank),
            "rewrite+hybrid+rerank" => Ok(RetrievalVariant::RewriteHybridRerank),
            _ => Err(format!("Unknown retrieval variant: {}", s)),
        }
    }
}

impl std::fmt::Display for RetrievalVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk handed back to the caller with its final score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub submission_id: i64,
    pub ordinal: u32,
    pub text: String,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_roundtrip() {
        for variant in RetrievalVariant::ALL {
            assert_eq!(variant.as_str().parse::<RetrievalVariant>().unwrap(), variant);
        }
        assert!("bm25".parse::<RetrievalVariant>().is_err());
    }
}
