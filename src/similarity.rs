//! Pluggable similarity oracle.
//!
//! The engine never computes semantic similarity itself. Anything that can
//! score text against text (an embedding service, a vector index) plugs in
//! through [`SimilarityOracle`]; [`KeywordOverlapOracle`] is the zero-config default.

use crate::error::{MemoryError, Result};
use crate::types::{MemoryId, MemoryItem};
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score each candidate against `query`, in input order, each in [0, 1]
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;

    /// Minimum score for two texts to count as similar
    fn threshold(&self) -> f32 {
        0.3
    }
}

/// Jaccard overlap of lowercased alphanumeric tokens.
///
/// Deterministic, no network. Not a substitute for a learned model.
#[derive(Debug, Clone)]
pub struct KeywordOverlapOracle {
    threshold: f32,
    min_token_len: usize,
}

impl Default for KeywordOverlapOracle {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            min_token_len: 2,
        }
    }
}

impl KeywordOverlapOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    fn tokens(&self, text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= self.min_token_len)
            .map(str::to_lowercase)
            .collect()
    }

    pub fn overlap(&self, a: &str, b: &str) -> f32 {
        let a = self.tokens(a);
        let b = self.tokens(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count();
        let union = a.union(&b).count();
        shared as f32 / union as f32
    }
}

#[async_trait]
impl SimilarityOracle for KeywordOverlapOracle {
    fn name(&self) -> &'static str {
        "keyword-overlap"
    }

    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        Ok(candidates.iter().map(|c| self.overlap(query, c)).collect())
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Items at or above the oracle threshold, most similar first.
/// `exclude` drops the item being compared against itself.
pub async fn find_similar(
    oracle: &dyn SimilarityOracle,
    query: &str,
    items: &[MemoryItem],
    exclude: Option<&str>,
) -> Result<Vec<(MemoryId, f32)>> {
    let pool: Vec<&MemoryItem> = items
        .iter()
        .filter(|item| exclude != Some(item.id.as_str()))
        .collect();
    if pool.is_empty() || query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = pool.iter().map(|i| i.content.searchable_text()).collect();
    let scores = oracle.score(query, &texts).await?;
    if scores.len() != pool.len() {
        return Err(MemoryError::Other(anyhow::anyhow!(
            "similarity oracle '{}' returned {} scores for {} candidates",
            oracle.name(),
            scores.len(),
            pool.len()
        )));
    }

    let threshold = oracle.threshold();
    let mut similar: Vec<(MemoryId, f32)> = pool
        .iter()
        .zip(scores)
        .filter(|(_, score)| score.is_finite() && *score >= threshold)
        .map(|(item, score)| (item.id.clone(), score.clamp(0.0, 1.0)))
        .collect();
    similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(similar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use chrono::Utc;

    #[test]
    fn overlap_is_symmetric_and_bounded() {
        let oracle = KeywordOverlapOracle::new();
        let a = "Rust borrow checker rules";
        let b = "rules of the borrow checker";
        assert_eq!(oracle.overlap(a, b), oracle.overlap(b, a));
        assert!(oracle.overlap(a, b) > 0.0 && oracle.overlap(a, b) <= 1.0);
        assert_eq!(oracle.overlap(a, a), 1.0);
        assert_eq!(oracle.overlap(a, ""), 0.0);
    }

    #[tokio::test]
    async fn find_similar_ranks_and_excludes_self() {
        let now = Utc::now();
        let items = vec![
            MemoryItem::new("p1", "tokio runtime tuning".into(), Tier::Short, 0.5, now),
            MemoryItem::new("p1", "tokio runtime internals".into(), Tier::Short, 0.5, now),
            MemoryItem::new("p1", "gardening tips".into(), Tier::Short, 0.5, now),
        ];
        let oracle = KeywordOverlapOracle::new();

        let similar = find_similar(&oracle, "tokio runtime tuning", &items, Some(&items[0].id))
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0, items[1].id);

        let all = find_similar(&oracle, "tokio runtime tuning", &items, None)
            .await
            .unwrap();
        assert_eq!(all[0].0, items[0].id);
    }
}
