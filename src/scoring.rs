//! Importance scoring for newly remembered content
//!
//! Five normalized features are combined with configurable weights, then an
//! owner-specific boost is applied when content hits the persona's domain
//! vocabulary:
//! - uniqueness: how few similar items already exist
//! - recency: how recently similar things were active (30-day half-life)
//! - frequency: how often similar items were accessed recently
//! - richness: length, lexical variety and payload shape
//! - connectivity: how many similar items it would link to

use crate::error::{MemoryError, Result};
use crate::types::{MemoryContent, MemoryId, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Configurable weights for importance calculation (must sum to 1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImportanceWeights {
    pub uniqueness: f32,
    pub recency: f32,
    pub frequency: f32,
    pub richness: f32,
    pub connectivity: f32,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            uniqueness: 0.25,
            recency: 0.15,
            frequency: 0.20,
            richness: 0.20,
            connectivity: 0.20,
        }
    }
}

impl ImportanceWeights {
    pub fn sum(&self) -> f32 {
        self.uniqueness + self.recency + self.frequency + self.richness + self.connectivity
    }

    pub fn get(&self, feature: ImportanceFeature) -> f32 {
        match feature {
            ImportanceFeature::Uniqueness => self.uniqueness,
            ImportanceFeature::Recency => self.recency,
            ImportanceFeature::Frequency => self.frequency,
            ImportanceFeature::Richness => self.richness,
            ImportanceFeature::Connectivity => self.connectivity,
        }
    }

    fn get_mut(&mut self, feature: ImportanceFeature) -> &mut f32 {
        match feature {
            ImportanceFeature::Uniqueness => &mut self.uniqueness,
            ImportanceFeature::Recency => &mut self.recency,
            ImportanceFeature::Frequency => &mut self.frequency,
            ImportanceFeature::Richness => &mut self.richness,
            ImportanceFeature::Connectivity => &mut self.connectivity,
        }
    }

    /// Rescale so the weights sum to 1. Degenerate weights reset to defaults.
    pub fn normalize(&mut self) {
        let sum = self.sum();
        if !sum.is_finite() || sum <= f32::EPSILON {
            *self = Self::default();
            return;
        }
        for feature in ImportanceFeature::ALL {
            *self.get_mut(*feature) /= sum;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all_valid = ImportanceFeature::ALL
            .iter()
            .all(|f| self.get(*f).is_finite() && self.get(*f) >= 0.0);
        if !all_valid {
            return Err(MemoryError::Configuration(
                "importance weights must be finite and non-negative".into(),
            ));
        }
        if (self.sum() - 1.0).abs() > 1e-3 {
            return Err(MemoryError::Configuration(format!(
                "importance weights must sum to 1.0, got {:.4}",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// The features that make up an importance score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceFeature {
    Uniqueness,
    Recency,
    Frequency,
    Richness,
    Connectivity,
}

impl ImportanceFeature {
    pub const ALL: &[ImportanceFeature] = &[
        ImportanceFeature::Uniqueness,
        ImportanceFeature::Recency,
        ImportanceFeature::Frequency,
        ImportanceFeature::Richness,
        ImportanceFeature::Connectivity,
    ];
}

/// A persona's domain vocabulary and the boost applied when content matches it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: OwnerId,
    #[serde(default)]
    pub domain_keywords: Vec<String>,
    /// Multiplier in [1.1, 1.3]
    #[serde(default = "default_boost")]
    pub boost: f32,
}

fn default_boost() -> f32 {
    1.2
}

impl PersonaProfile {
    pub fn new(name: impl Into<OwnerId>) -> Self {
        Self {
            name: name.into(),
            domain_keywords: Vec::new(),
            boost: default_boost(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_keywords
            .extend(keywords.into_iter().map(|k| k.into().to_lowercase()));
        self
    }

    pub fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MemoryError::Configuration("persona name is empty".into()));
        }
        if !(1.1..=1.3).contains(&self.boost) {
            return Err(MemoryError::Configuration(format!(
                "persona {} boost {} outside [1.1, 1.3]",
                self.name, self.boost
            )));
        }
        Ok(())
    }

    /// Whether the text mentions any domain keyword
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.domain_keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }
}

/// Scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ImportanceWeights,
    /// Returned for empty content
    pub empty_content_score: f32,
    /// Step size for online weight adjustment
    pub learning_rate: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ImportanceWeights::default(),
            empty_content_score: 0.3,
            learning_rate: 0.1,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if !(0.1..=0.5).contains(&self.empty_content_score) {
            return Err(MemoryError::Configuration(
                "empty_content_score must be within [0.1, 0.5]".into(),
            ));
        }
        Ok(())
    }
}

/// What the caller knows about the owner's population when scoring
#[derive(Debug, Clone)]
pub struct UsageContext {
    /// Items the owner currently holds across tiers
    pub total_items: usize,
    /// Most recently accessed item ids, newest first
    pub recent_access_ids: Vec<MemoryId>,
    /// Ids of existing items judged similar by the similarity oracle
    pub similar_ids: Vec<MemoryId>,
    /// Earliest and latest activity among the similar items
    pub similar_activity: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub now: DateTime<Utc>,
}

impl UsageContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_items: 0,
            recent_access_ids: Vec::new(),
            similar_ids: Vec::new(),
            similar_activity: None,
            now,
        }
    }
}

/// Per-feature values behind a score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImportanceBreakdown {
    pub uniqueness: f32,
    pub recency: f32,
    pub frequency: f32,
    pub richness: f32,
    pub connectivity: f32,
    /// Weighted sum before the persona boost
    pub weighted: f32,
    /// Boost applied (1.0 when the persona vocabulary did not match)
    pub boost: f32,
    /// Final clamped score
    pub score: f32,
}

/// Turns content plus usage context into an importance value in [0, 1]
#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    config: ScoringConfig,
    profiles: HashMap<OwnerId, PersonaProfile>,
}

impl ImportanceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            profiles: HashMap::new(),
        }
    }

    pub fn register_profile(&mut self, profile: PersonaProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn profile(&self, owner: &str) -> Option<&PersonaProfile> {
        self.profiles.get(owner)
    }

    pub fn weights(&self) -> &ImportanceWeights {
        &self.config.weights
    }

    /// Score content for an owner
    pub fn score(&self, content: &MemoryContent, owner: &str, ctx: &UsageContext) -> f32 {
        self.explain(content, owner, ctx).score
    }

    /// Score with the per-feature breakdown
    pub fn explain(
        &self,
        content: &MemoryContent,
        owner: &str,
        ctx: &UsageContext,
    ) -> ImportanceBreakdown {
        if content.is_empty() {
            let score = self.config.empty_content_score.clamp(0.1, 0.5);
            return ImportanceBreakdown {
                uniqueness: 0.0,
                recency: 0.0,
                frequency: 0.0,
                richness: 0.0,
                connectivity: 0.0,
                weighted: score,
                boost: 1.0,
                score,
            };
        }

        let uniqueness = uniqueness(ctx);
        let recency = recency(ctx);
        let frequency = frequency(ctx);
        let richness = richness(content);
        let connectivity = (ctx.similar_ids.len() as f32 / 5.0).min(1.0);

        let w = &self.config.weights;
        let weighted = uniqueness * w.uniqueness
            + recency * w.recency
            + frequency * w.frequency
            + richness * w.richness
            + connectivity * w.connectivity;

        let boost = match self.profiles.get(owner) {
            Some(profile) if profile.matches(&content.searchable_text()) => {
                profile.boost.clamp(1.1, 1.3)
            }
            _ => 1.0,
        };

        let score = (weighted * boost).clamp(0.0, 1.0);

        ImportanceBreakdown {
            uniqueness,
            recency,
            frequency,
            richness,
            connectivity,
            weighted,
            boost,
            score,
        }
    }

    /// Nudge weights toward observed per-feature importance, then renormalize
    pub fn adjust_weights(&mut self, feedback: &[(ImportanceFeature, f32)]) {
        if feedback.is_empty() {
            return;
        }
        let lr = self.config.learning_rate;
        for (feature, observed) in feedback {
            if !observed.is_finite() {
                continue;
            }
            let weight = self.config.weights.get_mut(*feature);
            *weight = (*weight + lr * (observed.clamp(0.0, 1.0) - *weight)).max(0.0);
        }
        self.config.weights.normalize();
        tracing::debug!(weights = ?self.config.weights, "Adjusted importance weights");
    }
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

fn uniqueness(ctx: &UsageContext) -> f32 {
    let population = ctx.total_items.min(100);
    if population == 0 {
        return 1.0;
    }
    (1.0 - ctx.similar_ids.len() as f32 / population as f32).clamp(0.0, 1.0)
}

fn recency(ctx: &UsageContext) -> f32 {
    match ctx.similar_activity {
        Some((_, latest)) => {
            let days = (ctx.now - latest).num_seconds().max(0) as f32 / 86_400.0;
            (-days / 30.0).exp()
        }
        None => 0.0,
    }
}

fn frequency(ctx: &UsageContext) -> f32 {
    if ctx.similar_ids.is_empty() {
        return 0.0;
    }
    let similar: HashSet<&MemoryId> = ctx.similar_ids.iter().collect();
    let recent = ctx
        .recent_access_ids
        .iter()
        .filter(|id| similar.contains(id))
        .count();
    (recent as f32 / 10.0).min(1.0)
}

fn richness(content: &MemoryContent) -> f32 {
    let text = content.searchable_text();
    let length = (text.chars().count() as f32 / 1000.0).min(1.0);

    let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    let complexity = if words.is_empty() {
        0.0
    } else {
        let unique: HashSet<&String> = words.iter().collect();
        unique.len() as f32 / words.len() as f32
    };

    let structure = match content {
        MemoryContent::Text(s) if s.lines().count() > 1 => 0.2,
        MemoryContent::Text(_) => 0.0,
        MemoryContent::List(_) => 0.6,
        MemoryContent::Structured(_) => 1.0,
    };

    (length + complexity + structure) / 3.0
}
