//! Bounded per-tier item collections with priority-based eviction

use crate::clock::Clock;
use crate::error::{MemoryError, Result};
use crate::types::{MemoryId, MemoryItem, Tier};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Limits for a single tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Maximum number of items
    pub capacity: usize,
    /// Optional byte budget across all items in the tier
    pub max_bytes: Option<usize>,
    /// Half-life of the priority time-decay term, in seconds
    pub half_life_secs: i64,
}

impl TierSettings {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            capacity: tier.default_capacity(),
            max_bytes: None,
            half_life_secs: tier.default_half_life().num_seconds(),
        }
    }

    pub fn half_life(&self) -> Duration {
        Duration::seconds(self.half_life_secs)
    }
}

/// Limits for all three tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub short: TierSettings,
    pub medium: TierSettings,
    pub long: TierSettings,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            short: TierSettings::for_tier(Tier::Short),
            medium: TierSettings::for_tier(Tier::Medium),
            long: TierSettings::for_tier(Tier::Long),
        }
    }
}

impl TierConfig {
    pub fn settings(&self, tier: Tier) -> TierSettings {
        match tier {
            Tier::Short => self.short,
            Tier::Medium => self.medium,
            Tier::Long => self.long,
        }
    }

    pub fn settings_mut(&mut self, tier: Tier) -> &mut TierSettings {
        match tier {
            Tier::Short => &mut self.short,
            Tier::Medium => &mut self.medium,
            Tier::Long => &mut self.long,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let s = self.settings(*tier);
            if s.capacity == 0 {
                return Err(MemoryError::Configuration(format!(
                    "{tier} tier capacity must be greater than zero"
                )));
            }
            if s.half_life_secs <= 0 {
                return Err(MemoryError::Configuration(format!(
                    "{tier} tier half-life must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Eviction ranking:
/// `importance * (0.5 + 0.3 * min(1, access_count / 10) + 0.2 * 0.5^(age / half_life))`
pub fn priority(item: &MemoryItem, now: DateTime<Utc>, half_life: Duration) -> f32 {
    let access = (item.access_count as f32 / 10.0).min(1.0);
    let half_life_secs = half_life.num_seconds().max(1) as f64;
    let age_secs = item.age(now).num_seconds() as f64;
    let time_decay = 0.5f64.powf(age_secs / half_life_secs) as f32;
    item.importance * (0.5 + 0.3 * access + 0.2 * time_decay)
}

/// Criteria for [`TierStore::search`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierFilter {
    /// Every tag must be present on the item
    pub tags: Vec<String>,
    pub min_importance: f32,
    /// Case-insensitive terms that must all occur in the content
    pub text: Option<String>,
    /// Expired items are skipped unless set
    pub include_expired: bool,
}

impl TierFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_min_importance(mut self, min: f32) -> Self {
        self.min_importance = min;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn matches(&self, item: &MemoryItem, now: DateTime<Utc>) -> bool {
        if !self.include_expired && item.is_expired(now) {
            return false;
        }
        if item.importance < self.min_importance {
            return false;
        }
        if !item.has_all_tags(&self.tags) {
            return false;
        }
        match self.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let haystack = item.content.searchable_text().to_lowercase();
                text.to_lowercase()
                    .split_whitespace()
                    .all(|term| haystack.contains(term))
            }
            _ => true,
        }
    }
}

/// Result of inserting into a tier
#[derive(Debug, Default)]
pub struct StoreOutcome {
    pub stored: bool,
    /// An item with the same id was overwritten
    pub replaced: bool,
    /// Items removed to make room, lowest priority first
    pub evicted: Vec<MemoryItem>,
}

/// One tier of one owner's memory
#[derive(Debug)]
pub struct TierStore {
    tier: Tier,
    settings: TierSettings,
    items: HashMap<MemoryId, MemoryItem>,
    bytes_used: usize,
    clock: Arc<dyn Clock>,
}

impl TierStore {
    pub fn new(tier: Tier, settings: TierSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            tier,
            settings,
            items: HashMap::new(),
            bytes_used: 0,
            clock,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// Insert or overwrite an item, evicting lower-priority items first
    /// when the tier is full. Capacity is never exceeded, not even transiently.
    pub fn store(&mut self, mut item: MemoryItem) -> Result<StoreOutcome> {
        let size = item.size_bytes();
        if let Some(budget) = self.settings.max_bytes {
            if size > budget {
                return Err(MemoryError::OversizedItem { size, budget });
            }
        }
        if self.settings.capacity == 0 {
            return Ok(StoreOutcome::default());
        }

        item.tier = self.tier;
        let mut outcome = StoreOutcome::default();

        if let Some(previous) = self.items.remove(&item.id) {
            self.bytes_used = self.bytes_used.saturating_sub(previous.size_bytes());
            outcome.replaced = true;
        }

        while self.needs_room(size) {
            match self.evict_lowest() {
                Some(evicted) => outcome.evicted.push(evicted),
                None => break,
            }
        }

        self.bytes_used += size;
        self.items.insert(item.id.clone(), item);
        outcome.stored = true;
        Ok(outcome)
    }

    fn needs_room(&self, incoming: usize) -> bool {
        if self.items.len() >= self.settings.capacity {
            return true;
        }
        match self.settings.max_bytes {
            Some(budget) => self.bytes_used + incoming > budget,
            None => false,
        }
    }

    fn evict_lowest(&mut self) -> Option<MemoryItem> {
        let victim = self.lowest_priority()?;
        let item = self.remove(&victim)?;
        tracing::debug!(
            tier = %self.tier,
            id = %item.id,
            importance = item.importance,
            "Evicted lowest-priority item"
        );
        Some(item)
    }

    /// Id of the item that would be evicted next: lowest priority, oldest on ties
    pub fn lowest_priority(&self) -> Option<MemoryId> {
        let now = self.clock.now();
        let half_life = self.settings.half_life();
        self.items
            .values()
            .map(|item| (priority(item, now, half_life), item))
            .min_by(|(pa, a), (pb, b)| {
                pa.total_cmp(pb)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(_, item)| item.id.clone())
    }

    pub fn retrieve(&self, id: &str) -> Option<&MemoryItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Record a successful access and return the updated item
    pub fn touch(&mut self, id: &str) -> Option<MemoryItem> {
        let now = self.clock.now();
        let item = self.items.get_mut(id)?;
        item.record_access(now);
        Some(item.clone())
    }

    /// Apply an in-place update. Size accounting is refreshed afterwards.
    pub fn update<F>(&mut self, id: &str, f: F) -> Option<MemoryItem>
    where
        F: FnOnce(&mut MemoryItem),
    {
        let item = self.items.get_mut(id)?;
        let before = item.size_bytes();
        f(item);
        item.tier = self.tier;
        item.set_importance(item.importance);
        let after = item.size_bytes();
        self.bytes_used = self.bytes_used.saturating_sub(before) + after;
        Some(item.clone())
    }

    /// Matching items ordered by priority, highest first
    pub fn search(&self, filter: &TierFilter, limit: usize) -> Vec<MemoryItem> {
        let now = self.clock.now();
        let half_life = self.settings.half_life();
        let mut matches: Vec<(f32, &MemoryItem)> = self
            .items
            .values()
            .filter(|item| filter.matches(item, now))
            .map(|item| (priority(item, now, half_life), item))
            .collect();

        matches.sort_by(|(pa, a), (pb, b)| {
            pb.total_cmp(pa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        matches
            .into_iter()
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryItem> {
        let item = self.items.remove(id)?;
        self.bytes_used = self.bytes_used.saturating_sub(item.size_bytes());
        Some(item)
    }

    pub fn priority_of(&self, id: &str) -> Option<f32> {
        let item = self.items.get(id)?;
        Some(priority(item, self.clock.now(), self.settings.half_life()))
    }

    /// Ids of items whose expiry has passed
    pub fn expired_ids(&self) -> Vec<MemoryId> {
        let now = self.clock.now();
        self.items
            .values()
            .filter(|item| item.is_expired(now))
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.items.keys().cloned().collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Fill ratio in [0, 1]
    pub fn utilization(&self) -> f32 {
        if self.settings.capacity == 0 {
            return 1.0;
        }
        self.items.len() as f32 / self.settings.capacity as f32
    }
}
