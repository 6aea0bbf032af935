//! Consolidation: expire, then promote SHORT -> MEDIUM -> LONG

use crate::clock::Clock;
use crate::error::{MemoryError, Result};
use crate::events::{EngineEvent, EventBus, EvictionCause};
use crate::persona::PersonaMemory;
use crate::types::{MemoryId, MemoryItem, OwnerId, Tier};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};

pub const PROMOTED_FROM_SHORT: &str = "promoted_from_short";
pub const PROMOTED_FROM_MEDIUM: &str = "promoted_from_medium";

/// Promotion thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// SHORT -> MEDIUM: minimum access count
    pub short_min_access: u64,
    /// SHORT -> MEDIUM: minimum importance
    pub short_min_importance: f32,
    /// SHORT -> MEDIUM: importance multiplier
    pub short_boost: f32,
    /// MEDIUM -> LONG: item must be strictly older than this
    pub medium_min_age_secs: i64,
    pub medium_min_access: u64,
    pub medium_min_importance: f32,
    pub medium_boost: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            short_min_access: 3,
            short_min_importance: 0.7,
            short_boost: 1.2,
            medium_min_age_secs: 3 * 24 * 60 * 60,
            medium_min_access: 10,
            medium_min_importance: 0.8,
            medium_boost: 1.5,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.short_boost < 1.0 || self.medium_boost < 1.0 {
            return Err(MemoryError::Configuration(
                "promotion boosts must be at least 1.0".into(),
            ));
        }
        if self.medium_min_age_secs < 0 {
            return Err(MemoryError::Configuration(
                "medium_min_age_secs must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Step of the pass an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStage {
    Expire,
    PromoteShort,
    PromoteMedium,
}

impl ConsolidationStage {
    fn source_tier(&self) -> Tier {
        match self {
            ConsolidationStage::Expire | ConsolidationStage::PromoteShort => Tier::Short,
            ConsolidationStage::PromoteMedium => Tier::Medium,
        }
    }
}

/// Per-item failure; the pass continues past it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationError {
    pub item_id: MemoryId,
    pub stage: ConsolidationStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub owner: OwnerId,
    pub promoted: usize,
    pub expired: usize,
    pub errors: Vec<ConsolidationError>,
    pub promoted_ids: Vec<MemoryId>,
    pub expired_ids: Vec<MemoryId>,
    /// Items pushed out of a target tier by promotions
    pub evicted_ids: Vec<MemoryId>,
    /// Stopped early on a cancellation signal
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    /// Anything in the owner's population changed
    pub fn changed(&self) -> bool {
        self.promoted > 0 || self.expired > 0 || !self.evicted_ids.is_empty()
    }
}

/// A planned promotion
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub to: Tier,
    pub importance: f32,
    pub tag: &'static str,
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.is_some_and(|rx| *rx.borrow())
}

/// Runs consolidation passes over one owner at a time
#[derive(Debug, Clone)]
pub struct PromotionConsolidator {
    config: ConsolidationConfig,
    clock: Arc<dyn Clock>,
}

impl PromotionConsolidator {
    pub fn new(config: ConsolidationConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Where `item` should move next, if anywhere. LONG never moves.
    pub fn promotion_for(&self, item: &MemoryItem, now: DateTime<Utc>) -> Option<Promotion> {
        let c = &self.config;
        match item.tier {
            Tier::Short
                if item.access_count >= c.short_min_access
                    && item.importance >= c.short_min_importance =>
            {
                Some(Promotion {
                    to: Tier::Medium,
                    importance: (item.importance * c.short_boost).min(1.0),
                    tag: PROMOTED_FROM_SHORT,
                })
            }
            Tier::Medium
                if item.age(now).num_seconds() > c.medium_min_age_secs
                    && item.access_count >= c.medium_min_access
                    && item.importance >= c.medium_min_importance =>
            {
                Some(Promotion {
                    to: Tier::Long,
                    importance: (item.importance * c.medium_boost).min(1.0),
                    tag: PROMOTED_FROM_MEDIUM,
                })
            }
            _ => None,
        }
    }

    /// One full pass.
    ///
    /// Candidates are snapshotted per stage and each item is handled under its
    /// own lock acquisition, so foreground calls interleave between items.
    /// `cancel` is checked before every item.
    pub async fn run(
        &self,
        persona: &Mutex<PersonaMemory>,
        events: &EventBus,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> ConsolidationReport {
        let started = Instant::now();
        let owner = persona.lock().await.owner().to_string();
        let mut report = ConsolidationReport {
            owner: owner.clone(),
            ..ConsolidationReport::default()
        };

        // Expiry first: an expired item is never promoted
        let expired: Vec<MemoryId> = {
            let memory = persona.lock().await;
            Tier::ALL
                .iter()
                .flat_map(|t| memory.tier(*t).expired_ids())
                .collect()
        };
        for id in expired {
            if is_cancelled(cancel) {
                report.cancelled = true;
                break;
            }
            self.expire_one(persona, events, &id, &mut report).await;
        }

        for stage in [ConsolidationStage::PromoteShort, ConsolidationStage::PromoteMedium] {
            if report.cancelled {
                break;
            }
            let now = self.clock.now();
            let candidates: Vec<MemoryId> = {
                let memory = persona.lock().await;
                memory
                    .tier(stage.source_tier())
                    .items()
                    .filter(|item| !item.is_expired(now) && self.promotion_for(item, now).is_some())
                    .map(|item| item.id.clone())
                    .collect()
            };
            for id in candidates {
                if is_cancelled(cancel) {
                    report.cancelled = true;
                    break;
                }
                self.promote_one(persona, events, &id, stage, &mut report).await;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            owner = %owner,
            promoted = report.promoted,
            expired = report.expired,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "Consolidation pass finished"
        );
        events
            .emit(EngineEvent::ConsolidationCompleted {
                owner,
                promoted: report.promoted,
                expired: report.expired,
                errors: report.errors.len(),
                duration_ms: report.duration_ms,
                timestamp: self.clock.now(),
            })
            .await;
        report
    }

    async fn expire_one(
        &self,
        persona: &Mutex<PersonaMemory>,
        events: &EventBus,
        id: &str,
        report: &mut ConsolidationReport,
    ) {
        let now = self.clock.now();
        let mut memory = persona.lock().await;
        let Some(item) = memory.get(id) else {
            return;
        };
        if !item.is_expired(now) {
            return;
        }
        let tier = item.tier;

        match memory.remove(id).await {
            Ok(Some(_)) => {
                tracing::debug!(owner = %memory.owner(), id, %tier, "Expired item removed");
                report.expired += 1;
                report.expired_ids.push(id.to_string());
                events
                    .emit(EngineEvent::Expired {
                        owner: memory.owner().to_string(),
                        item_id: id.to_string(),
                        tier,
                        timestamp: now,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(owner = %memory.owner(), id, error = %e, "Failed to expire item");
                report.errors.push(ConsolidationError {
                    item_id: id.to_string(),
                    stage: ConsolidationStage::Expire,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Insert into the target tier, then delete from the source
    async fn promote_one(
        &self,
        persona: &Mutex<PersonaMemory>,
        events: &EventBus,
        id: &str,
        stage: ConsolidationStage,
        report: &mut ConsolidationReport,
    ) {
        let now = self.clock.now();
        let source_tier = stage.source_tier();
        let mut memory = persona.lock().await;

        // Re-check: the item may have changed since the snapshot
        let Some(item) = memory.tier(source_tier).retrieve(id).cloned() else {
            return;
        };
        if item.is_expired(now) {
            return;
        }
        let Some(promotion) = self.promotion_for(&item, now) else {
            return;
        };

        let mut promoted = item;
        promoted.tier = promotion.to;
        promoted.set_importance(promotion.importance);
        promoted.tags.insert(promotion.tag.to_string());
        let importance = promoted.importance;

        let fail = |report: &mut ConsolidationReport, e: MemoryError| {
            tracing::warn!(owner = %report.owner, id, ?stage, error = %e, "Promotion failed");
            report.errors.push(ConsolidationError {
                item_id: id.to_string(),
                stage,
                message: e.to_string(),
            });
        };

        let outcome = match memory.insert(promoted).await {
            Ok(outcome) => outcome,
            Err(e) => {
                fail(report, e);
                return;
            }
        };

        // The copy now exists in the target tier; drop the original.
        // On failure the next pass retries: re-inserting the copy is idempotent.
        if let Err(e) = memory.remove_from_tier(source_tier, id).await {
            fail(report, e);
            return;
        }

        let owner = memory.owner().to_string();
        for evicted in outcome.evicted {
            report.evicted_ids.push(evicted.id.clone());
            events
                .emit(EngineEvent::Evicted {
                    owner: owner.clone(),
                    item_id: evicted.id,
                    tier: promotion.to,
                    cause: EvictionCause::Capacity,
                    timestamp: now,
                })
                .await;
        }

        tracing::debug!(owner = %owner, id, from = %source_tier, to = %promotion.to, importance, "Promoted item");
        report.promoted += 1;
        report.promoted_ids.push(id.to_string());
        events
            .emit(EngineEvent::Promoted {
                owner,
                item_id: id.to_string(),
                from: source_tier,
                to: promotion.to,
                importance,
                timestamp: now,
            })
            .await;
    }
}

/// Builder for consolidation config
#[derive(Debug, Default)]
pub struct ConsolidationConfigBuilder {
    config: ConsolidationConfig,
}

impl ConsolidationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn short_thresholds(mut self, min_access: u64, min_importance: f32) -> Self {
        self.config.short_min_access = min_access;
        self.config.short_min_importance = min_importance;
        self
    }

    pub fn medium_thresholds(mut self, min_age_secs: i64, min_access: u64, min_importance: f32) -> Self {
        self.config.medium_min_age_secs = min_age_secs;
        self.config.medium_min_access = min_access;
        self.config.medium_min_importance = min_importance;
        self
    }

    pub fn short_boost(mut self, boost: f32) -> Self {
        self.config.short_boost = boost;
        self
    }

    pub fn medium_boost(mut self, boost: f32) -> Self {
        self.config.medium_boost = boost;
        self
    }

    pub fn build(self) -> ConsolidationConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{open_pool, LongTermStore, StorageConfig};
    use crate::tier_store::TierConfig;

    struct Fixture {
        clock: ManualClock,
        persona: Mutex<PersonaMemory>,
        consolidator: PromotionConsolidator,
        events: EventBus,
    }

    fn fixture(long_store: Option<LongTermStore>) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        Fixture {
            persona: Mutex::new(PersonaMemory::new(
                "p1",
                &TierConfig::default(),
                Arc::clone(&shared),
                long_store,
                50,
            )),
            consolidator: PromotionConsolidator::new(ConsolidationConfig::default(), shared),
            events: EventBus::default(),
            clock,
        }
    }

    async fn add(f: &Fixture, content: &str, tier: Tier, importance: f32, accesses: u64) -> MemoryId {
        let mut item = MemoryItem::new("p1", content.into(), tier, importance, f.clock.now());
        item.access_count = accesses;
        let id = item.id.clone();
        f.persona.lock().await.insert(item).await.unwrap();
        id
    }

    #[test]
    fn promotion_rules_follow_thresholds() {
        let clock = ManualClock::starting_now();
        let c = PromotionConsolidator::new(ConsolidationConfig::default(), Arc::new(clock.clone()));
        let now = clock.now();

        let mut item = MemoryItem::new("p1", "x".into(), Tier::Short, 0.9, now);
        assert_eq!(c.promotion_for(&item, now), None);
        item.access_count = 3;
        let p = c.promotion_for(&item, now).unwrap();
        assert_eq!(p.to, Tier::Medium);
        assert_eq!(p.importance, 1.0);
        assert_eq!(p.tag, PROMOTED_FROM_SHORT);

        item.importance = 0.69;
        assert_eq!(c.promotion_for(&item, now), None);

        let mut medium = MemoryItem::new("p1", "y".into(), Tier::Medium, 0.6, now);
        medium.access_count = 10;
        medium.importance = 0.8;
        assert_eq!(c.promotion_for(&medium, now), None);
        let later = now + chrono::Duration::days(3) + chrono::Duration::seconds(1);
        let p = c.promotion_for(&medium, later).unwrap();
        assert_eq!(p.to, Tier::Long);
        assert!((p.importance - 1.0).abs() < 1e-6);

        let long = MemoryItem::new("p1", "z".into(), Tier::Long, 1.0, now);
        assert_eq!(c.promotion_for(&long, later), None);
    }

    #[tokio::test]
    async fn promotes_short_to_medium() {
        let f = fixture(None);
        let hot = add(&f, "hot", Tier::Short, 0.9, 3).await;
        let cold = add(&f, "cold", Tier::Short, 0.9, 1).await;

        let report = f.consolidator.run(&f.persona, &f.events, None).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(report.promoted_ids, vec![hot.clone()]);
        assert!(report.errors.is_empty());

        let memory = f.persona.lock().await;
        let item = memory.get(&hot).unwrap();
        assert_eq!(item.tier, Tier::Medium);
        assert_eq!(item.importance, 1.0);
        assert!(item.tags.contains(PROMOTED_FROM_SHORT));
        assert!(!memory.tier(Tier::Short).contains(&hot));
        assert_eq!(memory.locate(&cold), Some(Tier::Short));
    }

    #[tokio::test]
    async fn medium_needs_age_before_long() {
        let store = LongTermStore::new(open_pool(&StorageConfig::in_memory()).await.unwrap());
        let f = fixture(Some(store.clone()));
        let id = add(&f, "veteran", Tier::Medium, 0.8, 12).await;

        let report = f.consolidator.run(&f.persona, &f.events, None).await;
        assert_eq!(report.promoted, 0);

        f.clock.advance_days(3);
        f.clock.advance_secs(1);
        let report = f.consolidator.run(&f.persona, &f.events, None).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(f.persona.lock().await.locate(&id), Some(Tier::Long));

        let persisted = store.load("p1", &id).await.unwrap().unwrap();
        assert!(persisted.tags.contains(PROMOTED_FROM_MEDIUM));
        assert!((persisted.importance - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn expiry_wins_over_promotion() {
        let f = fixture(None);
        let mut item = MemoryItem::new("p1", "fleeting".into(), Tier::Short, 0.95, f.clock.now())
            .with_expiry(f.clock.now() + chrono::Duration::minutes(5));
        item.access_count = 5;
        let id = item.id.clone();
        f.persona.lock().await.insert(item).await.unwrap();

        f.clock.advance_secs(301);
        let report = f.consolidator.run(&f.persona, &f.events, None).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(f.persona.lock().await.locate(&id), None);
    }

    #[tokio::test]
    async fn cancellation_stops_between_items() {
        let f = fixture(None);
        add(&f, "a", Tier::Short, 0.9, 3).await;
        add(&f, "b", Tier::Short, 0.9, 3).await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = f.consolidator.run(&f.persona, &f.events, Some(&rx)).await;
        assert!(report.cancelled);
        assert_eq!(report.promoted, 0);
        assert_eq!(f.persona.lock().await.tier(Tier::Short).len(), 2);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_per_item() {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let f = fixture(Some(LongTermStore::new(pool.clone())));
        let to_long = add(&f, "needs storage", Tier::Medium, 0.9, 10).await;
        let to_medium = add(&f, "volatile", Tier::Short, 0.8, 4).await;
        f.clock.advance_days(4);

        pool.close().await;
        let report = f.consolidator.run(&f.persona, &f.events, None).await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item_id, to_long);
        assert_eq!(report.errors[0].stage, ConsolidationStage::PromoteMedium);
        assert_eq!(report.promoted, 1);

        let memory = f.persona.lock().await;
        assert_eq!(memory.locate(&to_long), Some(Tier::Medium));
        assert_eq!(memory.locate(&to_medium), Some(Tier::Medium));
    }
}
