//! One owner's memory: three tier stores plus durable write-through for LONG.
//!
//! Callers hold the owner's lock for the duration of each mutation, so every
//! method here may assume exclusive access to this owner's population.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::LongTermStore;
use crate::tier_store::{StoreOutcome, TierConfig, TierStore};
use crate::types::{MemoryId, MemoryItem, OwnerId, Tier};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
pub struct PersonaMemory {
    owner: OwnerId,
    short: TierStore,
    medium: TierStore,
    long: TierStore,
    long_store: Option<LongTermStore>,
    recent_access: VecDeque<MemoryId>,
    recent_window: usize,
    /// Top result of the previous recall, for transition learning
    pub(crate) last_recalled: Option<MemoryId>,
}

impl PersonaMemory {
    pub fn new(
        owner: impl Into<OwnerId>,
        tiers: &TierConfig,
        clock: Arc<dyn Clock>,
        long_store: Option<LongTermStore>,
        recent_window: usize,
    ) -> Self {
        Self {
            owner: owner.into(),
            short: TierStore::new(Tier::Short, tiers.short, Arc::clone(&clock)),
            medium: TierStore::new(Tier::Medium, tiers.medium, Arc::clone(&clock)),
            long: TierStore::new(Tier::Long, tiers.long, clock),
            long_store,
            recent_access: VecDeque::new(),
            recent_window,
            last_recalled: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Rebuild the LONG tier from durable storage
    pub async fn load_long_tier(&mut self) -> Result<usize> {
        let Some(store) = self.long_store.clone() else {
            return Ok(0);
        };
        let items = store.load_owner(&self.owner).await?;
        let mut loaded = 0;
        for item in items {
            let outcome = self.long.store(item)?;
            if outcome.stored {
                loaded += 1;
            }
            // Persisted population larger than the configured capacity
            for evicted in outcome.evicted {
                loaded -= 1;
                if let Err(e) = store.delete(&self.owner, &evicted.id).await {
                    tracing::warn!(owner = %self.owner, id = %evicted.id, error = %e, "Could not drop over-capacity item");
                }
            }
        }
        tracing::debug!(owner = %self.owner, loaded, "Loaded long-term tier");
        Ok(loaded)
    }

    pub fn tier(&self, tier: Tier) -> &TierStore {
        match tier {
            Tier::Short => &self.short,
            Tier::Medium => &self.medium,
            Tier::Long => &self.long,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierStore {
        match tier {
            Tier::Short => &mut self.short,
            Tier::Medium => &mut self.medium,
            Tier::Long => &mut self.long,
        }
    }

    /// Tier currently holding `id`
    pub fn locate(&self, id: &str) -> Option<Tier> {
        Tier::ALL.iter().copied().find(|t| self.tier(*t).contains(id))
    }

    pub fn get(&self, id: &str) -> Option<&MemoryItem> {
        let tier = self.locate(id)?;
        self.tier(tier).retrieve(id)
    }

    /// Insert into `item.tier`. LONG items are persisted before anything
    /// evicted to make room is removed from storage; a failed write rolls
    /// the tier back.
    pub async fn insert(&mut self, item: MemoryItem) -> Result<StoreOutcome> {
        let tier = item.tier;
        let id = item.id.clone();
        let previous = match (tier, &self.long_store) {
            (Tier::Long, Some(_)) => self.long.retrieve(&id).cloned(),
            _ => None,
        };
        let outcome = self.tier_mut(tier).store(item)?;

        if tier != Tier::Long {
            return Ok(outcome);
        }
        let Some(store) = self.long_store.clone() else {
            return Ok(outcome);
        };

        if let Some(stored) = self.long.retrieve(&id).cloned() {
            if let Err(e) = store.upsert(&stored).await {
                self.long.remove(&id);
                for restored in outcome.evicted.into_iter().chain(previous) {
                    if let Err(restore_err) = self.long.store(restored) {
                        tracing::warn!(owner = %self.owner, error = %restore_err, "Could not restore long-term item");
                    }
                }
                return Err(e);
            }
        }
        for evicted in &outcome.evicted {
            if let Err(e) = store.delete(&self.owner, &evicted.id).await {
                tracing::warn!(owner = %self.owner, id = %evicted.id, error = %e, "Failed to delete evicted long-term item");
            }
        }
        Ok(outcome)
    }

    /// In-place update with write-through
    pub async fn update<F>(&mut self, id: &str, f: F) -> Result<Option<MemoryItem>>
    where
        F: FnOnce(&mut MemoryItem),
    {
        let Some(tier) = self.locate(id) else {
            return Ok(None);
        };
        let updated = self.tier_mut(tier).update(id, f);
        if let (Tier::Long, Some(item), Some(store)) = (tier, &updated, &self.long_store) {
            store.upsert(item).await?;
        }
        Ok(updated)
    }

    /// Remove from whichever tier holds it
    pub async fn remove(&mut self, id: &str) -> Result<Option<MemoryItem>> {
        match self.locate(id) {
            Some(tier) => self.remove_from_tier(tier, id).await,
            None => Ok(None),
        }
    }

    /// Remove from one tier only. Storage is cleared first so a failed
    /// delete leaves the item in place.
    pub async fn remove_from_tier(&mut self, tier: Tier, id: &str) -> Result<Option<MemoryItem>> {
        if !self.tier(tier).contains(id) {
            return Ok(None);
        }
        if tier == Tier::Long {
            if let Some(store) = &self.long_store {
                store.delete(&self.owner, id).await?;
            }
        }
        Ok(self.tier_mut(tier).remove(id))
    }

    /// Count a successful recall. Persisting LONG access stats is best-effort.
    pub async fn touch(&mut self, id: &str) -> Option<MemoryItem> {
        let tier = self.locate(id)?;
        let item = self.tier_mut(tier).touch(id)?;
        if tier == Tier::Long {
            if let Some(store) = &self.long_store {
                if let Err(e) = store.upsert(&item).await {
                    tracing::warn!(owner = %self.owner, id, error = %e, "Failed to persist access stats");
                }
            }
        }
        self.recent_access.push_back(item.id.clone());
        while self.recent_access.len() > self.recent_window {
            self.recent_access.pop_front();
        }
        Some(item)
    }

    /// Ids accessed recently, oldest first
    pub fn recent_ids(&self) -> Vec<MemoryId> {
        self.recent_access.iter().cloned().collect()
    }

    pub fn all_items(&self) -> Vec<MemoryItem> {
        Tier::ALL
            .iter()
            .flat_map(|t| self.tier(*t).items().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.short.len() + self.medium.len() + self.long.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{open_pool, StorageConfig};
    use chrono::Utc;

    fn persona(store: Option<LongTermStore>) -> PersonaMemory {
        PersonaMemory::new(
            "p1",
            &TierConfig::default(),
            Arc::new(ManualClock::starting_now()),
            store,
            5,
        )
    }

    #[tokio::test]
    async fn long_tier_writes_through() {
        let store = LongTermStore::new(open_pool(&StorageConfig::in_memory()).await.unwrap());
        let mut memory = persona(Some(store.clone()));
        let item = MemoryItem::new("p1", "durable".into(), Tier::Long, 0.9, Utc::now());
        let id = item.id.clone();

        memory.insert(item).await.unwrap();
        assert_eq!(store.count("p1").await.unwrap(), 1);

        memory.update(&id, |i| i.importance = 0.5).await.unwrap();
        let persisted = store.load("p1", &id).await.unwrap().unwrap();
        assert_eq!(persisted.importance, 0.5);

        let mut reloaded = persona(Some(store.clone()));
        assert_eq!(reloaded.load_long_tier().await.unwrap(), 1);
        assert_eq!(reloaded.locate(&id), Some(Tier::Long));

        assert!(memory.remove(&id).await.unwrap().is_some());
        assert_eq!(store.count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_long_write_keeps_evicted_items() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::at(dir.path());
        let store = LongTermStore::new(open_pool(&config).await.unwrap());
        let mut tiers = TierConfig::default();
        tiers.long.capacity = 1;
        let mut memory = PersonaMemory::new(
            "p1",
            &tiers,
            Arc::new(ManualClock::starting_now()),
            Some(store.clone()),
            5,
        );

        let kept = MemoryItem::new("p1", "kept".into(), Tier::Long, 0.2, Utc::now());
        let kept_id = kept.id.clone();
        memory.insert(kept).await.unwrap();

        store.pool().close().await;
        let incoming = MemoryItem::new("p1", "incoming".into(), Tier::Long, 0.9, Utc::now());
        let incoming_id = incoming.id.clone();
        assert!(memory.insert(incoming).await.is_err());

        assert_eq!(memory.locate(&kept_id), Some(Tier::Long));
        assert!(memory.get(&incoming_id).is_none());
        assert_eq!(memory.len(), 1);

        let reopened = LongTermStore::new(open_pool(&config).await.unwrap());
        assert!(reopened.load("p1", &kept_id).await.unwrap().is_some());
        assert!(reopened.load("p1", &incoming_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_tier_stays_volatile() {
        let store = LongTermStore::new(open_pool(&StorageConfig::in_memory()).await.unwrap());
        let mut memory = persona(Some(store.clone()));
        memory
            .insert(MemoryItem::new("p1", "scratch".into(), Tier::Short, 0.4, Utc::now()))
            .await
            .unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(store.count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_access_window_is_bounded() {
        let mut memory = persona(None);
        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let item = MemoryItem::new("p1", format!("note {i}").into(), Tier::Short, 0.5, now);
            ids.push(item.id.clone());
            memory.insert(item).await.unwrap();
        }
        for _ in 0..3 {
            for id in &ids {
                memory.touch(id).await;
            }
        }
        assert_eq!(memory.recent_ids().len(), 5);
        assert_eq!(memory.get(&ids[0]).unwrap().access_count, 3);
    }
}
