//! # Memory orchestrator
//!
//! Façade over every owner's tiered memory:
//! - remember / recall / forget per owner, serialized through the owner's lock
//! - consolidation passes and anomaly scans
//! - sharing a copy of an item with another owner
//! - cross-owner pattern extraction and engine statistics
//!
//! Different owners never contend with each other; one owner's operations
//! run one at a time.

use crate::anomaly::{AnomalyContext, AnomalyDetector, ScanReport};
use crate::cache::{CacheKey, CacheManager, CacheSetOptions, CacheStats, Invalidation};
use crate::clock::Clock;
use crate::consolidation::{ConsolidationReport, PromotionConsolidator};
use crate::error::{MemoryError, Result};
use crate::events::{EngineEvent, EventBus, EvictionCause};
use crate::persona::PersonaMemory;
use crate::predictive::{PredictiveCache, PredictiveStats, Retriever};
use crate::scoring::{ImportanceFeature, ImportanceScorer, PersonaProfile, UsageContext};
use crate::similarity::{find_similar, KeywordOverlapOracle, SimilarityOracle};
use crate::store::LongTermStore;
use crate::tier_store::{priority, TierConfig, TierFilter};
use crate::types::{memory_id, MemoryContent, MemoryId, MemoryItem, OwnerId, Tier};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};

/// Importance factor applied to shared copies
pub const SHARE_IMPORTANCE_FACTOR: f32 = 0.8;

/// Provenance tag prefix on shared copies
pub const SHARED_FROM_PREFIX: &str = "shared_from_";

const RECALL_NAMESPACE: &str = "recall";

/// Content transform applied to a shared copy
pub type ShareTransform = dyn Fn(&MemoryContent) -> MemoryContent + Send + Sync;

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A `remember` call
#[derive(Debug, Clone)]
pub struct RememberRequest {
    pub content: MemoryContent,
    /// Defaults to SHORT
    pub tier: Option<Tier>,
    /// Scored from usage context when absent
    pub importance: Option<f32>,
    pub tags: Vec<String>,
    pub ttl: Option<Duration>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RememberRequest {
    pub fn new(content: impl Into<MemoryContent>) -> Self {
        Self {
            content: content.into(),
            tier: None,
            importance: None,
            tags: Vec::new(),
            ttl: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A `recall` query
#[derive(Debug, Clone, PartialEq)]
pub struct RecallQuery {
    pub query: String,
    /// Restrict to one tier; all tiers when absent
    pub tier: Option<Tier>,
    /// Every tag must be present
    pub tags: Vec<String>,
    pub min_importance: f32,
    pub limit: usize,
    /// Rank by the similarity oracle instead of keyword containment
    pub semantic: bool,
}

impl Default for RecallQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            tier: None,
            tags: Vec::new(),
            min_importance: 0.0,
            limit: 10,
            semantic: false,
        }
    }
}

impl RecallQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn min_importance(mut self, min: f32) -> Self {
        self.min_importance = min;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn semantic(mut self, semantic: bool) -> Self {
        self.semantic = semantic;
        self
    }

    fn cache_key(&self, owner: &str) -> CacheKey {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        let tier = self.tier.map(|t| t.as_str()).unwrap_or("*");
        let tags = tags.join(",");
        let min_importance = format!("{:.4}", self.min_importance);
        let limit = self.limit.to_string();
        let semantic = if self.semantic { "semantic" } else { "keyword" };
        CacheKey::fingerprint(
            RECALL_NAMESPACE,
            &[owner, self.query.trim(), tier, &tags, &min_importance, &limit, semantic],
        )
    }

    fn filter(&self, with_text: bool) -> TierFilter {
        let filter = TierFilter::new()
            .with_tags(self.tags.clone())
            .with_min_importance(self.min_importance.clamp(0.0, 1.0));
        if with_text {
            filter.with_text(self.query.clone())
        } else {
            filter
        }
    }
}

// ─── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStatistics {
    pub tier: Tier,
    pub count: usize,
    pub capacity: usize,
    pub bytes_used: usize,
    pub utilization: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerStatistics {
    pub owner: OwnerId,
    pub tiers: Vec<TierStatistics>,
}

impl OwnerStatistics {
    pub fn total(&self) -> usize {
        self.tiers.iter().map(|t| t.count).sum()
    }

    pub fn count(&self, tier: Tier) -> usize {
        self.tiers
            .iter()
            .find(|t| t.tier == tier)
            .map(|t| t.count)
            .unwrap_or(0)
    }
}

/// Something worth an operator's attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Bottleneck {
    TierNearCapacity { owner: OwnerId, tier: Tier, utilization: f32 },
    LowCacheHitRate { hit_rate: f32, requests: u64 },
    CacheThrashing { evictions: u64, writes: u64 },
    LowPrefetchHitRate { hit_rate: f32, lookups: u64 },
}

impl std::fmt::Display for Bottleneck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bottleneck::TierNearCapacity { owner, tier, utilization } => write!(
                f,
                "{owner}: {tier} tier at {:.0}% of capacity",
                utilization * 100.0
            ),
            Bottleneck::LowCacheHitRate { hit_rate, requests } => write!(
                f,
                "cache hit rate {:.0}% over {requests} lookups",
                hit_rate * 100.0
            ),
            Bottleneck::CacheThrashing { evictions, writes } => {
                write!(f, "fast cache evicted {evictions} entries for {writes} writes")
            }
            Bottleneck::LowPrefetchHitRate { hit_rate, lookups } => write!(
                f,
                "prefetch hit rate {:.0}% over {lookups} lookups",
                hit_rate * 100.0
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub owners: Vec<OwnerStatistics>,
    pub cache: CacheStats,
    pub cache_hit_rate: f32,
    pub prefetch: PredictiveStats,
    pub bottlenecks: Vec<Bottleneck>,
}

/// A tag found in the long-term memory of several owners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedPattern {
    pub tag: String,
    pub owners: Vec<OwnerId>,
    /// LONG-tier items carrying the tag, across all owners
    pub occurrences: usize,
}

const NEAR_CAPACITY: f32 = 0.9;
const LOW_CACHE_HIT_RATE: f32 = 0.3;
const MIN_CACHE_LOOKUPS: u64 = 50;
const LOW_PREFETCH_HIT_RATE: f32 = 0.3;
const MIN_PREFETCH_LOOKUPS: u64 = 20;

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct MemoryOrchestrator {
    personas: RwLock<HashMap<OwnerId, Arc<Mutex<PersonaMemory>>>>,
    scorer: RwLock<ImportanceScorer>,
    tiers: TierConfig,
    consolidator: PromotionConsolidator,
    cache: Arc<CacheManager>,
    predictive: PredictiveCache,
    detector: Arc<AnomalyDetector>,
    oracle: Arc<dyn SimilarityOracle>,
    long_store: Option<LongTermStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    recent_window: usize,
    auto_register: bool,
}

impl std::fmt::Debug for MemoryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOrchestrator")
            .field("oracle", &self.oracle.name())
            .field("durable", &self.long_store.is_some())
            .field("auto_register", &self.auto_register)
            .finish()
    }
}

/// Collaborators shared with the rest of the engine
pub struct OrchestratorParts {
    pub scorer: ImportanceScorer,
    pub tiers: TierConfig,
    pub consolidator: PromotionConsolidator,
    pub cache: Arc<CacheManager>,
    pub predictive: PredictiveCache,
    pub detector: Arc<AnomalyDetector>,
    pub long_store: Option<LongTermStore>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub recent_window: usize,
    pub auto_register: bool,
}

impl MemoryOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            personas: RwLock::new(HashMap::new()),
            scorer: RwLock::new(parts.scorer),
            tiers: parts.tiers,
            consolidator: parts.consolidator,
            cache: parts.cache,
            predictive: parts.predictive,
            detector: parts.detector,
            oracle: Arc::new(KeywordOverlapOracle::default()),
            long_store: parts.long_store,
            events: parts.events,
            clock: parts.clock,
            recent_window: parts.recent_window,
            auto_register: parts.auto_register,
        }
    }

    /// Swap the similarity oracle
    pub fn with_oracle(mut self, oracle: Arc<dyn SimilarityOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current time on the engine clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn predictive(&self) -> &PredictiveCache {
        &self.predictive
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Register an owner and load its long-term tier.
    ///
    /// Re-registering only replaces the profile. Returns the number of
    /// long-term items loaded.
    pub async fn register_persona(&self, profile: PersonaProfile) -> Result<usize> {
        profile.validate()?;
        let owner = profile.name.clone();
        if owner.trim().is_empty() {
            return Err(MemoryError::InvalidMemoryRequest("owner name is empty".into()));
        }
        self.scorer.write().await.register_profile(profile);

        let mut personas = self.personas.write().await;
        if personas.contains_key(&owner) {
            return Ok(0);
        }
        let mut memory = PersonaMemory::new(
            owner.clone(),
            &self.tiers,
            Arc::clone(&self.clock),
            self.long_store.clone(),
            self.recent_window,
        );
        let loaded = memory.load_long_tier().await?;
        personas.insert(owner.clone(), Arc::new(Mutex::new(memory)));
        tracing::info!(owner = %owner, loaded, "Registered persona");
        Ok(loaded)
    }

    /// Registered owners, sorted
    pub async fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self.personas.read().await.keys().cloned().collect();
        owners.sort();
        owners
    }

    async fn persona(&self, owner: &str) -> Result<Arc<Mutex<PersonaMemory>>> {
        self.personas
            .read()
            .await
            .get(owner)
            .cloned()
            .ok_or_else(|| MemoryError::UnknownOwner(owner.to_string()))
    }

    /// Store content for an owner and return its id.
    ///
    /// The id is derived from owner and content, so remembering the same
    /// content twice updates the existing record in place.
    pub async fn remember(&self, owner: &str, request: RememberRequest) -> Result<MemoryId> {
        if request.content.is_empty() {
            return Err(MemoryError::InvalidMemoryRequest("content is empty".into()));
        }
        if let Some(hint) = request.importance {
            if !hint.is_finite() || !(0.0..=1.0).contains(&hint) {
                return Err(MemoryError::InvalidMemoryRequest(format!(
                    "importance hint {hint} is outside [0, 1]"
                )));
            }
        }
        if let Some(ttl) = request.ttl {
            if ttl <= Duration::zero() {
                return Err(MemoryError::InvalidMemoryRequest("ttl must be positive".into()));
            }
        }

        let persona = match self.persona(owner).await {
            Ok(persona) => persona,
            Err(_) if self.auto_register => {
                self.register_persona(PersonaProfile::new(owner)).await?;
                self.persona(owner).await?
            }
            Err(_) => {
                return Err(MemoryError::InvalidMemoryRequest(format!(
                    "unknown owner '{owner}'"
                )))
            }
        };

        let now = self.clock.now();
        let id = memory_id(owner, &request.content);
        let expires_at = match request.ttl {
            Some(ttl) => Some(now.checked_add_signed(ttl).ok_or_else(|| {
                MemoryError::InvalidMemoryRequest(format!("ttl {ttl} is out of range"))
            })?),
            None => None,
        };

        let mut memory = persona.lock().await;
        let (tier, importance, updated) = if memory.locate(&id).is_some() {
            let RememberRequest {
                importance,
                tags,
                metadata,
                ..
            } = request;
            let item = memory
                .update(&id, |item| {
                    item.tags.extend(tags);
                    item.metadata.extend(metadata);
                    if let Some(hint) = importance {
                        item.set_importance(hint);
                    }
                    if expires_at.is_some() || item.is_expired(now) {
                        item.expires_at = expires_at;
                    }
                })
                .await?
                .ok_or_else(|| MemoryError::NotFound(id.clone()))?;
            (item.tier, item.importance, true)
        } else {
            let importance = match request.importance {
                Some(hint) => hint,
                None => {
                    let ctx = self.usage_context(&memory, &request.content, now).await;
                    self.scorer.read().await.score(&request.content, owner, &ctx)
                }
            };
            let tier = request.tier.unwrap_or(Tier::Short);

            let mut item = MemoryItem::new(owner, request.content, tier, importance, now)
                .with_tags(request.tags);
            item.metadata = request.metadata;
            item.expires_at = expires_at;

            let store = memory.tier(tier);
            let cause = if store.len() >= store.capacity() {
                EvictionCause::Capacity
            } else {
                EvictionCause::ByteBudget
            };
            let importance = item.importance;
            let outcome = memory.insert(item).await?;
            drop(memory);

            for evicted in outcome.evicted {
                self.predictive.forget(&evicted.id).await;
                self.events
                    .emit(EngineEvent::Evicted {
                        owner: owner.to_string(),
                        item_id: evicted.id,
                        tier,
                        cause,
                        timestamp: now,
                    })
                    .await;
            }
            self.after_remember(owner, &id, tier, importance, false, now).await;
            return Ok(id);
        };
        drop(memory);

        self.after_remember(owner, &id, tier, importance, updated, now).await;
        Ok(id)
    }

    async fn after_remember(
        &self,
        owner: &str,
        id: &str,
        tier: Tier,
        importance: f32,
        updated: bool,
        now: DateTime<Utc>,
    ) {
        self.cache
            .invalidate(&Invalidation::Owner(owner.to_string()))
            .await;
        self.predictive.invalidate(id).await;
        tracing::debug!(owner, id, %tier, importance, updated, "Remembered");
        self.events
            .emit(EngineEvent::Remembered {
                owner: owner.to_string(),
                item_id: id.to_string(),
                tier,
                importance,
                updated,
                timestamp: now,
            })
            .await;
    }

    async fn usage_context(
        &self,
        memory: &PersonaMemory,
        content: &MemoryContent,
        now: DateTime<Utc>,
    ) -> UsageContext {
        let items: Vec<MemoryItem> = memory
            .all_items()
            .into_iter()
            .filter(|item| !item.is_expired(now))
            .collect();

        let similar = match find_similar(
            self.oracle.as_ref(),
            &content.searchable_text(),
            &items,
            None,
        )
        .await
        {
            Ok(similar) => similar,
            Err(e) => {
                tracing::warn!(owner = memory.owner(), error = %e, "Similarity lookup failed, scoring without neighbours");
                Vec::new()
            }
        };

        let similar_ids: Vec<MemoryId> = similar.into_iter().map(|(id, _)| id).collect();
        let activity = items
            .iter()
            .filter(|item| similar_ids.contains(&item.id))
            .map(|item| item.last_access)
            .fold(None, |acc: Option<(DateTime<Utc>, DateTime<Utc>)>, t| match acc {
                Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
                None => Some((t, t)),
            });

        let mut recent = memory.recent_ids();
        recent.reverse();

        UsageContext {
            total_items: items.len(),
            recent_access_ids: recent,
            similar_ids,
            similar_activity: activity,
            now,
        }
    }

    /// Matching items for an owner, best first. Expired items are never returned.
    pub async fn recall(&self, owner: &str, query: &RecallQuery) -> Result<Vec<MemoryItem>> {
        let persona = self.persona(owner).await?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let key = query.cache_key(owner);
        let cached: Option<Vec<MemoryId>> = self.cache.get(&key).await;
        let mut cache_hit = cached.is_some();

        let results = {
            let mut memory = persona.lock().await;
            let now = self.clock.now();

            // A cached list with an expired or deleted id may hide other matches
            let cached = cached.filter(|ids| {
                ids.iter()
                    .all(|id| memory.get(id).is_some_and(|item| !item.is_expired(now)))
            });
            if cache_hit && cached.is_none() {
                tracing::debug!(owner, "Cached recall result is stale, searching again");
                cache_hit = false;
            }

            let ids = match cached {
                Some(ids) => ids,
                None => {
                    let ids = self.search(&memory, query, now).await;
                    let options = CacheSetOptions::new().owner(owner).tags([owner]);
                    if let Err(e) = self.cache.set(key, &ids, options).await {
                        tracing::warn!(owner, error = %e, "Could not cache recall results");
                    }
                    ids
                }
            };

            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                if memory.get(&id).is_some_and(|item| item.is_expired(now)) {
                    continue;
                }
                if let Some(item) = memory.touch(&id).await {
                    results.push(item);
                }
            }

            if let Some(top) = results.first().map(|item| item.id.clone()) {
                if let Some(previous) = memory.last_recalled.replace(top.clone()) {
                    if previous != top {
                        self.predictive.record_transition(&previous, &top).await;
                    }
                }
            }
            results
        };

        if let Some(top) = results.first() {
            if let Some(handle) = self
                .predictive
                .preload(&top.id, retriever_for(Arc::clone(&persona)))
                .await
            {
                let origin = top.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.await {
                        tracing::warn!(%origin, error = %e, "Prefetch task failed");
                    }
                });
            }
        }

        self.events
            .emit(EngineEvent::Recalled {
                owner: owner.to_string(),
                results: results.len(),
                cache_hit,
                timestamp: self.clock.now(),
            })
            .await;
        Ok(results)
    }

    async fn search(
        &self,
        memory: &PersonaMemory,
        query: &RecallQuery,
        now: DateTime<Utc>,
    ) -> Vec<MemoryId> {
        let tiers: Vec<Tier> = match query.tier {
            Some(tier) => vec![tier],
            None => Tier::ALL.to_vec(),
        };

        if query.semantic && !query.query.trim().is_empty() {
            let candidates: Vec<MemoryItem> = tiers
                .iter()
                .flat_map(|t| memory.tier(*t).search(&query.filter(false), usize::MAX))
                .collect();
            match find_similar(self.oracle.as_ref(), &query.query, &candidates, None).await {
                Ok(similar) => {
                    return similar
                        .into_iter()
                        .take(query.limit)
                        .map(|(id, _)| id)
                        .collect()
                }
                Err(e) => {
                    tracing::warn!(owner = memory.owner(), error = %e, "Semantic recall failed, using keyword match");
                }
            }
        }

        let filter = query.filter(true);
        let mut ranked: Vec<(f32, MemoryItem)> = tiers
            .iter()
            .flat_map(|t| {
                let store = memory.tier(*t);
                let half_life = store.settings().half_life();
                store
                    .search(&filter, query.limit)
                    .into_iter()
                    .map(move |item| (priority(&item, now, half_life), item))
            })
            .collect();
        ranked.sort_by(|(pa, a), (pb, b)| {
            pb.total_cmp(pa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
            .into_iter()
            .take(query.limit)
            .map(|(_, item)| item.id)
            .collect()
    }

    /// Fetch one item by id, serving prefetched copies first.
    /// Does not count as a recall.
    pub async fn get(&self, owner: &str, id: &str) -> Result<Option<MemoryItem>> {
        let persona = self.persona(owner).await?;
        let now = self.clock.now();
        if let Some(item) = self.predictive.get(id).await {
            if item.owner == owner && !item.is_expired(now) {
                return Ok(Some(item));
            }
        }
        let memory = persona.lock().await;
        Ok(memory.get(id).filter(|item| !item.is_expired(now)).cloned())
    }

    /// Delete an item from whichever tier holds it
    pub async fn forget(&self, owner: &str, id: &str) -> Result<bool> {
        let persona = self.persona(owner).await?;
        let removed = {
            let mut memory = persona.lock().await;
            let removed = memory.remove(id).await?;
            if removed.is_some() && memory.last_recalled.as_deref() == Some(id) {
                memory.last_recalled = None;
            }
            removed
        };
        let Some(item) = removed else {
            return Ok(false);
        };

        self.cache
            .invalidate(&Invalidation::Owner(owner.to_string()))
            .await;
        self.predictive.forget(id).await;
        tracing::debug!(owner, id, tier = %item.tier, "Forgot memory");
        self.events
            .emit(EngineEvent::Forgotten {
                owner: owner.to_string(),
                item_id: id.to_string(),
                timestamp: self.clock.now(),
            })
            .await;
        Ok(true)
    }

    /// Run one consolidation pass for an owner
    pub async fn consolidate(&self, owner: &str) -> Result<ConsolidationReport> {
        self.consolidate_with_cancel(owner, None).await
    }

    pub async fn consolidate_with_cancel(
        &self,
        owner: &str,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<ConsolidationReport> {
        let persona = self.persona(owner).await?;
        let report = self.consolidator.run(&persona, &self.events, cancel).await;

        if report.changed() {
            self.cache
                .invalidate(&Invalidation::Owner(owner.to_string()))
                .await;
            for id in &report.promoted_ids {
                self.predictive.invalidate(id).await;
            }
            for id in report.expired_ids.iter().chain(&report.evicted_ids) {
                self.predictive.forget(id).await;
            }
        }
        Ok(report)
    }

    /// Copy an item into another owner's memory, leaving the source untouched
    pub async fn share_memory(&self, from: &str, to: &str, id: &str) -> Result<MemoryId> {
        self.share_memory_with(from, to, id, None).await
    }

    /// Like [`share_memory`](Self::share_memory), transforming the copied content
    pub async fn share_memory_with(
        &self,
        from: &str,
        to: &str,
        id: &str,
        transform: Option<&ShareTransform>,
    ) -> Result<MemoryId> {
        if from == to {
            return Err(MemoryError::InvalidMemoryRequest(
                "cannot share a memory with its own owner".into(),
            ));
        }
        let source = self.persona(from).await?;
        let target = self.persona(to).await?;
        let now = self.clock.now();

        let original = {
            let memory = source.lock().await;
            memory
                .get(id)
                .filter(|item| !item.is_expired(now))
                .cloned()
                .ok_or_else(|| MemoryError::NotFound(id.to_string()))?
        };

        let content = match transform {
            Some(transform) => transform(&original.content),
            None => original.content.clone(),
        };
        if content.is_empty() {
            return Err(MemoryError::InvalidMemoryRequest(
                "shared content is empty after transform".into(),
            ));
        }

        let mut copy = MemoryItem::new(
            to,
            content,
            original.tier,
            original.importance * SHARE_IMPORTANCE_FACTOR,
            now,
        )
        .with_tags(original.tags.iter().cloned())
        .with_tags([format!("{SHARED_FROM_PREFIX}{from}")]);
        copy.metadata = original.metadata.clone();
        copy.metadata
            .insert("shared_from".into(), serde_json::Value::String(from.to_string()));
        copy.metadata
            .insert("source_id".into(), serde_json::Value::String(original.id.clone()));
        copy.expires_at = original.expires_at;
        let copy_id = copy.id.clone();

        let mut memory = target.lock().await;
        if let Some(tier) = memory.locate(&copy_id) {
            // The target already holds this content; merge into that record
            let MemoryItem {
                importance,
                tags,
                metadata,
                expires_at,
                ..
            } = copy;
            memory
                .update(&copy_id, |item| {
                    item.set_importance(importance);
                    item.tags.extend(tags);
                    item.metadata.extend(metadata);
                    if item.is_expired(now) {
                        item.expires_at = expires_at;
                    }
                })
                .await?;
            drop(memory);
            tracing::debug!(from, to, source = id, copy = %copy_id, %tier, "Merged shared memory into existing record");
            return self.after_share(from, to, id, &copy_id, now).await;
        }

        let tier = copy.tier;
        let outcome = memory.insert(copy).await?;
        drop(memory);
        for evicted in outcome.evicted {
            self.predictive.forget(&evicted.id).await;
            self.events
                .emit(EngineEvent::Evicted {
                    owner: to.to_string(),
                    item_id: evicted.id,
                    tier,
                    cause: EvictionCause::Capacity,
                    timestamp: now,
                })
                .await;
        }

        tracing::debug!(from, to, source = id, copy = %copy_id, %tier, "Shared memory");
        self.after_share(from, to, id, &copy_id, now).await
    }

    async fn after_share(
        &self,
        from: &str,
        to: &str,
        source_id: &str,
        copy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MemoryId> {
        self.cache
            .invalidate(&Invalidation::Owner(to.to_string()))
            .await;
        self.predictive.invalidate(copy_id).await;
        self.events
            .emit(EngineEvent::Shared {
                from_owner: from.to_string(),
                to_owner: to.to_string(),
                source_id: source_id.to_string(),
                copy_id: copy_id.to_string(),
                timestamp: now,
            })
            .await;
        Ok(copy_id.to_string())
    }

    /// Tags present in the long-term memory of two or more owners
    pub async fn extract_patterns(&self) -> Vec<SharedPattern> {
        let personas: Vec<(OwnerId, Arc<Mutex<PersonaMemory>>)> = self
            .personas
            .read()
            .await
            .iter()
            .map(|(owner, persona)| (owner.clone(), Arc::clone(persona)))
            .collect();
        let now = self.clock.now();

        let mut by_tag: BTreeMap<String, (BTreeSet<OwnerId>, usize)> = BTreeMap::new();
        for (owner, persona) in personas {
            let memory = persona.lock().await;
            for item in memory.tier(Tier::Long).items() {
                if item.is_expired(now) {
                    continue;
                }
                for tag in &item.tags {
                    if is_provenance_tag(tag) {
                        continue;
                    }
                    let entry = by_tag.entry(tag.clone()).or_default();
                    entry.0.insert(owner.clone());
                    entry.1 += 1;
                }
            }
        }

        let mut patterns: Vec<SharedPattern> = by_tag
            .into_iter()
            .filter(|(_, (owners, _))| owners.len() >= 2)
            .map(|(tag, (owners, occurrences))| SharedPattern {
                tag,
                owners: owners.into_iter().collect(),
                occurrences,
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.owners
                .len()
                .cmp(&a.owners.len())
                .then(b.occurrences.cmp(&a.occurrences))
                .then_with(|| a.tag.cmp(&b.tag))
        });
        patterns
    }

    /// Tier counts, cache and prefetch hit rates, and detected bottlenecks
    pub async fn get_statistics(&self, owner: Option<&str>) -> Result<EngineStatistics> {
        let selected: Vec<(OwnerId, Arc<Mutex<PersonaMemory>>)> = match owner {
            Some(owner) => vec![(owner.to_string(), self.persona(owner).await?)],
            None => {
                let personas = self.personas.read().await;
                let mut all: Vec<_> = personas
                    .iter()
                    .map(|(o, p)| (o.clone(), Arc::clone(p)))
                    .collect();
                all.sort_by(|a, b| a.0.cmp(&b.0));
                all
            }
        };

        let mut owners = Vec::with_capacity(selected.len());
        let mut bottlenecks = Vec::new();
        for (name, persona) in selected {
            let memory = persona.lock().await;
            let tiers: Vec<TierStatistics> = Tier::ALL
                .iter()
                .map(|t| {
                    let store = memory.tier(*t);
                    TierStatistics {
                        tier: *t,
                        count: store.len(),
                        capacity: store.capacity(),
                        bytes_used: store.bytes_used(),
                        utilization: store.utilization(),
                    }
                })
                .collect();
            for tier in &tiers {
                if tier.utilization > NEAR_CAPACITY {
                    bottlenecks.push(Bottleneck::TierNearCapacity {
                        owner: name.clone(),
                        tier: tier.tier,
                        utilization: tier.utilization,
                    });
                }
            }
            owners.push(OwnerStatistics { owner: name, tiers });
        }

        let cache = self.cache.stats().await;
        let cache_hit_rate = cache.hit_rate();
        if cache.total_requests >= MIN_CACHE_LOOKUPS && cache_hit_rate < LOW_CACHE_HIT_RATE {
            bottlenecks.push(Bottleneck::LowCacheHitRate {
                hit_rate: cache_hit_rate,
                requests: cache.total_requests,
            });
        }
        if cache.fast.writes > 0 && cache.fast.evictions * 2 > cache.fast.writes {
            bottlenecks.push(Bottleneck::CacheThrashing {
                evictions: cache.fast.evictions,
                writes: cache.fast.writes,
            });
        }

        let prefetch = self.predictive.stats().await;
        let lookups = prefetch.prefetch_hits + prefetch.prefetch_misses;
        if lookups >= MIN_PREFETCH_LOOKUPS && prefetch.hit_rate() < LOW_PREFETCH_HIT_RATE {
            bottlenecks.push(Bottleneck::LowPrefetchHitRate {
                hit_rate: prefetch.hit_rate(),
                lookups,
            });
        }

        Ok(EngineStatistics {
            owners,
            cache,
            cache_hit_rate,
            prefetch,
            bottlenecks,
        })
    }

    /// Nudge scoring weights toward observed per-feature importance
    pub async fn feedback(&self, observations: &[(ImportanceFeature, f32)]) {
        self.scorer.write().await.adjust_weights(observations);
    }

    pub async fn scorer(&self) -> ImportanceScorer {
        self.scorer.read().await.clone()
    }

    /// Anomaly scan over one owner, or every owner
    pub async fn scan_anomalies(&self, owner: Option<&str>) -> Result<ScanReport> {
        self.scan_anomalies_with_cancel(owner, None).await
    }

    /// Scan, checking `cancel` between items. A cancelled scan returns
    /// [`MemoryError::Cancelled`].
    pub async fn scan_anomalies_with_cancel(
        &self,
        owner: Option<&str>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<ScanReport> {
        let owners = match owner {
            Some(owner) => {
                self.persona(owner).await?;
                vec![owner.to_string()]
            }
            None => self.owners().await,
        };

        let mut total = ScanReport::default();
        for owner in owners {
            let persona = self.persona(&owner).await?;
            let now = self.clock.now();
            let items: Vec<MemoryItem> = persona
                .lock()
                .await
                .all_items()
                .into_iter()
                .filter(|item| !item.is_expired(now))
                .collect();

            let mut batch = Vec::with_capacity(items.len());
            for item in &items {
                if cancel.is_some_and(|rx| *rx.borrow()) {
                    tracing::info!(owner = %owner, "Anomaly scan cancelled");
                    return Err(MemoryError::Cancelled);
                }
                let similar = match find_similar(
                    self.oracle.as_ref(),
                    &item.content.searchable_text(),
                    &items,
                    Some(&item.id),
                )
                .await
                {
                    Ok(similar) => similar.len(),
                    Err(e) => {
                        tracing::warn!(owner = %owner, id = %item.id, error = %e, "Similarity lookup failed during scan");
                        0
                    }
                };
                batch.push((item.clone(), AnomalyContext::new(now).with_similar_count(similar)));
            }

            let report = self.detector.scan(&batch).await;
            for finding in &report.reports {
                self.events
                    .emit(EngineEvent::AnomalyDetected {
                        owner: finding.owner.clone(),
                        item_id: finding.item_id.clone(),
                        anomaly_type: finding.anomaly_type,
                        score: finding.score,
                        timestamp: now,
                    })
                    .await;
            }
            total.merge(report);
        }
        Ok(total)
    }
}

fn is_provenance_tag(tag: &str) -> bool {
    tag.starts_with(SHARED_FROM_PREFIX) || tag.starts_with("promoted_from_")
}

fn retriever_for(persona: Arc<Mutex<PersonaMemory>>) -> Retriever {
    Arc::new(move |id: MemoryId| {
        let persona = Arc::clone(&persona);
        async move { Ok::<_, MemoryError>(persona.lock().await.get(&id).cloned()) }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyThresholds, AnomalyType};
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::consolidation::{ConsolidationConfig, PROMOTED_FROM_SHORT};
    use crate::predictive::PredictiveConfig;
    use crate::scoring::ScoringConfig;
    use crate::store::{open_pool, StorageConfig};
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        orchestrator: MemoryOrchestrator,
        clock: ManualClock,
    }

    async fn harness_with(tiers: TierConfig, long_store: Option<LongTermStore>) -> Harness {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let orchestrator = MemoryOrchestrator::new(OrchestratorParts {
            scorer: ImportanceScorer::new(ScoringConfig::default()),
            tiers,
            consolidator: PromotionConsolidator::new(
                ConsolidationConfig::default(),
                Arc::clone(&shared),
            ),
            cache: Arc::new(CacheManager::new(CacheConfig::default(), Arc::clone(&shared))),
            predictive: PredictiveCache::new(PredictiveConfig::default()),
            detector: Arc::new(AnomalyDetector::new(AnomalyThresholds::default())),
            long_store,
            events: EventBus::default(),
            clock: shared,
            recent_window: 50,
            auto_register: false,
        });
        for owner in ["p1", "p2", "p3"] {
            orchestrator
                .register_persona(PersonaProfile::new(owner))
                .await
                .unwrap();
        }
        Harness { orchestrator, clock }
    }

    async fn harness() -> Harness {
        harness_with(TierConfig::default(), None).await
    }

    #[tokio::test]
    async fn remember_validates_requests() {
        let h = harness().await;
        let o = &h.orchestrator;

        let err = o.remember("p1", RememberRequest::new("")).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidMemoryRequest(_)));

        let err = o
            .remember("p1", RememberRequest::new("x").importance(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidMemoryRequest(_)));

        let err = o
            .remember("p1", RememberRequest::new("x").importance(f32::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidMemoryRequest(_)));

        let err = o.remember("ghost", RememberRequest::new("x")).await.unwrap_err();
        match err {
            MemoryError::InvalidMemoryRequest(msg) => assert!(msg.contains("ghost")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(o.owners().await, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn repeated_content_updates_in_place() {
        let h = harness().await;
        let o = &h.orchestrator;

        let first = assert_ok!(o.remember("p1", RememberRequest::new("deploy notes").tag("ops")).await);
        let second = assert_ok!(
            o.remember("p1", RememberRequest::new("deploy notes").tag("infra").importance(0.6))
                .await
        );
        assert_eq!(first, second);

        let item = o.get("p1", &first).await.unwrap().unwrap();
        assert_eq!(item.importance, 0.6);
        assert!(item.tags.contains("ops") && item.tags.contains("infra"));

        let stats = o.get_statistics(Some("p1")).await.unwrap();
        assert_eq!(stats.owners[0].total(), 1);
    }

    #[tokio::test]
    async fn scored_importance_stays_in_range() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o
            .remember("p1", RememberRequest::new("a fresh observation about caching layers"))
            .await
            .unwrap();
        let item = o.get("p1", &id).await.unwrap().unwrap();
        assert!((0.0..=1.0).contains(&item.importance));
        assert_eq!(item.tier, Tier::Short);
    }

    #[tokio::test]
    async fn recall_filters_and_counts_access() {
        let h = harness().await;
        let o = &h.orchestrator;
        let a = o
            .remember("p1", RememberRequest::new("rust borrow checker").importance(0.9).tag("rust"))
            .await
            .unwrap();
        o.remember("p1", RememberRequest::new("python packaging").importance(0.8))
            .await
            .unwrap();
        o.remember("p1", RememberRequest::new("rust macros").importance(0.2).tag("rust"))
            .await
            .unwrap();

        let results = o
            .recall("p1", &RecallQuery::new("rust").tag("rust").min_importance(0.5))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, a);
        assert_eq!(results[0].access_count, 1);

        assert!(o.recall("p1", &RecallQuery::new("nothing here")).await.unwrap().is_empty());
        assert!(matches!(
            o.recall("ghost", &RecallQuery::default()).await,
            Err(MemoryError::UnknownOwner(_))
        ));
    }

    #[tokio::test]
    async fn cached_recall_still_counts_access() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o
            .remember("p1", RememberRequest::new("x").importance(0.9))
            .await
            .unwrap();
        for _ in 0..3 {
            o.recall("p1", &RecallQuery::new("x")).await.unwrap();
        }
        let item = o.get("p1", &id).await.unwrap().unwrap();
        assert_eq!(item.access_count, 3);
        assert!(o.cache().stats().await.hits >= 2);
    }

    #[tokio::test]
    async fn recall_never_returns_expired_items() {
        let h = harness().await;
        let o = &h.orchestrator;
        o.remember(
            "p1",
            RememberRequest::new("short lived").importance(0.9).ttl(Duration::minutes(5)),
        )
        .await
        .unwrap();
        assert_eq!(o.recall("p1", &RecallQuery::new("short")).await.unwrap().len(), 1);

        h.clock.advance_secs(301);
        // Served from the recall cache, still filtered
        assert!(o.recall("p1", &RecallQuery::new("short")).await.unwrap().is_empty());
        assert!(o.recall("p1", &RecallQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_cached_recall_searches_again() {
        let h = harness().await;
        let o = &h.orchestrator;
        o.remember(
            "p1",
            RememberRequest::new("rust alpha").importance(0.9).ttl(Duration::minutes(5)),
        )
        .await
        .unwrap();
        let beta = o
            .remember("p1", RememberRequest::new("rust beta").importance(0.5))
            .await
            .unwrap();

        let query = RecallQuery::new("rust").limit(1);
        assert_eq!(o.recall("p1", &query).await.unwrap().len(), 1);

        h.clock.advance_secs(301);
        let results = o.recall("p1", &query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, beta);
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected() {
        let h = harness().await;
        let o = &h.orchestrator;
        let err = o
            .remember("p1", RememberRequest::new("forever").ttl(Duration::days(100_000_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidMemoryRequest(_)));
        assert_eq!(o.get_statistics(Some("p1")).await.unwrap().owners[0].total(), 0);
    }

    #[tokio::test]
    async fn remembering_an_expired_item_revives_it() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o
            .remember("p1", RememberRequest::new("note").ttl(Duration::minutes(5)))
            .await
            .unwrap();
        h.clock.advance_secs(301);
        assert!(o.get("p1", &id).await.unwrap().is_none());

        assert_eq!(o.remember("p1", RememberRequest::new("note")).await.unwrap(), id);
        let item = o.get("p1", &id).await.unwrap().unwrap();
        assert_eq!(item.expires_at, None);
        assert_eq!(o.recall("p1", &RecallQuery::new("note")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_serves_prefetched_items() {
        let h = harness().await;
        let o = &h.orchestrator;
        o.remember("p1", RememberRequest::new("alpha notes").importance(0.5))
            .await
            .unwrap();
        let beta = o
            .remember("p1", RememberRequest::new("beta notes").importance(0.5))
            .await
            .unwrap();

        // alpha -> beta three times, then alpha once more to trigger a preload
        for query in ["alpha", "beta", "alpha", "beta", "alpha", "beta", "alpha"] {
            assert_eq!(o.recall("p1", &RecallQuery::new(query)).await.unwrap().len(), 1);
        }
        for _ in 0..100 {
            if o.predictive().prefetched_len().await > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(o.predictive().prefetched_len().await, 1);

        let hits_before = o.predictive().stats().await.prefetch_hits;
        let item = o.get("p1", &beta).await.unwrap().unwrap();
        assert_eq!(item.id, beta);
        assert_eq!(o.predictive().stats().await.prefetch_hits, hits_before + 1);
    }

    #[tokio::test]
    async fn semantic_recall_ranks_by_similarity() {
        let h = harness().await;
        let o = &h.orchestrator;
        let close = o
            .remember("p1", RememberRequest::new("tokio runtime worker threads").importance(0.3))
            .await
            .unwrap();
        o.remember("p1", RememberRequest::new("sourdough bread recipe").importance(0.9))
            .await
            .unwrap();

        let results = o
            .recall("p1", &RecallQuery::new("tokio worker threads").semantic(true))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, close);
    }

    #[tokio::test]
    async fn forget_removes_and_reports() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o.remember("p1", RememberRequest::new("temp")).await.unwrap();
        assert!(o.forget("p1", &id).await.unwrap());
        assert!(!o.forget("p1", &id).await.unwrap());
        assert!(o.get("p1", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consolidate_promotes_after_three_recalls() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o
            .remember("p1", RememberRequest::new("x").importance(0.9))
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(o.recall("p1", &RecallQuery::new("x")).await.unwrap().len(), 1);
        }

        let report = o.consolidate("p1").await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.expired, 0);
        assert!(report.errors.is_empty());

        let item = o.get("p1", &id).await.unwrap().unwrap();
        assert_eq!(item.tier, Tier::Medium);
        assert!((item.importance - 1.0).abs() < 1e-6);
        assert!(item.tags.contains(PROMOTED_FROM_SHORT));
    }

    #[tokio::test]
    async fn share_copies_without_touching_source() {
        let h = harness().await;
        let o = &h.orchestrator;
        let id = o
            .remember("p1", RememberRequest::new("shared insight").importance(0.75).tag("arch"))
            .await
            .unwrap();
        let before = o.get("p1", &id).await.unwrap().unwrap();

        let copy_id = o.share_memory("p1", "p2", &id).await.unwrap();
        assert_ne!(copy_id, id);

        let after = o.get("p1", &id).await.unwrap().unwrap();
        assert_eq!(before, after);

        let copy = o.get("p2", &copy_id).await.unwrap().unwrap();
        assert!((copy.importance - 0.75 * 0.8).abs() < 1e-6);
        assert!(copy.tags.contains("shared_from_p1"));
        assert!(copy.tags.contains("arch"));
        assert_eq!(copy.tier, before.tier);
        assert_eq!(copy.metadata["source_id"], serde_json::json!(id));

        let upper: &ShareTransform =
            &|c: &MemoryContent| MemoryContent::text(c.searchable_text().to_uppercase());
        let transformed = o.share_memory_with("p1", "p3", &id, Some(upper)).await.unwrap();
        let copy = o.get("p3", &transformed).await.unwrap().unwrap();
        assert_eq!(copy.content, MemoryContent::text("SHARED INSIGHT"));

        assert_err!(o.share_memory("p1", "p1", &id).await);
        assert!(matches!(
            o.share_memory("p1", "p2", "missing").await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn share_merges_into_existing_record() {
        let h = harness().await;
        let o = &h.orchestrator;
        let existing = o
            .remember("p2", RememberRequest::new("shared insight").importance(0.3))
            .await
            .unwrap();
        let source = o
            .remember(
                "p1",
                RememberRequest::new("shared insight").tier(Tier::Long).importance(0.75),
            )
            .await
            .unwrap();

        let copy_id = o.share_memory("p1", "p2", &source).await.unwrap();
        assert_eq!(copy_id, existing);

        let stats = o.get_statistics(Some("p2")).await.unwrap();
        assert_eq!(stats.owners[0].total(), 1);
        assert_eq!(stats.owners[0].count(Tier::Short), 1);
        assert_eq!(stats.owners[0].count(Tier::Long), 0);

        let merged = o.get("p2", &existing).await.unwrap().unwrap();
        assert_eq!(merged.tier, Tier::Short);
        assert!((merged.importance - 0.75 * 0.8).abs() < 1e-6);
        assert!(merged.tags.contains("shared_from_p1"));
        assert_eq!(merged.metadata["source_id"], serde_json::json!(source));
    }

    #[tokio::test]
    async fn patterns_need_two_owners() {
        let h = harness().await;
        let o = &h.orchestrator;
        for (owner, text) in [("p1", "one"), ("p2", "two"), ("p3", "three")] {
            o.remember(
                owner,
                RememberRequest::new(text).tier(Tier::Long).importance(0.9).tag("testing"),
            )
            .await
            .unwrap();
        }
        o.remember("p1", RememberRequest::new("solo").tier(Tier::Long).tag("solo"))
            .await
            .unwrap();
        o.remember("p2", RememberRequest::new("short").tag("solo")).await.unwrap();

        let patterns = o.extract_patterns().await;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].tag, "testing");
        assert_eq!(patterns[0].owners, vec!["p1", "p2", "p3"]);
        assert_eq!(patterns[0].occurrences, 3);
    }

    #[tokio::test]
    async fn statistics_flag_full_tiers() {
        let mut tiers = TierConfig::default();
        tiers.short.capacity = 2;
        let h = harness_with(tiers, None).await;
        let o = &h.orchestrator;
        o.remember("p1", RememberRequest::new("a").importance(0.5)).await.unwrap();
        o.remember("p1", RememberRequest::new("b").importance(0.5)).await.unwrap();
        o.remember("p1", RememberRequest::new("c").importance(0.9)).await.unwrap();

        let stats = o.get_statistics(None).await.unwrap();
        assert_eq!(stats.owners.len(), 3);
        let p1 = &stats.owners[0];
        assert_eq!(p1.count(Tier::Short), 2);
        assert!(stats.bottlenecks.contains(&Bottleneck::TierNearCapacity {
            owner: "p1".into(),
            tier: Tier::Short,
            utilization: 1.0,
        }));
        assert!(matches!(
            o.get_statistics(Some("ghost")).await,
            Err(MemoryError::UnknownOwner(_))
        ));
    }

    #[tokio::test]
    async fn long_tier_survives_reregistration() {
        let store = LongTermStore::new(open_pool(&StorageConfig::in_memory()).await.unwrap());
        let h = harness_with(TierConfig::default(), Some(store.clone())).await;
        h.orchestrator
            .remember("p1", RememberRequest::new("keep me").tier(Tier::Long).importance(0.9))
            .await
            .unwrap();

        let fresh = harness_with(TierConfig::default(), Some(store)).await;
        let results = fresh
            .orchestrator
            .recall("p1", &RecallQuery::new("keep"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tier, Tier::Long);
    }

    #[tokio::test]
    async fn scan_reports_anomalies_and_emits_events() {
        let h = harness().await;
        let o = &h.orchestrator;
        let mut rx = o.events().subscribe();
        o.remember("p1", RememberRequest::new("a").importance(0.5)).await.unwrap();

        let report = o.scan_anomalies(Some("p1")).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.count_of(AnomalyType::Size), 1);

        let mut saw_anomaly = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::AnomalyDetected { .. }) {
                saw_anomaly = true;
            }
        }
        assert!(saw_anomaly);
    }

    #[tokio::test]
    async fn cancelled_scan_stops() {
        let h = harness().await;
        let o = &h.orchestrator;
        o.remember("p1", RememberRequest::new("anything")).await.unwrap();
        let (tx, rx) = watch::channel(true);
        assert!(matches!(
            o.scan_anomalies_with_cancel(None, Some(&rx)).await,
            Err(MemoryError::Cancelled)
        ));
        drop(tx);
    }

    struct BrokenOracle;

    #[async_trait]
    impl SimilarityOracle for BrokenOracle {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn score(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
            Err(MemoryError::Other(anyhow::anyhow!("oracle offline")))
        }
    }

    #[tokio::test]
    async fn oracle_failure_degrades_gracefully() {
        let h = harness().await;
        let o = h.orchestrator.with_oracle(Arc::new(BrokenOracle));
        o.remember("p1", RememberRequest::new("first note")).await.unwrap();
        o.remember("p1", RememberRequest::new("second note")).await.unwrap();

        let results = o
            .recall("p1", &RecallQuery::new("second").semantic(true))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn feedback_shifts_weights() {
        let h = harness().await;
        let o = &h.orchestrator;
        let before = o.scorer().await.weights().get(ImportanceFeature::Richness);
        o.feedback(&[(ImportanceFeature::Richness, 1.0)]).await;
        let after = o.scorer().await.weights().get(ImportanceFeature::Richness);
        assert!(after > before);
    }
}
