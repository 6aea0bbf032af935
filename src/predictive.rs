//! Access-sequence learner with speculative prefetch.
//!
//! Observed `current -> next` transitions are kept per key (most recent
//! successors only). Once a key has enough observations, the most frequent
//! successors are fetched in the background into a small bounded cache.

use crate::error::{MemoryError, Result};
use crate::types::{MemoryId, MemoryItem};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Successors remembered per key
    pub max_successors: usize,
    /// Below this many observations a key yields no prediction
    pub min_observations: usize,
    pub max_candidates: usize,
    /// Preload is skipped below this confidence
    pub min_confidence: f32,
    /// Entries held by the prefetch cache
    pub prefetch_capacity: usize,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            max_successors: 100,
            min_observations: 3,
            max_candidates: 5,
            min_confidence: 0.3,
            prefetch_capacity: 1000,
        }
    }
}

impl PredictiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_successors == 0 || self.max_candidates == 0 || self.prefetch_capacity == 0 {
            return Err(MemoryError::Configuration(
                "predictive max_successors, max_candidates and prefetch_capacity must be non-zero"
                    .into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(MemoryError::Configuration(format!(
                "predictive min_confidence {} is outside [0, 1]",
                self.min_confidence
            )));
        }
        Ok(())
    }
}

/// Likely next items for a key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Most frequent first, with observed counts
    pub candidates: Vec<(MemoryId, usize)>,
    /// `top frequency / total observations`, 0 when there is too little data
    pub confidence: f32,
    pub observations: usize,
}

impl Prediction {
    pub fn ids(&self) -> Vec<MemoryId> {
        self.candidates.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictiveStats {
    pub transitions_recorded: u64,
    pub preloads_started: u64,
    pub preloads_skipped: u64,
    pub items_prefetched: u64,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
    pub prefetch_errors: u64,
}

impl PredictiveStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.prefetch_hits + self.prefetch_misses;
        if total == 0 {
            0.0
        } else {
            self.prefetch_hits as f32 / total as f32
        }
    }
}

/// Loads one item for prefetch; `Ok(None)` when it no longer exists
pub type Retriever =
    Arc<dyn Fn(MemoryId) -> BoxFuture<'static, Result<Option<MemoryItem>>> + Send + Sync>;

#[derive(Debug, Default)]
struct PrefetchStore {
    items: HashMap<MemoryId, MemoryItem>,
    order: VecDeque<MemoryId>,
}

impl PrefetchStore {
    fn insert(&mut self, item: MemoryItem, capacity: usize) {
        if self.items.contains_key(&item.id) {
            self.order.retain(|id| id != &item.id);
        }
        while self.items.len() >= capacity && !self.items.contains_key(&item.id) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.items.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.items.remove(id).is_some() {
            self.order.retain(|k| k != id);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: PredictiveConfig,
    transitions: RwLock<HashMap<MemoryId, VecDeque<MemoryId>>>,
    prefetched: Mutex<PrefetchStore>,
    stats: Mutex<PredictiveStats>,
}

/// Cheap to clone; clones share state
#[derive(Debug, Clone)]
pub struct PredictiveCache {
    inner: Arc<Inner>,
}

impl Default for PredictiveCache {
    fn default() -> Self {
        Self::new(PredictiveConfig::default())
    }
}

impl PredictiveCache {
    pub fn new(config: PredictiveConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transitions: RwLock::new(HashMap::new()),
                prefetched: Mutex::new(PrefetchStore::default()),
                stats: Mutex::new(PredictiveStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.inner.config
    }

    /// Record that `next` was accessed right after `current`
    pub async fn record_transition(&self, current: &str, next: &str) {
        if current.is_empty() || next.is_empty() {
            return;
        }
        {
            let mut transitions = self.inner.transitions.write().await;
            let successors = transitions.entry(current.to_string()).or_default();
            successors.push_back(next.to_string());
            while successors.len() > self.inner.config.max_successors {
                successors.pop_front();
            }
        }
        self.inner.stats.lock().await.transitions_recorded += 1;
    }

    pub async fn predict_next(&self, current: &str) -> Prediction {
        let transitions = self.inner.transitions.read().await;
        let Some(successors) = transitions.get(current) else {
            return Prediction::default();
        };

        let observations = successors.len();
        if observations < self.inner.config.min_observations {
            return Prediction {
                observations,
                ..Prediction::default()
            };
        }

        // Frequency, then most recent sighting, then id
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (pos, id) in successors.iter().enumerate() {
            let entry = counts.entry(id.as_str()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = pos;
        }
        let mut ranked: Vec<(&str, usize, usize)> =
            counts.into_iter().map(|(id, (n, last))| (id, n, last)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(b.0)));

        let top = ranked.first().map(|(_, n, _)| *n).unwrap_or(0);
        Prediction {
            candidates: ranked
                .into_iter()
                .take(self.inner.config.max_candidates)
                .map(|(id, n, _)| (id.to_string(), n))
                .collect(),
            confidence: (top as f32 / observations as f32).clamp(0.0, 1.0),
            observations,
        }
    }

    /// Fetch predicted successors of `current` in the background.
    ///
    /// Returns `None` without spawning when confidence is too low.
    pub async fn preload(&self, current: &str, retriever: Retriever) -> Option<JoinHandle<usize>> {
        let prediction = self.predict_next(current).await;
        if prediction.is_empty() || prediction.confidence < self.inner.config.min_confidence {
            self.inner.stats.lock().await.preloads_skipped += 1;
            return None;
        }
        self.inner.stats.lock().await.preloads_started += 1;

        let cache = self.clone();
        let ids = prediction.ids();
        let origin = current.to_string();
        Some(tokio::spawn(async move {
            let mut loaded = 0;
            for id in ids {
                if cache.inner.prefetched.lock().await.items.contains_key(&id) {
                    continue;
                }
                match retriever(id.clone()).await {
                    Ok(Some(item)) => {
                        cache
                            .inner
                            .prefetched
                            .lock()
                            .await
                            .insert(item, cache.inner.config.prefetch_capacity);
                        loaded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%origin, %id, error = %e, "Prefetch failed");
                        cache.inner.stats.lock().await.prefetch_errors += 1;
                    }
                }
            }
            cache.inner.stats.lock().await.items_prefetched += loaded as u64;
            tracing::trace!(%origin, loaded, "Prefetch finished");
            loaded
        }))
    }

    /// Look up a prefetched item, counting hit or miss
    pub async fn get(&self, id: &str) -> Option<MemoryItem> {
        let found = self.inner.prefetched.lock().await.items.get(id).cloned();
        let mut stats = self.inner.stats.lock().await;
        if found.is_some() {
            stats.prefetch_hits += 1;
        } else {
            stats.prefetch_misses += 1;
        }
        found
    }

    /// Drop a prefetched copy after the source changed
    pub async fn invalidate(&self, id: &str) -> bool {
        self.inner.prefetched.lock().await.remove(id)
    }

    /// Forget everything learned about an id, as key and as successor
    pub async fn forget(&self, id: &str) {
        self.invalidate(id).await;
        let mut transitions = self.inner.transitions.write().await;
        transitions.remove(id);
        for successors in transitions.values_mut() {
            successors.retain(|s| s != id);
        }
        transitions.retain(|_, successors| !successors.is_empty());
    }

    pub async fn prefetched_len(&self) -> usize {
        self.inner.prefetched.lock().await.items.len()
    }

    pub async fn stats(&self) -> PredictiveStats {
        *self.inner.stats.lock().await
    }

    pub async fn clear(&self) {
        self.inner.transitions.write().await.clear();
        *self.inner.prefetched.lock().await = PrefetchStore::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use chrono::Utc;
    use futures::FutureExt;

    fn retriever_for(items: Vec<MemoryItem>) -> Retriever {
        let items: Arc<HashMap<MemoryId, MemoryItem>> =
            Arc::new(items.into_iter().map(|i| (i.id.clone(), i)).collect());
        Arc::new(move |id: MemoryId| {
            let items = Arc::clone(&items);
            async move { Ok(items.get(&id).cloned()) }.boxed()
        })
    }

    #[tokio::test]
    async fn too_few_observations_give_no_prediction() {
        let cache = PredictiveCache::default();
        cache.record_transition("a", "b").await;
        cache.record_transition("a", "b").await;

        let prediction = cache.predict_next("a").await;
        assert!(prediction.is_empty());
        assert_eq!(prediction.confidence, 0.0);
        assert_eq!(prediction.observations, 2);
        assert!(cache.predict_next("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn candidates_ordered_by_frequency() {
        let cache = PredictiveCache::default();
        for next in ["b", "c", "b", "d", "b", "c"] {
            cache.record_transition("a", next).await;
        }

        let prediction = cache.predict_next("a").await;
        assert_eq!(prediction.ids(), vec!["b", "c", "d"]);
        assert_eq!(prediction.candidates[0].1, 3);
        assert!((prediction.confidence - 0.5).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&prediction.confidence));
    }

    #[tokio::test]
    async fn successor_window_and_candidate_limit() {
        let cache = PredictiveCache::new(PredictiveConfig {
            max_successors: 10,
            ..PredictiveConfig::default()
        });
        for i in 0..20 {
            cache.record_transition("a", &format!("n{i}")).await;
        }
        let prediction = cache.predict_next("a").await;
        assert_eq!(prediction.observations, 10);
        assert_eq!(prediction.candidates.len(), 5);
        assert!(!prediction.ids().contains(&"n0".to_string()));
    }

    #[tokio::test]
    async fn preload_fills_prefetch_cache() {
        let now = Utc::now();
        let next = MemoryItem::new("p1", "next item".into(), Tier::Short, 0.5, now);
        let cache = PredictiveCache::default();
        for _ in 0..3 {
            cache.record_transition("current", &next.id).await;
        }

        let handle = cache
            .preload("current", retriever_for(vec![next.clone()]))
            .await
            .expect("confidence is 1.0");
        assert_eq!(handle.await.unwrap(), 1);

        assert_eq!(cache.get(&next.id).await, Some(next.clone()));
        assert!(cache.invalidate(&next.id).await);
        assert_eq!(cache.get(&next.id).await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.preloads_started, 1);
        assert_eq!(stats.prefetch_hits, 1);
        assert_eq!(stats.prefetch_misses, 1);
    }

    #[tokio::test]
    async fn preload_skipped_on_low_confidence() {
        let cache = PredictiveCache::default();
        for next in ["b", "c", "d", "e"] {
            cache.record_transition("a", next).await;
        }
        assert!(cache.predict_next("a").await.confidence < 0.3);
        assert!(cache.preload("a", retriever_for(Vec::new())).await.is_none());
        assert_eq!(cache.stats().await.preloads_skipped, 1);
    }

    #[test]
    fn prefetch_store_is_bounded() {
        let now = Utc::now();
        let mut store = PrefetchStore::default();
        for i in 0..5 {
            store.insert(
                MemoryItem::new("p1", format!("item {i}").into(), Tier::Short, 0.5, now),
                3,
            );
        }
        assert_eq!(store.items.len(), 3);
        assert_eq!(store.order.len(), 3);
    }
}
