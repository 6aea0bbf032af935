//! # Strata - tiered per-persona memory for multi-agent assistants
//!
//! Each owner (persona) gets three capacity-bounded tiers of memory with
//! priority-based eviction and rule-based promotion, backed by a multi-level
//! cache, anomaly detection and predictive prefetch.
//!
//! [`MemoryEngine`] is the context object: open it once at startup, pass it
//! (or its [`MemoryOrchestrator`]) to whatever needs memory, and call
//! [`MemoryEngine::shutdown`] on the way out.

pub mod anomaly;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persona;
pub mod predictive;
pub mod scoring;
pub mod similarity;
pub mod store;
pub mod tier_store;
pub mod types;
pub mod workers;

pub use anomaly::{
    AnomalyContext, AnomalyDetector, AnomalyReport, AnomalyRule, AnomalyThresholds, AnomalyType,
    RecommendedAction, ScanReport,
};
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheKey, CacheLevel, CacheManager, CacheSetOptions,
    CacheStats, EvictionPolicy, InProcessRemoteCache, Invalidation, L1Cache, LevelStats,
    RemoteCache,
};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use codec::{CacheEnvelope, CACHE_SCHEMA_VERSION};
pub use config::{EngineConfig, EngineConfigBuilder, WorkerConfig};
pub use consolidation::{
    ConsolidationConfig, ConsolidationConfigBuilder, ConsolidationError, ConsolidationReport,
    ConsolidationStage, PromotionConsolidator,
};
pub use error::{MemoryError, Result};
pub use events::{
    EngineEvent, EventBus, EventConfig, EventFilter, EventStats, EventType, EvictionCause,
    FilteredSubscriber,
};
pub use orchestrator::{
    Bottleneck, EngineStatistics, MemoryOrchestrator, OwnerStatistics, RecallQuery,
    RememberRequest, SharedPattern, TierStatistics,
};
pub use predictive::{PredictiveCache, PredictiveConfig, PredictiveStats, Prediction};
pub use scoring::{
    ImportanceFeature, ImportanceScorer, ImportanceWeights, PersonaProfile, ScoringConfig,
};
pub use similarity::{KeywordOverlapOracle, SimilarityOracle};
pub use store::{LongTermStore, StorageConfig};
pub use tier_store::{TierConfig, TierSettings, TierStore};
pub use types::{MemoryContent, MemoryId, MemoryItem, OwnerId, Tier};
pub use workers::{MaintenanceJob, MaintenanceSupervisor, WorkerStats};

use orchestrator::OrchestratorParts;
use std::sync::Arc;

/// The engine and everything it owns
pub struct MemoryEngine {
    config: EngineConfig,
    orchestrator: Arc<MemoryOrchestrator>,
    cache: Arc<CacheManager>,
    long_store: LongTermStore,
    workers: Option<MaintenanceSupervisor>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("data_dir", &self.config.storage.data_dir)
            .field("workers", &self.workers.is_some())
            .finish()
    }
}

impl MemoryEngine {
    /// Open storage, build every component and register configured personas
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_clock(config, system_clock()).await
    }

    /// Like [`open`](Self::open) with an explicit clock
    pub async fn open_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let pool = store::open_pool(&config.storage).await?;
        let long_store = LongTermStore::new(pool.clone());
        let cache = Arc::new(
            CacheManager::new(config.cache.clone(), Arc::clone(&clock)).with_disk(pool),
        );
        let events = EventBus::new(&config.events);

        let orchestrator = Arc::new(MemoryOrchestrator::new(OrchestratorParts {
            scorer: ImportanceScorer::new(config.scoring.clone()),
            tiers: config.tiers.clone(),
            consolidator: PromotionConsolidator::new(
                config.consolidation.clone(),
                Arc::clone(&clock),
            ),
            cache: Arc::clone(&cache),
            predictive: PredictiveCache::new(config.predictive.clone()),
            detector: Arc::new(AnomalyDetector::new(config.anomaly.clone())),
            long_store: Some(long_store.clone()),
            events,
            clock,
            recent_window: config.recent_access_window,
            auto_register: config.auto_register_owners,
        }));

        for profile in &config.personas {
            orchestrator.register_persona(profile.clone()).await?;
        }

        let workers = config
            .workers
            .enabled
            .then(|| MaintenanceSupervisor::start(Arc::clone(&orchestrator), &config.workers));

        tracing::info!(
            data_dir = ?config.storage.data_dir,
            personas = config.personas.len(),
            workers = workers.is_some(),
            "Memory engine opened"
        );

        Ok(Self {
            config,
            orchestrator,
            cache,
            long_store,
            workers,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<MemoryOrchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &EventBus {
        self.orchestrator.events()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn long_term_store(&self) -> &LongTermStore {
        &self.long_store
    }

    /// Background worker, when enabled
    pub fn workers(&self) -> Option<&MaintenanceSupervisor> {
        self.workers.as_ref()
    }

    /// Stop background work and close storage
    pub async fn shutdown(mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
        self.long_store.pool().close().await;
        tracing::info!("Memory engine shut down");
    }
}
