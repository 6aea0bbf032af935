//! Engine configuration
//!
//! Every section has defaults, so a JSON file only needs the fields it changes:
//!
//! ```json
//! {
//!   "storage": { "data_dir": "./strata-data" },
//!   "cache": { "max_entries": 5000, "eviction_policy": "lfu" },
//!   "personas": [{ "name": "reviewer", "domain_keywords": ["lint", "review"] }]
//! }
//! ```

use crate::anomaly::AnomalyThresholds;
use crate::cache::CacheConfig;
use crate::consolidation::ConsolidationConfig;
use crate::error::{MemoryError, Result};
use crate::events::EventConfig;
use crate::predictive::PredictiveConfig;
use crate::scoring::{PersonaProfile, ScoringConfig};
use crate::store::StorageConfig;
use crate::tier_store::TierConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Background maintenance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Start the maintenance worker with the engine
    pub enabled: bool,
    /// Bounded job queue size
    pub channel_capacity: usize,
    /// Periodic consolidation of every owner; `None` disables the schedule
    pub consolidation_interval_secs: Option<u64>,
    /// Periodic anomaly scan of every owner; `None` disables the schedule
    pub anomaly_scan_interval_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 64,
            consolidation_interval_secs: Some(15 * 60),
            anomaly_scan_interval_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn consolidation_interval(&self) -> Option<Duration> {
        self.consolidation_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn anomaly_scan_interval(&self) -> Option<Duration> {
        self.anomaly_scan_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub tiers: TierConfig,
    pub scoring: ScoringConfig,
    pub cache: CacheConfig,
    pub consolidation: ConsolidationConfig,
    pub anomaly: AnomalyThresholds,
    pub predictive: PredictiveConfig,
    pub workers: WorkerConfig,
    pub events: EventConfig,
    /// Owners registered at startup
    pub personas: Vec<PersonaProfile>,
    /// Recent accesses remembered per owner for frequency scoring
    pub recent_access_window: usize,
    /// Register unknown owners on first `remember` instead of rejecting them
    pub auto_register_owners: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            tiers: TierConfig::default(),
            scoring: ScoringConfig::default(),
            cache: CacheConfig::default(),
            consolidation: ConsolidationConfig::default(),
            anomaly: AnomalyThresholds::default(),
            predictive: PredictiveConfig::default(),
            workers: WorkerConfig::default(),
            events: EventConfig::default(),
            personas: Vec::new(),
            recent_access_window: 50,
            auto_register_owners: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            MemoryError::Configuration(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        self.scoring.validate()?;
        self.cache.validate()?;
        self.consolidation.validate()?;
        self.anomaly.validate()?;
        self.predictive.validate()?;
        for persona in &self.personas {
            persona.validate()?;
        }
        if self.workers.enabled && self.workers.channel_capacity == 0 {
            return Err(MemoryError::Configuration(
                "worker channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for engine config
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage = StorageConfig::at(dir);
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageConfig::in_memory();
        self
    }

    pub fn tiers(mut self, tiers: TierConfig) -> Self {
        self.config.tiers = tiers;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.config.scoring = scoring;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn consolidation(mut self, consolidation: ConsolidationConfig) -> Self {
        self.config.consolidation = consolidation;
        self
    }

    pub fn anomaly(mut self, thresholds: AnomalyThresholds) -> Self {
        self.config.anomaly = thresholds;
        self
    }

    pub fn predictive(mut self, predictive: PredictiveConfig) -> Self {
        self.config.predictive = predictive;
        self
    }

    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.config.workers = workers;
        self
    }

    /// Disable the background worker entirely
    pub fn without_workers(mut self) -> Self {
        self.config.workers.enabled = false;
        self
    }

    pub fn persona(mut self, profile: PersonaProfile) -> Self {
        self.config.personas.push(profile);
        self
    }

    pub fn recent_access_window(mut self, window: usize) -> Self {
        self.config.recent_access_window = window;
        self
    }

    pub fn auto_register_owners(mut self, enabled: bool) -> Self {
        self.config.auto_register_owners = enabled;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
