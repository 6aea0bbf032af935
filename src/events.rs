//! Engine events
//!
//! A publish-subscribe bus carrying structured notifications about memory
//! lifecycle changes, so callers can observe evictions, promotions and
//! worker failures without polling.
//!
//! Example:
//! ```rust,no_run
//! use strata::{EngineConfig, EngineEvent, MemoryEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = MemoryEngine::open(EngineConfig::default()).await.unwrap();
//!     let mut events = engine.events().subscribe();
//!
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let EngineEvent::Promoted { item_id, to, .. } = event {
//!                 println!("{item_id} promoted to {to}");
//!             }
//!         }
//!     });
//! }
//! ```

use crate::anomaly::AnomalyType;
use crate::types::{MemoryId, OwnerId, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Why an item left its tier without being promoted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionCause {
    Capacity,
    ByteBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Remembered {
        owner: OwnerId,
        item_id: MemoryId,
        tier: Tier,
        importance: f32,
        /// The id already existed and the record was updated in place
        updated: bool,
        timestamp: DateTime<Utc>,
    },

    Recalled {
        owner: OwnerId,
        results: usize,
        cache_hit: bool,
        timestamp: DateTime<Utc>,
    },

    Forgotten {
        owner: OwnerId,
        item_id: MemoryId,
        timestamp: DateTime<Utc>,
    },

    Evicted {
        owner: OwnerId,
        item_id: MemoryId,
        tier: Tier,
        cause: EvictionCause,
        timestamp: DateTime<Utc>,
    },

    Promoted {
        owner: OwnerId,
        item_id: MemoryId,
        from: Tier,
        to: Tier,
        importance: f32,
        timestamp: DateTime<Utc>,
    },

    Expired {
        owner: OwnerId,
        item_id: MemoryId,
        tier: Tier,
        timestamp: DateTime<Utc>,
    },

    Shared {
        from_owner: OwnerId,
        to_owner: OwnerId,
        source_id: MemoryId,
        copy_id: MemoryId,
        timestamp: DateTime<Utc>,
    },

    ConsolidationCompleted {
        owner: OwnerId,
        promoted: usize,
        expired: usize,
        errors: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    AnomalyDetected {
        owner: OwnerId,
        item_id: MemoryId,
        anomaly_type: AnomalyType,
        score: f32,
        timestamp: DateTime<Utc>,
    },

    WorkerFailed {
        job: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::Remembered { timestamp, .. }
            | EngineEvent::Recalled { timestamp, .. }
            | EngineEvent::Forgotten { timestamp, .. }
            | EngineEvent::Evicted { timestamp, .. }
            | EngineEvent::Promoted { timestamp, .. }
            | EngineEvent::Expired { timestamp, .. }
            | EngineEvent::Shared { timestamp, .. }
            | EngineEvent::ConsolidationCompleted { timestamp, .. }
            | EngineEvent::AnomalyDetected { timestamp, .. }
            | EngineEvent::WorkerFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Owner the event concerns; sharing concerns the receiving owner
    pub fn owner(&self) -> Option<&str> {
        match self {
            EngineEvent::Remembered { owner, .. }
            | EngineEvent::Recalled { owner, .. }
            | EngineEvent::Forgotten { owner, .. }
            | EngineEvent::Evicted { owner, .. }
            | EngineEvent::Promoted { owner, .. }
            | EngineEvent::Expired { owner, .. }
            | EngineEvent::ConsolidationCompleted { owner, .. }
            | EngineEvent::AnomalyDetected { owner, .. } => Some(owner),
            EngineEvent::Shared { to_owner, .. } => Some(to_owner),
            EngineEvent::WorkerFailed { .. } => None,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.into()
    }
}

/// Event kinds, for filtering and counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Remembered,
    Recalled,
    Forgotten,
    Evicted,
    Promoted,
    Expired,
    Shared,
    ConsolidationCompleted,
    AnomalyDetected,
    WorkerFailed,
}

impl From<&EngineEvent> for EventType {
    fn from(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Remembered { .. } => EventType::Remembered,
            EngineEvent::Recalled { .. } => EventType::Recalled,
            EngineEvent::Forgotten { .. } => EventType::Forgotten,
            EngineEvent::Evicted { .. } => EventType::Evicted,
            EngineEvent::Promoted { .. } => EventType::Promoted,
            EngineEvent::Expired { .. } => EventType::Expired,
            EngineEvent::Shared { .. } => EventType::Shared,
            EngineEvent::ConsolidationCompleted { .. } => EventType::ConsolidationCompleted,
            EngineEvent::AnomalyDetected { .. } => EventType::AnomalyDetected,
            EngineEvent::WorkerFailed { .. } => EventType::WorkerFailed,
        }
    }
}

/// Subscription filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub owners: Option<Vec<OwnerId>>,
    pub event_types: Option<Vec<EventType>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owners.get_or_insert_with(Vec::new).push(owner.into());
        self
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_types.get_or_insert_with(Vec::new).push(event_type);
        self
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type()) {
                return false;
            }
        }
        if let Some(owners) = &self.owners {
            match event.owner() {
                Some(owner) if owners.iter().any(|o| o == owner) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast buffer; slow subscribers lag past this
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_emitted: u64,
    pub last_emitted: Option<DateTime<Utc>>,
    pub by_type: HashMap<EventType, u64>,
}

impl EventStats {
    pub fn count(&self, event_type: EventType) -> u64 {
        self.by_type.get(&event_type).copied().unwrap_or(0)
    }
}

/// Broadcast bus shared by every engine component
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventBus {
    pub fn new(config: &EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        FilteredSubscriber {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Publish an event. Having no subscribers is fine.
    pub async fn emit(&self, event: EngineEvent) {
        {
            let mut stats = self.stats.write().await;
            stats.total_emitted += 1;
            stats.last_emitted = Some(event.timestamp());
            *stats.by_type.entry(event.event_type()).or_insert(0) += 1;
        }

        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub async fn stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventConfig::default())
    }
}

/// Receiver that skips events not matching its filter
pub struct FilteredSubscriber {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
}

impl FilteredSubscriber {
    /// Next matching event; `None` once the bus is gone.
    /// Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forgotten(owner: &str) -> EngineEvent {
        EngineEvent::Forgotten {
            owner: owner.into(),
            item_id: "id-1".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn emit_reaches_subscribers_and_counts() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = forgotten("p1");
        bus.emit(event.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), event);

        let stats = bus.stats().await;
        assert_eq!(stats.total_emitted, 1);
        assert_eq!(stats.count(EventType::Forgotten), 1);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(forgotten("p1")).await;
        assert_eq!(bus.stats().await.total_emitted, 1);
    }

    #[tokio::test]
    async fn filtered_subscriber_skips_other_owners() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_filtered(
            EventFilter::new()
                .with_owner("p2")
                .with_event_type(EventType::Forgotten),
        );

        bus.emit(forgotten("p1")).await;
        bus.emit(EngineEvent::WorkerFailed {
            job: "consolidate".into(),
            error: "boom".into(),
            timestamp: Utc::now(),
        })
        .await;
        bus.emit(forgotten("p2")).await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.owner(), Some("p2"));
        assert!(rx.try_recv().is_none());
    }
}
