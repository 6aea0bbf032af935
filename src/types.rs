//! Memory items, tiers and content payloads

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for memory items (deterministic over owner + content)
pub type MemoryId = String;

/// Persona / owner identifier
pub type OwnerId = String;

/// Namespace for deriving item ids
const MEMORY_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d7e_83a4_4b9f_9e35_0d2a_c4b8_71e5);

/// Volatility tier of a memory item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Short,
    Medium,
    Long,
}

impl Tier {
    /// All tiers, most volatile first
    pub const ALL: &[Tier] = &[Tier::Short, Tier::Medium, Tier::Long];

    /// The tier an item moves to on promotion
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Short => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Long),
            Tier::Long => None,
        }
    }

    pub fn default_capacity(&self) -> usize {
        match self {
            Tier::Short => 100,
            Tier::Medium => 500,
            Tier::Long => 2000,
        }
    }

    /// Half-life used by the priority time-decay term
    pub fn default_half_life(&self) -> Duration {
        match self {
            Tier::Short => Duration::hours(1),
            Tier::Medium => Duration::days(7),
            Tier::Long => Duration::days(365),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Short => "short",
            Tier::Medium => "medium",
            Tier::Long => "long",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(Tier::Short),
            "medium" => Ok(Tier::Medium),
            "long" => Ok(Tier::Long),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Payload of a memory item.
///
/// Callers hand over differently shaped content; each known shape gets its
/// own variant so scoring and size checks can match on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemoryContent {
    /// Free text
    Text(String),
    /// An ordered list of entries (steps, findings, bullet points)
    List(Vec<String>),
    /// Key/value document
    Structured(BTreeMap<String, serde_json::Value>),
}

impl MemoryContent {
    pub fn text(s: impl Into<String>) -> Self {
        MemoryContent::Text(s.into())
    }

    /// True when there is nothing worth remembering
    pub fn is_empty(&self) -> bool {
        match self {
            MemoryContent::Text(s) => s.trim().is_empty(),
            MemoryContent::List(entries) => entries.iter().all(|e| e.trim().is_empty()),
            MemoryContent::Structured(map) => map.is_empty(),
        }
    }

    /// Flattened text used for keyword matching and lexical features
    pub fn searchable_text(&self) -> String {
        match self {
            MemoryContent::Text(s) => s.clone(),
            MemoryContent::List(entries) => entries.join("\n"),
            MemoryContent::Structured(map) => map
                .iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{k}: {s}"),
                    other => format!("{k}: {other}"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Canonical serialized form; stable for equal content
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.searchable_text())
    }

    /// Serialized size in bytes
    pub fn size_bytes(&self) -> usize {
        self.canonical().len()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MemoryContent::Text(_) => "text",
            MemoryContent::List(_) => "list",
            MemoryContent::Structured(_) => "structured",
        }
    }
}

impl From<&str> for MemoryContent {
    fn from(s: &str) -> Self {
        MemoryContent::Text(s.to_string())
    }
}

impl From<String> for MemoryContent {
    fn from(s: String) -> Self {
        MemoryContent::Text(s)
    }
}

impl From<Vec<String>> for MemoryContent {
    fn from(entries: Vec<String>) -> Self {
        MemoryContent::List(entries)
    }
}

/// Derive the id of an item from its owner and content
pub fn memory_id(owner: &str, content: &MemoryContent) -> MemoryId {
    let mut name = Vec::with_capacity(owner.len() + 1 + 64);
    name.extend_from_slice(owner.as_bytes());
    name.push(0);
    name.extend_from_slice(content.canonical().as_bytes());
    Uuid::new_v5(&MEMORY_ID_NAMESPACE, &name).to_string()
}

/// A remembered item owned by one persona
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    /// Deterministic id over (owner, content)
    pub id: MemoryId,
    /// Owning persona
    pub owner: OwnerId,
    /// Current tier
    pub tier: Tier,
    /// Payload
    pub content: MemoryContent,
    /// Importance score (0.0 - 1.0)
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Successful recalls of this item
    pub access_count: u64,
    pub tags: BTreeSet<String>,
    /// Item is removed by the next consolidation pass after this instant
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MemoryItem {
    pub fn new(
        owner: impl Into<OwnerId>,
        content: MemoryContent,
        tier: Tier,
        importance: f32,
        now: DateTime<Utc>,
    ) -> Self {
        let owner = owner.into();
        Self {
            id: memory_id(&owner, &content),
            owner,
            tier,
            content,
            importance: clamp_importance(importance),
            created_at: now,
            last_access: now,
            access_count: 0,
            tags: BTreeSet::new(),
            expires_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set importance, clamped to [0, 1]
    pub fn set_importance(&mut self, importance: f32) {
        self.importance = clamp_importance(importance);
    }

    /// Count a successful recall
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_access = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Approximate in-memory footprint used for byte budgets
    pub fn size_bytes(&self) -> usize {
        let tags: usize = self.tags.iter().map(String::len).sum();
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.content.size_bytes() + self.id.len() + self.owner.len() + tags + metadata
    }
}

/// Clamp to [0, 1]; NaN collapses to 0
pub fn clamp_importance(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
