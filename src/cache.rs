//! # Caching Layer - multi-level cache for derived results
//!
//! Levels, in lookup order:
//! - fast: in-process, bounded by entry count and byte budget, pluggable eviction
//! - disk: SQLite table of encoded envelopes, TTL re-checked on read
//! - distributed: optional [`RemoteCache`] backend, best-effort only
//!
//! A hit on a slower level is copied into every faster level. Slow levels are
//! bounded by a timeout; a timeout or backend error is logged and counted as a miss.

use crate::clock::Clock;
use crate::codec::{self, CacheEnvelope};
use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

const CACHE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x1d4e_9a20_5c7b_4f13_8b6d_e2f0_a937_c458);

/// Unique cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Stable fingerprint of a request made of several parts
    pub fn fingerprint(namespace: &str, parts: &[&str]) -> Self {
        let joined = parts.join("\u{1f}");
        let digest = Uuid::new_v5(&CACHE_KEY_NAMESPACE, joined.as_bytes());
        Self(format!("{namespace}:{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    Fast,
    Disk,
    Distributed,
}

impl CacheLevel {
    pub const ALL: &[CacheLevel] = &[CacheLevel::Fast, CacheLevel::Disk, CacheLevel::Distributed];
}

/// Victim selection for the fast level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used, LRU among equals
    Lfu,
    /// Oldest insertion
    Fifo,
    /// Soonest expiry; entries without a TTL go last
    Ttl,
}

/// Counters for one level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
    pub errors: u64,
}

impl LevelStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// `get` calls
    pub total_requests: u64,
    /// `get` calls answered by any level
    pub hits: u64,
    pub misses: u64,
    pub fast: LevelStats,
    pub disk: LevelStats,
    pub distributed: LevelStats,
    pub fast_entries: usize,
    pub fast_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f32 / self.total_requests as f32
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fast level entry limit
    pub max_entries: usize,
    /// Fast level byte budget
    pub max_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    /// Applied when `set` gives no TTL; `None` means entries never expire
    pub default_ttl_secs: Option<u64>,
    /// Use the SQLite-backed disk level when a pool is available
    pub disk_enabled: bool,
    /// Upper bound on any single disk or distributed call
    pub slow_level_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            default_ttl_secs: Some(30 * 60),
            disk_enabled: true,
            slow_level_timeout_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn slow_level_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_level_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 || self.max_bytes == 0 {
            return Err(MemoryError::Configuration(
                "cache max_entries and max_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Per-write options
#[derive(Debug, Clone, Default)]
pub struct CacheSetOptions {
    /// `None` falls back to the configured default; zero means no expiry
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub owner: Option<String>,
    pub workflow: Option<String>,
    /// Levels to write; empty means every configured level
    pub levels: Vec<CacheLevel>,
}

impl CacheSetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
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

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn levels(mut self, levels: &[CacheLevel]) -> Self {
        self.levels = levels.to_vec();
        self
    }

    fn wants(&self, level: CacheLevel) -> bool {
        self.levels.is_empty() || self.levels.contains(&level)
    }
}

/// Which entries to drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(CacheKey),
    /// Entries carrying any of these tags
    Tags(Vec<String>),
    Owner(String),
    Workflow(String),
}

impl Invalidation {
    pub fn matches(&self, key: &CacheKey, envelope: &CacheEnvelope) -> bool {
        match self {
            Invalidation::Key(k) => k == key,
            Invalidation::Tags(tags) => envelope.tags.iter().any(|t| tags.contains(t)),
            Invalidation::Owner(owner) => envelope.owner.as_deref() == Some(owner.as_str()),
            Invalidation::Workflow(wf) => envelope.workflow.as_deref() == Some(wf.as_str()),
        }
    }
}

// ─── Fast level ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct L1Entry {
    envelope: CacheEnvelope,
    size: usize,
    inserted_seq: u64,
    last_access_seq: u64,
    access_count: u64,
}

#[derive(Debug, Default)]
struct L1State {
    entries: HashMap<CacheKey, L1Entry>,
    bytes_used: usize,
    seq: u64,
    stats: LevelStats,
}

impl L1State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &CacheKey) -> Option<L1Entry> {
        let entry = self.entries.remove(key)?;
        self.bytes_used = self.bytes_used.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now_ms: i64) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.envelope.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<CacheKey> {
        let entries = self.entries.iter();
        let chosen = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| e.last_access_seq),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.access_count, e.last_access_seq)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| e.inserted_seq),
            EvictionPolicy::Ttl => entries.min_by_key(|(_, e)| {
                (e.envelope.expires_at_ms.unwrap_or(i64::MAX), e.inserted_seq)
            }),
        };
        chosen.map(|(k, _)| k.clone())
    }
}

/// L1 in-memory cache. One lock guards entries and counters together so
/// evictions are never double-counted.
pub struct L1Cache {
    state: Mutex<L1State>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl L1Cache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(L1State::default()),
            config,
            clock,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEnvelope> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(key) {
            Some(entry) => entry.envelope.is_expired(now_ms),
            None => {
                state.stats.misses += 1;
                return None;
            }
        };
        if expired {
            state.remove(key);
            state.stats.misses += 1;
            return None;
        }

        let seq = state.next_seq();
        state.stats.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_access_seq = seq;
        entry.access_count += 1;
        Some(entry.envelope.clone())
    }

    /// Store an entry, evicting per policy until it fits.
    /// Returns false when the entry alone exceeds the byte budget.
    pub async fn put(&self, key: CacheKey, envelope: CacheEnvelope, size: usize) -> bool {
        if size > self.config.max_bytes {
            tracing::debug!(%key, size, "Entry larger than fast cache budget, skipping");
            return false;
        }

        let now_ms = self.clock.now().timestamp_millis();
        let mut state = self.state.lock().await;
        state.remove(&key);

        let mut purged = false;
        while state.entries.len() >= self.config.max_entries
            || state.bytes_used + size > self.config.max_bytes
        {
            if !purged {
                purged = true;
                let n = state.purge_expired(now_ms);
                state.stats.evictions += n as u64;
                continue;
            }
            match state.victim(self.config.eviction_policy) {
                Some(victim) => {
                    state.remove(&victim);
                    state.stats.evictions += 1;
                    tracing::trace!(key = %victim, "Evicted from fast cache");
                }
                None => break,
            }
        }

        let seq = state.next_seq();
        state.bytes_used += size;
        state.stats.writes += 1;
        state.entries.insert(
            key,
            L1Entry {
                envelope,
                size,
                inserted_seq: seq,
                last_access_seq: seq,
                access_count: 0,
            },
        );
        true
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        let now_ms = self.clock.now().timestamp_millis();
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .is_some_and(|e| !e.envelope.is_expired(now_ms))
    }

    pub async fn invalidate(&self, selector: &Invalidation) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, e)| selector.matches(k, &e.envelope))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let mut state = self.state.lock().await;
        let n = state.purge_expired(now_ms);
        state.stats.evictions += n as u64;
        n
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.bytes_used = 0;
    }

    pub async fn stats(&self) -> (LevelStats, usize, usize) {
        let state = self.state.lock().await;
        (state.stats, state.entries.len(), state.bytes_used)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ─── Disk level ───────────────────────────────────────────────────────────────

/// SQLite-backed cache level storing encoded envelopes
#[derive(Clone)]
pub struct DiskCache {
    pool: SqlitePool,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl DiskCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read an entry; expired rows are deleted and reported as absent
    pub async fn get(&self, key: &CacheKey, now_ms: i64) -> Result<Option<CacheEnvelope>> {
        let row = sqlx::query("SELECT payload, expires_at_ms FROM cache_entries WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at_ms: Option<i64> = row.try_get("expires_at_ms")?;
        if expires_at_ms.is_some_and(|exp| exp <= now_ms) {
            self.delete(key).await?;
            return Ok(None);
        }

        let payload: Vec<u8> = row.try_get("payload")?;
        let envelope = codec::decode(&payload)?;
        if envelope.is_expired(now_ms) {
            self.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    pub async fn put(&self, key: &CacheKey, envelope: &CacheEnvelope, payload: &[u8]) -> Result<()> {
        let tags = serde_json::to_string(&envelope.tags)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, payload, size_bytes, expires_at_ms, tags, owner, workflow, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                size_bytes = excluded.size_bytes,
                expires_at_ms = excluded.expires_at_ms,
                tags = excluded.tags,
                owner = excluded.owner,
                workflow = excluded.workflow,
                created_at_ms = excluded.created_at_ms
            "#,
        )
        .bind(key.as_str())
        .bind(payload)
        .bind(payload.len() as i64)
        .bind(envelope.expires_at_ms)
        .bind(tags)
        .bind(envelope.owner.as_deref())
        .bind(envelope.workflow.as_deref())
        .bind(envelope.created_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn invalidate(&self, selector: &Invalidation) -> Result<u64> {
        let result = match selector {
            Invalidation::Key(key) => {
                return Ok(u64::from(self.delete(key).await?));
            }
            Invalidation::Owner(owner) => {
                sqlx::query("DELETE FROM cache_entries WHERE owner = ?")
                    .bind(owner)
                    .execute(&self.pool)
                    .await?
            }
            Invalidation::Workflow(workflow) => {
                sqlx::query("DELETE FROM cache_entries WHERE workflow = ?")
                    .bind(workflow)
                    .execute(&self.pool)
                    .await?
            }
            Invalidation::Tags(tags) => {
                let rows = sqlx::query("SELECT key, tags FROM cache_entries WHERE tags != '[]'")
                    .fetch_all(&self.pool)
                    .await?;
                let mut removed = 0;
                for row in &rows {
                    let key: String = row.try_get("key")?;
                    let entry_tags: String = row.try_get("tags")?;
                    let entry_tags: Vec<String> =
                        serde_json::from_str(&entry_tags).unwrap_or_default();
                    if entry_tags.iter().any(|t| tags.contains(t))
                        && self.delete(&CacheKey(key)).await?
                    {
                        removed += 1;
                    }
                }
                return Ok(removed);
            }
        };
        Ok(result.rows_affected())
    }

    pub async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ─── Distributed level ────────────────────────────────────────────────────────

/// A networked or shared cache. Failures are tolerated by the caller.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &CacheKey, payload: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn invalidate(&self, selector: &Invalidation) -> Result<u64>;
    async fn clear(&self) -> Result<()>;
}

/// Remote cache shared by every engine in the process holding a clone.
///
/// Entries are stored encoded, exactly as a networked backend would hold them.
#[derive(Debug, Clone, Default)]
pub struct InProcessRemoteCache {
    entries: Arc<RwLock<HashMap<CacheKey, Vec<u8>>>>,
}

impl InProcessRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RemoteCache for InProcessRemoteCache {
    fn backend_name(&self) -> &'static str {
        "in-process"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &CacheKey, payload: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        self.entries.write().await.insert(key.clone(), payload);
        Ok(())
    }

    async fn invalidate(&self, selector: &Invalidation) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, payload| match codec::decode(payload) {
            Ok(envelope) => !selector.matches(key, &envelope),
            Err(_) => true,
        });
        Ok((before - entries.len()) as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SlowLevelCounters {
    disk: LevelStats,
    distributed: LevelStats,
    total_requests: u64,
    hits: u64,
}

/// Main cache manager
pub struct CacheManager {
    l1: L1Cache,
    disk: Option<DiskCache>,
    remote: Option<Arc<dyn RemoteCache>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    counters: Mutex<SlowLevelCounters>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("disk", &self.disk.is_some())
            .field("remote", &self.remote.as_ref().map(|r| r.backend_name()))
            .finish()
    }
}

enum SlowOutcome<T> {
    Done(T),
    Failed(String),
}

impl CacheManager {
    /// Fast level only
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            l1: L1Cache::new(config.clone(), Arc::clone(&clock)),
            disk: None,
            remote: None,
            config,
            clock,
            counters: Mutex::new(SlowLevelCounters::default()),
        }
    }

    /// Attach the disk level (ignored when disabled in config)
    pub fn with_disk(mut self, pool: SqlitePool) -> Self {
        if self.config.disk_enabled {
            self.disk = Some(DiskCache::new(pool));
        }
        self
    }

    /// Attach a distributed level
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn bounded<T, F>(&self, fut: F) -> SlowOutcome<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.slow_level_timeout(), fut).await {
            Ok(Ok(value)) => SlowOutcome::Done(value),
            Ok(Err(e)) => SlowOutcome::Failed(e.to_string()),
            Err(_) => SlowOutcome::Failed(format!(
                "timed out after {}ms",
                self.config.slow_level_timeout_ms
            )),
        }
    }

    /// Look up an envelope, checking levels in order and back-filling faster levels
    pub async fn get_envelope(&self, key: &CacheKey) -> Option<CacheEnvelope> {
        let found = self.lookup(key).await;
        let mut counters = self.counters.lock().await;
        counters.total_requests += 1;
        if found.is_some() {
            counters.hits += 1;
        }
        found
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEnvelope> {
        if let Some(envelope) = self.l1.get(key).await {
            return Some(envelope);
        }

        let now_ms = self.now_ms();

        if let Some(disk) = &self.disk {
            match self.bounded(disk.get(key, now_ms)).await {
                SlowOutcome::Done(Some(envelope)) => {
                    self.counters.lock().await.disk.hits += 1;
                    self.fill_fast(key, &envelope).await;
                    return Some(envelope);
                }
                SlowOutcome::Done(None) => self.counters.lock().await.disk.misses += 1,
                SlowOutcome::Failed(reason) => {
                    tracing::warn!(%key, %reason, "Disk cache read failed, treating as miss");
                    let mut counters = self.counters.lock().await;
                    counters.disk.errors += 1;
                    counters.disk.misses += 1;
                }
            }
        }

        if let Some(remote) = &self.remote {
            match self.bounded(remote.get(key)).await {
                SlowOutcome::Done(Some(payload)) => match codec::decode(&payload) {
                    Ok(envelope) if !envelope.is_expired(now_ms) => {
                        self.counters.lock().await.distributed.hits += 1;
                        self.fill_fast(key, &envelope).await;
                        if let Some(disk) = &self.disk {
                            if let SlowOutcome::Failed(reason) =
                                self.bounded(disk.put(key, &envelope, &payload)).await
                            {
                                tracing::warn!(%key, %reason, "Disk back-fill failed");
                                self.counters.lock().await.disk.errors += 1;
                            }
                        }
                        return Some(envelope);
                    }
                    Ok(_) => self.counters.lock().await.distributed.misses += 1,
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "Undecodable distributed cache entry");
                        let mut counters = self.counters.lock().await;
                        counters.distributed.errors += 1;
                        counters.distributed.misses += 1;
                    }
                },
                SlowOutcome::Done(None) => self.counters.lock().await.distributed.misses += 1,
                SlowOutcome::Failed(reason) => {
                    tracing::warn!(
                        %key,
                        backend = remote.backend_name(),
                        %reason,
                        "Distributed cache read failed, treating as miss"
                    );
                    let mut counters = self.counters.lock().await;
                    counters.distributed.errors += 1;
                    counters.distributed.misses += 1;
                }
            }
        }

        None
    }

    async fn fill_fast(&self, key: &CacheKey, envelope: &CacheEnvelope) {
        match codec::encode(envelope) {
            Ok(bytes) => {
                self.l1.put(key.clone(), envelope.clone(), bytes.len()).await;
            }
            Err(e) => tracing::warn!(%key, error = %e, "Could not re-encode entry for fast level"),
        }
    }

    /// Typed lookup
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let envelope = self.get_envelope(key).await?;
        match serde_json::from_value(envelope.value) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Write a value to the selected levels.
    ///
    /// Returns whether at least one level accepted it. Slow-level failures
    /// degrade to faster-level-only caching and are not returned as errors.
    pub async fn set<T: Serialize>(
        &self,
        key: CacheKey,
        value: &T,
        options: CacheSetOptions,
    ) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let now_ms = self.now_ms();
        let ttl = options
            .ttl
            .or_else(|| self.config.default_ttl_secs.map(Duration::from_secs))
            .filter(|ttl| !ttl.is_zero());
        let expires_at_ms = ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64));

        let envelope = CacheEnvelope {
            value,
            created_at_ms: now_ms,
            expires_at_ms,
            tags: options.tags.clone(),
            owner: options.owner.clone(),
            workflow: options.workflow.clone(),
        };
        let payload = codec::encode(&envelope)?;

        let mut stored = false;

        if options.wants(CacheLevel::Fast) {
            stored |= self.l1.put(key.clone(), envelope.clone(), payload.len()).await;
        }

        if options.wants(CacheLevel::Disk) {
            if let Some(disk) = &self.disk {
                match self.bounded(disk.put(&key, &envelope, &payload)).await {
                    SlowOutcome::Done(()) => {
                        self.counters.lock().await.disk.writes += 1;
                        stored = true;
                    }
                    SlowOutcome::Failed(reason) => {
                        tracing::warn!(%key, %reason, "Disk cache write failed, fast level only");
                        self.counters.lock().await.disk.errors += 1;
                    }
                }
            }
        }

        if options.wants(CacheLevel::Distributed) {
            if let Some(remote) = &self.remote {
                match self.bounded(remote.set(&key, payload, ttl)).await {
                    SlowOutcome::Done(()) => {
                        self.counters.lock().await.distributed.writes += 1;
                        stored = true;
                    }
                    SlowOutcome::Failed(reason) => {
                        tracing::warn!(
                            %key,
                            backend = remote.backend_name(),
                            %reason,
                            "Distributed cache write failed"
                        );
                        self.counters.lock().await.distributed.errors += 1;
                    }
                }
            }
        }

        Ok(stored)
    }

    /// Remove matching entries from every level; returns how many were removed
    pub async fn invalidate(&self, selector: &Invalidation) -> u64 {
        let mut removed = self.l1.invalidate(selector).await as u64;

        if let Some(disk) = &self.disk {
            match self.bounded(disk.invalidate(selector)).await {
                SlowOutcome::Done(n) => removed += n,
                SlowOutcome::Failed(reason) => {
                    tracing::warn!(?selector, %reason, "Disk cache invalidation failed");
                    self.counters.lock().await.disk.errors += 1;
                }
            }
        }

        if let Some(remote) = &self.remote {
            match self.bounded(remote.invalidate(selector)).await {
                SlowOutcome::Done(n) => removed += n,
                SlowOutcome::Failed(reason) => {
                    tracing::warn!(?selector, %reason, "Distributed cache invalidation failed");
                    self.counters.lock().await.distributed.errors += 1;
                }
            }
        }

        removed
    }

    /// Drop expired entries from the fast and disk levels
    pub async fn purge_expired(&self) -> u64 {
        let mut purged = self.l1.purge_expired().await as u64;
        if let Some(disk) = &self.disk {
            match self.bounded(disk.purge_expired(self.now_ms())).await {
                SlowOutcome::Done(n) => purged += n,
                SlowOutcome::Failed(reason) => {
                    tracing::warn!(%reason, "Disk cache purge failed");
                }
            }
        }
        purged
    }

    pub async fn clear(&self) -> Result<()> {
        self.l1.clear().await;
        if let Some(disk) = &self.disk {
            disk.clear().await?;
        }
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.clear().await {
                tracing::warn!(error = %e, "Distributed cache clear failed");
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let (fast, fast_entries, fast_bytes) = self.l1.stats().await;
        let counters = self.counters.lock().await;
        CacheStats {
            total_requests: counters.total_requests,
            hits: counters.hits,
            misses: counters.total_requests - counters.hits,
            fast,
            disk: counters.disk,
            distributed: counters.distributed,
            fast_entries,
            fast_bytes,
        }
    }
}

/// Configuration builder
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_entries(mut self, count: usize) -> Self {
        self.config.max_entries = count;
        self
    }

    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.config.max_bytes = bytes;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction_policy = policy;
        self
    }

    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.default_ttl_secs = ttl.map(|t| t.as_secs());
        self
    }

    pub fn disk_enabled(mut self, enabled: bool) -> Self {
        self.config.disk_enabled = enabled;
        self
    }

    pub fn slow_level_timeout(mut self, timeout: Duration) -> Self {
        self.config.slow_level_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{open_pool, StorageConfig};

    fn manager(config: CacheConfig, clock: &ManualClock) -> CacheManager {
        CacheManager::new(config, Arc::new(clock.clone()))
    }

    fn key(i: usize) -> CacheKey {
        CacheKey::new(format!("k{i}"))
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used_entry() {
        let clock = ManualClock::starting_now();
        let config = CacheConfigBuilder::new()
            .max_entries(1000)
            .eviction_policy(EvictionPolicy::Lru)
            .build();
        let cache = manager(config, &clock);

        for i in 0..1000 {
            assert!(cache.set(key(i), &i, CacheSetOptions::new()).await.unwrap());
        }
        // Touch k0 so k1 becomes least recently used
        assert_eq!(cache.get::<usize>(&key(0)).await, Some(0));

        cache.set(key(1000), &1000, CacheSetOptions::new()).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.fast.evictions, 1);
        assert_eq!(stats.fast_entries, 1000);
        assert!(!cache.l1().contains(&key(1)).await);
        assert_eq!(cache.get::<usize>(&key(1)).await, None);
        assert_eq!(cache.get::<usize>(&key(0)).await, Some(0));
    }

    #[tokio::test]
    async fn lfu_and_fifo_pick_expected_victims() {
        let clock = ManualClock::starting_now();

        let lfu = manager(
            CacheConfigBuilder::new()
                .max_entries(2)
                .eviction_policy(EvictionPolicy::Lfu)
                .build(),
            &clock,
        );
        lfu.set(key(0), &0, CacheSetOptions::new()).await.unwrap();
        lfu.set(key(1), &1, CacheSetOptions::new()).await.unwrap();
        lfu.get::<u32>(&key(0)).await;
        lfu.get::<u32>(&key(0)).await;
        lfu.get::<u32>(&key(1)).await;
        lfu.set(key(2), &2, CacheSetOptions::new()).await.unwrap();
        assert!(lfu.l1().contains(&key(0)).await);
        assert!(!lfu.l1().contains(&key(1)).await);

        let fifo = manager(
            CacheConfigBuilder::new()
                .max_entries(2)
                .eviction_policy(EvictionPolicy::Fifo)
                .build(),
            &clock,
        );
        fifo.set(key(0), &0, CacheSetOptions::new()).await.unwrap();
        fifo.set(key(1), &1, CacheSetOptions::new()).await.unwrap();
        fifo.get::<u32>(&key(0)).await;
        fifo.set(key(2), &2, CacheSetOptions::new()).await.unwrap();
        assert!(!fifo.l1().contains(&key(0)).await);
        assert!(fifo.l1().contains(&key(1)).await);
    }

    #[tokio::test]
    async fn ttl_policy_evicts_soonest_expiry() {
        let clock = ManualClock::starting_now();
        let cache = manager(
            CacheConfigBuilder::new()
                .max_entries(2)
                .eviction_policy(EvictionPolicy::Ttl)
                .default_ttl(None)
                .build(),
            &clock,
        );
        cache
            .set(key(0), &0, CacheSetOptions::new().ttl(Duration::from_secs(600)))
            .await
            .unwrap();
        cache
            .set(key(1), &1, CacheSetOptions::new().ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        cache.set(key(2), &2, CacheSetOptions::new()).await.unwrap();

        assert!(cache.l1().contains(&key(0)).await);
        assert!(!cache.l1().contains(&key(1)).await);
    }

    #[tokio::test]
    async fn entry_expires_with_clock() {
        let clock = ManualClock::starting_now();
        let cache = manager(CacheConfig::default(), &clock);
        let k = CacheKey::new("answer");

        cache
            .set(k.clone(), &"42", CacheSetOptions::new().ttl(Duration::from_secs(30)))
            .await
            .unwrap();
        clock.advance_secs(29);
        assert_eq!(cache.get::<String>(&k).await.as_deref(), Some("42"));

        clock.advance_secs(1);
        assert_eq!(cache.get::<String>(&k).await, None);
    }

    #[tokio::test]
    async fn byte_budget_is_respected() {
        let clock = ManualClock::starting_now();
        let cache = manager(CacheConfigBuilder::new().max_bytes(400).build(), &clock);
        let big = "x".repeat(150);

        for i in 0..5 {
            cache.set(key(i), &big, CacheSetOptions::new()).await.unwrap();
        }
        let stats = cache.stats().await;
        assert!(stats.fast_bytes <= 400);
        assert!(stats.fast.evictions >= 3);

        let huge = "y".repeat(1000);
        assert!(!cache.set(key(99), &huge, CacheSetOptions::new()).await.unwrap());
    }

    #[tokio::test]
    async fn disk_hit_is_promoted_to_fast_level() {
        let clock = ManualClock::starting_now();
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let cache = manager(CacheConfig::default(), &clock).with_disk(pool);
        let k = CacheKey::new("report");

        cache
            .set(k.clone(), &vec![1, 2, 3], CacheSetOptions::new().levels(&[CacheLevel::Disk]))
            .await
            .unwrap();
        assert!(!cache.l1().contains(&k).await);

        assert_eq!(cache.get::<Vec<i32>>(&k).await, Some(vec![1, 2, 3]));
        assert!(cache.l1().contains(&k).await);

        let stats = cache.stats().await;
        assert_eq!(stats.disk.hits, 1);
        assert_eq!(stats.fast.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn disk_level_rechecks_ttl() {
        let clock = ManualClock::starting_now();
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let cache = manager(CacheConfig::default(), &clock).with_disk(pool);
        let k = CacheKey::new("short-lived");

        cache
            .set(
                k.clone(),
                &1,
                CacheSetOptions::new()
                    .ttl(Duration::from_secs(5))
                    .levels(&[CacheLevel::Disk]),
            )
            .await
            .unwrap();
        clock.advance_secs(6);
        assert_eq!(cache.get::<i32>(&k).await, None);
    }

    #[tokio::test]
    async fn distributed_hit_fills_faster_levels() {
        let clock = ManualClock::starting_now();
        let remote = InProcessRemoteCache::new();
        let writer = manager(CacheConfig::default(), &clock).with_remote(Arc::new(remote.clone()));
        let reader = manager(CacheConfig::default(), &clock).with_remote(Arc::new(remote.clone()));
        let k = CacheKey::fingerprint("recall", &["p1", "rust"]);

        writer
            .set(k.clone(), &"shared", CacheSetOptions::new().owner("p1"))
            .await
            .unwrap();
        assert_eq!(reader.get::<String>(&k).await.as_deref(), Some("shared"));
        assert!(reader.l1().contains(&k).await);
        assert_eq!(reader.stats().await.distributed.hits, 1);
    }

    struct FailingRemote;

    #[async_trait]
    impl RemoteCache for FailingRemote {
        fn backend_name(&self) -> &'static str {
            "failing"
        }

        async fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
            Err(MemoryError::CacheBackend("connection refused".into()))
        }

        async fn set(&self, _key: &CacheKey, _payload: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(MemoryError::CacheBackend("connection refused".into()))
        }

        async fn invalidate(&self, _selector: &Invalidation) -> Result<u64> {
            Err(MemoryError::CacheBackend("connection refused".into()))
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    struct SlowRemote;

    #[async_trait]
    impl RemoteCache for SlowRemote {
        fn backend_name(&self) -> &'static str {
            "slow"
        }

        async fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn set(&self, _key: &CacheKey, _payload: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn invalidate(&self, _selector: &Invalidation) -> Result<u64> {
            Ok(0)
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn distributed_failure_degrades_to_miss() {
        let clock = ManualClock::starting_now();
        let cache = manager(CacheConfig::default(), &clock).with_remote(Arc::new(FailingRemote));
        let k = CacheKey::new("x");

        assert_eq!(cache.get::<i32>(&k).await, None);
        assert!(cache.set(k.clone(), &7, CacheSetOptions::new()).await.unwrap());
        assert_eq!(cache.get::<i32>(&k).await, Some(7));

        let stats = cache.stats().await;
        assert_eq!(stats.distributed.errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_distributed_level_is_bounded_by_timeout() {
        let clock = ManualClock::starting_now();
        let cache = manager(CacheConfig::default(), &clock).with_remote(Arc::new(SlowRemote));

        let started = tokio::time::Instant::now();
        assert_eq!(cache.get::<i32>(&CacheKey::new("missing")).await, None);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(cache.stats().await.distributed.errors, 1);
    }

    #[tokio::test]
    async fn invalidate_by_owner_tags_and_workflow() {
        let clock = ManualClock::starting_now();
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let cache = manager(CacheConfig::default(), &clock).with_disk(pool);

        cache
            .set(key(1), &1, CacheSetOptions::new().owner("p1").tags(["recall"]))
            .await
            .unwrap();
        cache
            .set(key(2), &2, CacheSetOptions::new().owner("p2").workflow("review"))
            .await
            .unwrap();
        cache
            .set(key(3), &3, CacheSetOptions::new().tags(["lint"]))
            .await
            .unwrap();

        assert_eq!(cache.invalidate(&Invalidation::Owner("p1".into())).await, 2);
        assert_eq!(cache.get::<i32>(&key(1)).await, None);
        assert_eq!(cache.get::<i32>(&key(2)).await, Some(2));

        assert_eq!(cache.invalidate(&Invalidation::Workflow("review".into())).await, 2);
        assert_eq!(cache.invalidate(&Invalidation::Tags(vec!["lint".into()])).await, 2);
        assert_eq!(cache.invalidate(&Invalidation::Key(key(3))).await, 0);
        assert_eq!(cache.get::<i32>(&key(3)).await, None);
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = CacheKey::fingerprint("recall", &["p1", "rust", "10"]);
        let b = CacheKey::fingerprint("recall", &["p1", "rust", "10"]);
        let c = CacheKey::fingerprint("recall", &["p1", "rust", "11"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("recall:"));
    }
}
