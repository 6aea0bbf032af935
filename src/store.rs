//! Durable long-term tier storage using SQLite

use crate::error::{MemoryError, Result};
use crate::types::{MemoryContent, MemoryItem, Tier};

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Where persistent state lives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `strata.db`. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self { data_dir: None }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
        }
    }
}

/// Open the SQLite pool and run migrations
pub async fn open_pool(config: &StorageConfig) -> Result<SqlitePool> {
    let pool = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let options = SqliteConnectOptions::new()
                .filename(dir.join("strata.db"))
                .create_if_missing(true);
            SqlitePool::connect_with(options).await?
        }
        None => {
            // A single long-lived connection; each new in-memory connection is a fresh database
            let options = SqliteConnectOptions::new()
                .in_memory(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        }
    };

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| MemoryError::Migration(e.to_string()))?;

    Ok(pool)
}

/// Persistence for LONG-tier items, keyed by (owner, id)
#[derive(Clone)]
pub struct LongTermStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for LongTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongTermStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl LongTermStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace an item
    pub async fn upsert(&self, item: &MemoryItem) -> Result<()> {
        let content = serde_json::to_string(&item.content)?;
        let tags = serde_json::to_string(&item.tags)?;
        let metadata = serde_json::to_string(&item.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO long_term_memories (
                owner, id, content, importance, created_at, last_access,
                access_count, tags, expires_at, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, id) DO UPDATE SET
                content = excluded.content,
                importance = excluded.importance,
                last_access = excluded.last_access,
                access_count = excluded.access_count,
                tags = excluded.tags,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(&item.owner)
        .bind(&item.id)
        .bind(content)
        .bind(item.importance)
        .bind(item.created_at)
        .bind(item.last_access)
        .bind(i64::try_from(item.access_count).unwrap_or(i64::MAX))
        .bind(tags)
        .bind(item.expires_at)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load one item
    pub async fn load(&self, owner: &str, id: &str) -> Result<Option<MemoryItem>> {
        let row = sqlx::query(
            r#"
            SELECT owner, id, content, importance, created_at, last_access,
                   access_count, tags, expires_at, metadata
            FROM long_term_memories
            WHERE owner = ? AND id = ?
            "#,
        )
        .bind(owner)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    /// Load an owner's whole long-term population
    pub async fn load_owner(&self, owner: &str) -> Result<Vec<MemoryItem>> {
        let rows = sqlx::query(
            r#"
            SELECT owner, id, content, importance, created_at, last_access,
                   access_count, tags, expires_at, metadata
            FROM long_term_memories
            WHERE owner = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_item(row) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(owner, error = %e, "Skipping unreadable long-term row"),
            }
        }
        Ok(items)
    }

    /// Delete one item
    pub async fn delete(&self, owner: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM long_term_memories WHERE owner = ? AND id = ?")
            .bind(owner)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of persisted items for an owner
    pub async fn count(&self, owner: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM long_term_memories WHERE owner = ?")
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Owners that have anything persisted
    pub async fn owners(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT owner FROM long_term_memories ORDER BY owner")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("owner").ok())
            .collect())
    }
}

/// Helper: Convert database row to MemoryItem
fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryItem> {
    let content_json: String = row.try_get("content")?;
    let content: MemoryContent = serde_json::from_str(&content_json)?;

    let tags_json: String = row.try_get("tags").unwrap_or_else(|_| "[]".to_string());
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let metadata_json: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());
    let metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    let access_count: i64 = row.try_get("access_count").unwrap_or(0);
    let importance: f32 = row.try_get("importance")?;

    let mut item = MemoryItem {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        tier: Tier::Long,
        content,
        importance,
        created_at: row.try_get("created_at")?,
        last_access: row.try_get("last_access")?,
        access_count: u64::try_from(access_count).unwrap_or(0),
        tags,
        expires_at: row.try_get("expires_at").ok().flatten(),
        metadata,
    };
    item.set_importance(importance);
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn upsert_and_reload_round_trip() {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let store = LongTermStore::new(pool);
        let now = Utc::now();

        let mut item = MemoryItem::new("p1", "durable fact".into(), Tier::Long, 0.9, now)
            .with_tags(["promoted_from_medium"])
            .with_expiry(now + Duration::days(400))
            .with_metadata("source", serde_json::json!("test"));
        store.upsert(&item).await.unwrap();

        item.access_count = 12;
        store.upsert(&item).await.unwrap();

        let loaded = store.load("p1", &item.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 12);
        assert_eq!(loaded.tags, item.tags);
        assert_eq!(loaded.metadata, item.metadata);
        assert_eq!(store.count("p1").await.unwrap(), 1);
        assert_eq!(store.owners().await.unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::at(dir.path());
        let item = MemoryItem::new("p1", "kept".into(), Tier::Long, 0.8, Utc::now());

        {
            let store = LongTermStore::new(open_pool(&config).await.unwrap());
            store.upsert(&item).await.unwrap();
            store.pool().close().await;
        }

        let store = LongTermStore::new(open_pool(&config).await.unwrap());
        let items = store.load_owner("p1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);
        assert!(store.delete("p1", &item.id).await.unwrap());
        assert!(!store.delete("p1", &item.id).await.unwrap());
    }
}
