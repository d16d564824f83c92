//! Key-value preference storage
//!
//! The rate limiter persists its buckets through this opaque get/set
//! interface. The SQLite implementation is the durable one; the in-memory
//! map serves tests and throwaway runtimes.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::error::Result;
use crate::db::DatabaseManager;

/// Opaque string key-value store
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local preference store
#[derive(Default)]
pub struct InMemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Preference store persisted in the `preferences` SQLite table
#[derive(Clone)]
pub struct SqlitePreferenceStore {
    db: Arc<DatabaseManager>,
}

impl SqlitePreferenceStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PreferenceStore for SqlitePreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM preferences WHERE key = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    params![key, value],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM preferences WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryPreferenceStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", "1").await.unwrap();
        store.set("a", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_managers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prefs.db");

        {
            let db = Arc::new(DatabaseManager::new(&path, 2, Duration::from_millis(1000)).unwrap());
            let store = SqlitePreferenceStore::new(db);
            store.set("rate_bucket.site", "5;1000;3;42").await.unwrap();
            store.set("rate_bucket.site", "5;1000;2;43").await.unwrap();
        }

        let db = Arc::new(DatabaseManager::new(&path, 2, Duration::from_millis(1000)).unwrap());
        let store = SqlitePreferenceStore::new(db);
        assert_eq!(
            store.get("rate_bucket.site").await.unwrap().as_deref(),
            Some("5;1000;2;43")
        );

        store.remove("rate_bucket.site").await.unwrap();
        assert!(store.get("rate_bucket.site").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_in_memory() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let store = SqlitePreferenceStore::new(db);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
