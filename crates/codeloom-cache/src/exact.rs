use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, RwLock};

use codeloom_types::{CacheEntry, CacheStats};

use crate::error::CacheResult;
use crate::store::{self, ENTRY_COLUMNS};
use crate::ExactCache;

const TABLE: &str = "exact_entries";

/// Exact tier backed by a SQLite table indexed on fingerprint.
pub struct SqliteExactCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExactCache {
    pub async fn open(db_path: &Path) -> CacheResult<Self> {
        let conn = store::open_connection(db_path)?;
        store::create_entry_table(&conn, TABLE)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ExactCache for SqliteExactCache {
    async fn lookup(&self, fingerprint: &str) -> CacheResult<Option<CacheEntry>> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM {TABLE}
                     WHERE fingerprint = ?1
                     ORDER BY reuse_count DESC, updated_at DESC
                     LIMIT 1"
                ),
                params![fingerprint],
                |row| store::row_to_entry(row, 0),
            )
            .optional()?;
        Ok(entry)
    }

    async fn save(&self, entry: &CacheEntry) -> CacheResult<()> {
        let conn = self.conn.lock().await;
        store::upsert_entry(&conn, TABLE, entry)
    }

    async fn record_reuse(&self, id: &str) -> CacheResult<()> {
        let conn = self.conn.lock().await;
        if !store::bump_reuse(&conn, TABLE, id)? {
            tracing::debug!(target: "codeloom.cache", entry_id = %id, "exact reuse for unknown entry");
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn.lock().await;
        store::entry_stats(&conn, TABLE)
    }
}

/// Process-local exact tier.
#[derive(Default)]
pub struct InMemoryExactCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryExactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ExactCache for InMemoryExactCache {
    async fn lookup(&self, fingerprint: &str) -> CacheResult<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.fingerprint == fingerprint)
            .max_by(|a, b| {
                a.reuse_count
                    .cmp(&b.reuse_count)
                    .then(a.updated_at.cmp(&b.updated_at))
            })
            .cloned())
    }

    async fn save(&self, entry: &CacheEntry) -> CacheResult<()> {
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn record_reuse(&self, id: &str) -> CacheResult<()> {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.reuse_count += 1;
            entry.cost_saved += entry.generation_tokens;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.entries.read().await;
        Ok(entries.values().fold(CacheStats::default(), |mut acc, e| {
            acc.entries += 1;
            acc.total_reuses += e.reuse_count;
            acc.cost_saved += e.cost_saved;
            acc
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entry;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sqlite_lookup_prefers_most_reused_entry() {
        let temp = TempDir::new().expect("tempdir");
        let cache = SqliteExactCache::open(&temp.path().join("cache.db"))
            .await
            .expect("open");

        let first = entry("fp-1", "sum two numbers", 100);
        let second = entry("fp-1", "sum two numbers", 80);
        cache.save(&first).await.expect("save");
        cache.save(&second).await.expect("save");
        cache.save(&entry("fp-2", "other", 10)).await.expect("save");

        cache.record_reuse(&second.id).await.expect("reuse");
        let hit = cache.lookup("fp-1").await.expect("lookup").expect("hit");
        assert_eq!(hit.id, second.id);
        assert_eq!(hit.reuse_count, 1);
        assert_eq!(hit.cost_saved, 80);
        assert_eq!(hit.schema, second.schema);
        assert_eq!(hit.libraries, vec!["json".to_string()]);

        assert!(cache.lookup("missing").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn sqlite_stats_accumulate_reuse_savings() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("nested").join("cache.db");
        let cache = SqliteExactCache::open(&path).await.expect("open");
        let saved = entry("fp", "task", 25);
        cache.save(&saved).await.expect("save");
        cache.record_reuse(&saved.id).await.expect("reuse");
        cache.record_reuse(&saved.id).await.expect("reuse");
        cache.record_reuse("unknown").await.expect("unknown id is ignored");

        let stats = cache.stats().await.expect("stats");
        assert_eq!(
            stats,
            CacheStats {
                entries: 1,
                total_reuses: 2,
                cost_saved: 50
            }
        );
    }

    #[tokio::test]
    async fn sqlite_entries_survive_reopen() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("cache.db");
        let saved = entry("fp", "task", 5);
        {
            let cache = SqliteExactCache::open(&path).await.expect("open");
            cache.save(&saved).await.expect("save");
        }
        let reopened = SqliteExactCache::open(&path).await.expect("reopen");
        let hit = reopened.lookup("fp").await.expect("lookup").expect("hit");
        assert_eq!(hit.code, saved.code);
    }

    #[tokio::test]
    async fn in_memory_matches_sqlite_semantics() {
        let cache = InMemoryExactCache::new();
        let a = entry("fp", "task", 10);
        let b = entry("fp", "task", 20);
        cache.save(&a).await.expect("save");
        cache.save(&b).await.expect("save");
        cache.record_reuse(&a.id).await.expect("reuse");

        let hit = cache.lookup("fp").await.expect("lookup").expect("hit");
        assert_eq!(hit.id, a.id);
        assert_eq!(cache.len().await, 2);
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.total_reuses, 1);
        assert_eq!(stats.cost_saved, 10);
    }
}
