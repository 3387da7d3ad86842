use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, RwLock};

use codeloom_types::{CacheEntry, CacheStats, SemanticMatch};

use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::{CacheError, CacheResult};
use crate::store::{self, ENTRY_COLUMNS};
use crate::SemanticCache;

const ENTRIES: &str = "semantic_entries";
const VECTORS: &str = "semantic_vectors";

fn embedding_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn rank(
    mut scored: Vec<SemanticMatch>,
    threshold: f64,
    top_k: usize,
    excluded_ids: &[String],
) -> Vec<SemanticMatch> {
    scored.retain(|m| m.similarity >= threshold && !excluded_ids.contains(&m.entry.id));
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(top_k);
    scored
}

/// Semantic tier: entry rows plus a sqlite-vec cosine index over their descriptions.
pub struct SqliteSemanticCache {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteSemanticCache {
    /// Opens the index, rebuilding vectors if the embedder's model or dimension changed.
    pub async fn open(db_path: &Path, embedder: Arc<dyn Embedder>) -> CacheResult<Self> {
        if embedder.dimension() == 0 {
            return Err(CacheError::InvalidConfig(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let conn = store::open_connection(db_path)?;
        store::create_entry_table(&conn, ENTRIES)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS semantic_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let signature = format!("{}:{}", embedder.model_name(), embedder.dimension());
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM semantic_meta WHERE key = 'embedder'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let rebuild = stored.as_deref().is_some_and(|s| s != signature);
        if rebuild {
            tracing::warn!(
                target: "codeloom.cache",
                "Embedder changed ({} -> {}); rebuilding semantic index",
                stored.as_deref().unwrap_or_default(),
                signature
            );
            drop_vector_tables(&conn)?;
        }
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {VECTORS} USING vec0(
                    entry_id TEXT PRIMARY KEY,
                    embedding float[{}] distance_metric=cosine
                )",
                embedder.dimension()
            ),
            [],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO semantic_meta (key, value) VALUES ('embedder', ?1)",
            params![signature],
        )?;

        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        };
        if rebuild {
            cache.reindex().await?;
        }
        Ok(cache)
    }

    async fn reindex(&self) -> CacheResult<()> {
        let rows = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&format!("SELECT id, description FROM {ENTRIES}"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (id, description) in rows {
            let embedding = self.embedder.embed(&description).await?;
            let conn = self.conn.lock().await;
            conn.execute(
                &format!("INSERT INTO {VECTORS} (entry_id, embedding) VALUES (?1, ?2)"),
                params![id, embedding_literal(&embedding)],
            )?;
        }
        Ok(())
    }
}

fn drop_vector_tables(conn: &Connection) -> CacheResult<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS \"{VECTORS}\""), [])?;
    // sqlite-vec leaves shadow tables behind on some versions
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE ?1 ORDER BY name",
    )?;
    let shadow = stmt
        .query_map(params![format!("{VECTORS}_%")], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for name in shadow {
        let sql = format!("DROP TABLE IF EXISTS \"{}\"", name.replace('"', "\"\""));
        conn.execute(&sql, [])?;
    }
    Ok(())
}

#[async_trait]
impl SemanticCache for SqliteSemanticCache {
    async fn search(
        &self,
        query: &str,
        threshold: f64,
        top_k: usize,
        excluded_ids: &[String],
    ) -> CacheResult<Vec<SemanticMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;
        let k = (top_k + excluded_ids.len()) as i64;

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT v.distance, {ENTRY_COLUMNS}
             FROM {VECTORS} AS v
             JOIN {ENTRIES} AS e ON v.entry_id = e.id
             WHERE v.embedding MATCH ?1 AND k = ?2
             ORDER BY v.distance"
        ))?;
        let scored = stmt
            .query_map(params![embedding_literal(&embedding), k], |row| {
                let distance: f64 = row.get(0)?;
                Ok(SemanticMatch {
                    entry: store::row_to_entry(row, 1)?,
                    similarity: 1.0 - distance,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rank(scored, threshold, top_k, excluded_ids))
    }

    async fn save(&self, entry: &CacheEntry) -> CacheResult<()> {
        let embedding = self.embedder.embed(&entry.description).await?;
        let conn = self.conn.lock().await;
        store::upsert_entry(&conn, ENTRIES, entry)?;
        conn.execute(
            &format!("DELETE FROM {VECTORS} WHERE entry_id = ?1"),
            params![entry.id],
        )?;
        conn.execute(
            &format!("INSERT INTO {VECTORS} (entry_id, embedding) VALUES (?1, ?2)"),
            params![entry.id, embedding_literal(&embedding)],
        )?;
        Ok(())
    }

    async fn record_reuse(&self, id: &str) -> CacheResult<()> {
        let conn = self.conn.lock().await;
        if !store::bump_reuse(&conn, ENTRIES, id)? {
            tracing::debug!(target: "codeloom.cache", entry_id = %id, "semantic reuse for unknown entry");
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn.lock().await;
        store::entry_stats(&conn, ENTRIES)
    }
}

/// Process-local semantic tier using brute-force cosine similarity.
pub struct InMemorySemanticCache {
    entries: RwLock<Vec<(CacheEntry, Vec<f32>)>>,
    embedder: Arc<dyn Embedder>,
}

impl InMemorySemanticCache {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            embedder,
        }
    }

    /// Stores `entry` under an explicit vector, bypassing the embedder.
    pub async fn insert_with_embedding(&self, entry: CacheEntry, embedding: Vec<f32>) {
        let mut entries = self.entries.write().await;
        entries.retain(|(e, _)| e.id != entry.id);
        entries.push((entry, embedding));
    }

    pub async fn get(&self, id: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|(e, _)| e.id == id)
            .map(|(e, _)| e.clone())
    }
}

#[async_trait]
impl SemanticCache for InMemorySemanticCache {
    async fn search(
        &self,
        query: &str,
        threshold: f64,
        top_k: usize,
        excluded_ids: &[String],
    ) -> CacheResult<Vec<SemanticMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;
        let entries = self.entries.read().await;
        let scored = entries
            .iter()
            .map(|(entry, vector)| SemanticMatch {
                entry: entry.clone(),
                similarity: f64::from(cosine_similarity(&embedding, vector)),
            })
            .collect();
        Ok(rank(scored, threshold, top_k, excluded_ids))
    }

    async fn save(&self, entry: &CacheEntry) -> CacheResult<()> {
        let embedding = self.embedder.embed(&entry.description).await?;
        self.insert_with_embedding(entry.clone(), embedding).await;
        Ok(())
    }

    async fn record_reuse(&self, id: &str) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        if let Some((entry, _)) = entries.iter_mut().find(|(e, _)| e.id == id) {
            entry.reuse_count += 1;
            entry.cost_saved += entry.generation_tokens;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.entries.read().await;
        Ok(entries.iter().fold(CacheStats::default(), |mut acc, (e, _)| {
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
    use crate::embeddings::HashEmbedder;
    use crate::test_support::entry;
    use tempfile::TempDir;

    fn described(fingerprint: &str, description: &str) -> CacheEntry {
        let mut e = entry(fingerprint, description, 40);
        e.description = description.to_string();
        e
    }

    /// Maps fixed phrases to fixed unit vectors so similarities are exact.
    struct TableEmbedder;

    #[async_trait]
    impl Embedder for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, text: &str) -> CacheResult<Vec<f32>> {
            Ok(match text {
                "query" => vec![1.0, 0.0],
                "close" => vec![0.9, 0.435_889_9],
                "near" => vec![0.8, 0.6],
                _ => vec![0.0, 1.0],
            })
        }
    }

    #[tokio::test]
    async fn sqlite_search_orders_by_similarity_and_applies_threshold() {
        let temp = TempDir::new().expect("tempdir");
        let cache = SqliteSemanticCache::open(&temp.path().join("cache.db"), Arc::new(TableEmbedder))
            .await
            .expect("open");
        let close = described("fp-close", "close");
        let near = described("fp-near", "near");
        let far = described("fp-far", "far");
        for e in [&near, &far, &close] {
            cache.save(e).await.expect("save");
        }

        let hits = cache.search("query", 0.5, 3, &[]).await.expect("search");
        let ids = hits.iter().map(|m| m.entry.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![close.id.clone(), near.id.clone()]);
        assert!((hits[0].similarity - 0.9).abs() < 1e-3);
        assert!((hits[1].similarity - 0.8).abs() < 1e-3);

        let strict = cache.search("query", 0.85, 3, &[]).await.expect("search");
        assert_eq!(strict.len(), 1);

        let excluded = cache
            .search("query", 0.5, 3, &[close.id.clone()])
            .await
            .expect("search");
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].entry.id, near.id);
    }

    #[tokio::test]
    async fn sqlite_reuse_and_stats() {
        let temp = TempDir::new().expect("tempdir");
        let cache = SqliteSemanticCache::open(
            &temp.path().join("cache.db"),
            Arc::new(HashEmbedder::new(32)),
        )
        .await
        .expect("open");
        let saved = described("fp", "sum two numbers a and b");
        cache.save(&saved).await.expect("save");
        cache.save(&saved).await.expect("resave replaces");
        cache.record_reuse(&saved.id).await.expect("reuse");

        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_reuses, 1);
        assert_eq!(stats.cost_saved, 40);

        let hits = cache
            .search("sum two numbers a and b", 0.99, 1, &[])
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.reuse_count, 1);
    }

    #[tokio::test]
    async fn sqlite_rebuilds_index_when_embedder_changes() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("cache.db");
        let saved = described("fp", "extract invoice total");
        {
            let cache = SqliteSemanticCache::open(&path, Arc::new(HashEmbedder::new(16)))
                .await
                .expect("open");
            cache.save(&saved).await.expect("save");
        }
        let cache = SqliteSemanticCache::open(&path, Arc::new(HashEmbedder::new(24)))
            .await
            .expect("reopen with new dimension");
        let hits = cache
            .search("extract invoice total", 0.99, 1, &[])
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, saved.id);
    }

    #[tokio::test]
    async fn in_memory_search_respects_threshold_and_top_k() {
        let cache = InMemorySemanticCache::new(Arc::new(TableEmbedder));
        let close = described("a", "close");
        let near = described("b", "near");
        cache.save(&close).await.expect("save");
        cache.save(&near).await.expect("save");
        cache
            .insert_with_embedding(described("c", "manual"), vec![0.0, 1.0])
            .await;

        let hits = cache.search("query", 0.5, 1, &[]).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, close.id);
        assert!(cache.search("query", 0.95, 3, &[]).await.expect("search").is_empty());
        assert!(cache.search("query", 0.0, 0, &[]).await.expect("search").is_empty());

        cache.record_reuse(&near.id).await.expect("reuse");
        assert_eq!(cache.get(&near.id).await.expect("entry").reuse_count, 1);
    }
}
