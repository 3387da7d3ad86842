//! Exact and semantic caches of validated programs.
//!
//! Both tiers are ports so the orchestrator can run against SQLite in
//! production and in-memory adapters in tests. Writes are id-keyed upserts or
//! counter bumps, so concurrent runs never need to coordinate.

pub mod embeddings;
pub mod error;
pub mod exact;
pub mod semantic;
mod store;

use async_trait::async_trait;

use codeloom_types::{CacheEntry, CacheStats, SemanticMatch};

pub use embeddings::{
    cosine_similarity, Embedder, HashEmbedder, RemoteEmbedder, DEFAULT_EMBEDDING_DIMENSION,
    DEFAULT_LOCAL_MODEL,
};
#[cfg(feature = "local-embeddings")]
pub use embeddings::FastEmbedder;
pub use error::{CacheError, CacheResult};
pub use exact::{InMemoryExactCache, SqliteExactCache};
pub use semantic::{InMemorySemanticCache, SqliteSemanticCache};

/// Keyed lookup by fingerprint.
#[async_trait]
pub trait ExactCache: Send + Sync {
    /// Best candidate for `fingerprint`: most reused, then most recently touched.
    async fn lookup(&self, fingerprint: &str) -> CacheResult<Option<CacheEntry>>;
    async fn save(&self, entry: &CacheEntry) -> CacheResult<()>;
    /// Counts one reuse and credits the entry's generation tokens as saved cost.
    async fn record_reuse(&self, id: &str) -> CacheResult<()>;
    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// Similarity lookup over entry descriptions.
#[async_trait]
pub trait SemanticCache: Send + Sync {
    /// Up to `top_k` matches with similarity `>= threshold`, best first.
    async fn search(
        &self,
        query: &str,
        threshold: f64,
        top_k: usize,
        excluded_ids: &[String],
    ) -> CacheResult<Vec<SemanticMatch>>;
    async fn save(&self, entry: &CacheEntry) -> CacheResult<()>;
    async fn record_reuse(&self, id: &str) -> CacheResult<()>;
    async fn stats(&self) -> CacheResult<CacheStats>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use codeloom_types::{CacheEntry, Context, ContextProfile, NewCacheEntry};
    use serde_json::json;

    pub fn entry(fingerprint: &str, task: &str, tokens: u64) -> CacheEntry {
        let context = Context::from_value(json!({"a": 2, "b": 3, "api_key": "k"})).expect("context");
        let profile = ContextProfile::from_context(&context);
        CacheEntry::new(NewCacheEntry {
            fingerprint: fingerprint.to_string(),
            task: task.to_string(),
            description: format!("{task}\n{}", profile.schema.render()),
            schema: profile.schema,
            config: profile.config,
            code: "import json\nprint(json.dumps({'status': 'success', 'context_updates': {}}))\n"
                .to_string(),
            libraries: vec!["json".to_string()],
            generation_tokens: tokens,
        })
    }
}
