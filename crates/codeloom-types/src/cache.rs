use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ConfigFlags, ContextSchema};

/// A validated program stored for reuse, keyed by fingerprint and description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub fingerprint: String,
    pub task: String,
    /// Text embedded for similarity search: task plus schema summary.
    pub description: String,
    pub schema: ContextSchema,
    pub config: ConfigFlags,
    pub code: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Tokens spent producing `code`; credited to `cost_saved` on each reuse.
    #[serde(default)]
    pub generation_tokens: u64,
    #[serde(default)]
    pub reuse_count: u64,
    #[serde(default)]
    pub cost_saved: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub fingerprint: String,
    pub task: String,
    pub description: String,
    pub schema: ContextSchema,
    pub config: ConfigFlags,
    pub code: String,
    pub libraries: Vec<String>,
    pub generation_tokens: u64,
}

impl CacheEntry {
    pub fn new(input: NewCacheEntry) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            fingerprint: input.fingerprint,
            task: input.task,
            description: input.description,
            schema: input.schema,
            config: input.config,
            code: input.code,
            libraries: input.libraries,
            generation_tokens: input.generation_tokens,
            reuse_count: 0,
            cost_saved: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMatch {
    pub entry: CacheEntry,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_reuses: u64,
    pub cost_saved: u64,
}
