// Embedding backends for the semantic tier.
// Remote OpenAI-compatible endpoint, optional local fastembed model, and a
// deterministic feature-hashing fallback that needs no network or model files.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
pub const DEFAULT_LOCAL_MODEL: &str = "all-MiniLM-L6-v2";
pub const HASH_EMBEDDER_MODEL: &str = "feature-hash-v1";

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> CacheResult<Vec<f32>>;
}

fn ensure_dimension(expected: usize, embedding: &[f32]) -> CacheResult<()> {
    if embedding.len() != expected {
        return Err(CacheError::Embedding(format!(
            "embedding dimension mismatch: expected {}, got {}",
            expected,
            embedding.len()
        )));
    }
    Ok(())
}

/// Calculate cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        0.0
    } else {
        dot_product / (magnitude_a * magnitude_b)
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dimension,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> CacheResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CacheError::Unavailable(format!("embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CacheError::Embedding(format!(
                "embedding endpoint returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }
        let mut parsed = response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| CacheError::Embedding(format!("malformed embedding response: {e}")))?;
        let embedding = parsed
            .data
            .pop()
            .map(|d| d.embedding)
            .ok_or_else(|| CacheError::Embedding("no embedding generated".to_string()))?;
        ensure_dimension(self.dimension, &embedding)?;
        Ok(embedding)
    }
}

/// Local sentence embeddings through fastembed.
#[cfg(feature = "local-embeddings")]
pub struct FastEmbedder {
    model_name: String,
    model: fastembed::TextEmbedding,
}

#[cfg(feature = "local-embeddings")]
impl FastEmbedder {
    pub fn new(model_name: &str) -> CacheResult<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let parsed = match model_name.trim().to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "all_minilm_l6_v2" => EmbeddingModel::AllMiniLML6V2,
            other => {
                return Err(CacheError::InvalidConfig(format!(
                    "unsupported embedding model id '{}'; supported: {}",
                    other, DEFAULT_LOCAL_MODEL
                )))
            }
        };
        let model = TextEmbedding::try_new(InitOptions::new(parsed)).map_err(|err| {
            CacheError::Embedding(format!(
                "failed to initialize embedding model '{}': {}",
                model_name, err
            ))
        })?;
        tracing::info!(
            target: "codeloom.cache",
            "Embeddings enabled: model={} dimension={}",
            model_name,
            DEFAULT_EMBEDDING_DIMENSION
        );
        Ok(Self {
            model_name: model_name.to_string(),
            model,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        DEFAULT_EMBEDDING_DIMENSION
    }

    async fn embed(&self, text: &str) -> CacheResult<Vec<f32>> {
        let mut embeddings = self
            .model
            .embed(vec![text.to_string()], None)
            .map_err(|e| CacheError::Embedding(e.to_string()))?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| CacheError::Embedding("no embedding generated".to_string()))?;
        ensure_dimension(DEFAULT_EMBEDDING_DIMENSION, &embedding)?;
        Ok(embedding)
    }
}

/// Signed feature hashing over lowercase word unigrams and bigrams.
///
/// Descriptions that share most of their vocabulary land close together, which
/// is enough for offline runs and tests. Output is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn features(text: &str) -> Vec<String> {
        let tokens = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect::<Vec<_>>();
        let bigrams = tokens.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
        tokens.iter().cloned().chain(bigrams).collect()
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        HASH_EMBEDDER_MODEL
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> CacheResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}
