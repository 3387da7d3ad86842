use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};

use codeloom_cache::{
    Embedder, ExactCache, HashEmbedder, RemoteEmbedder, SemanticCache, SqliteExactCache,
    SqliteSemanticCache,
};
use codeloom_providers::ProviderRegistry;
use codeloom_sandbox::{HttpSandboxBackend, LocalProcessBackend, Sandbox, SandboxClient};
use codeloom_tools::ToolRegistry;

use crate::config::{CacheSettings, CodeloomConfig, EmbeddingKind, EmbeddingSettings, SandboxKind, SandboxSettings};
use crate::orchestrator::Orchestrator;

const EXACT_DB_FILE: &str = "exact.sqlite";
const SEMANTIC_DB_FILE: &str = "semantic.sqlite";
const DEFAULT_REMOTE_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Opened cache tiers. A tier that failed to open is `None` and the run skips it.
#[derive(Clone, Default)]
pub struct CacheHandles {
    pub exact: Option<Arc<dyn ExactCache>>,
    pub semantic: Option<Arc<dyn SemanticCache>>,
}

pub fn cache_dir(settings: &CacheSettings, state_dir: &Path) -> PathBuf {
    settings
        .dir
        .clone()
        .unwrap_or_else(|| state_dir.join("cache"))
}

pub fn build_embedder(settings: &EmbeddingSettings) -> anyhow::Result<Arc<dyn Embedder>> {
    match settings.kind {
        EmbeddingKind::Hash => Ok(Arc::new(HashEmbedder::new(settings.dimension))),
        EmbeddingKind::Remote => {
            let url = settings
                .url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .context("cache.embedding.url is required for remote embeddings")?;
            Ok(Arc::new(RemoteEmbedder::new(
                url,
                settings
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REMOTE_EMBEDDING_MODEL.to_string()),
                settings.dimension,
                settings.api_key.clone(),
            )))
        }
        #[cfg(feature = "local-embeddings")]
        EmbeddingKind::Local => {
            let model = settings
                .model
                .as_deref()
                .unwrap_or(codeloom_cache::DEFAULT_LOCAL_MODEL);
            Ok(Arc::new(codeloom_cache::FastEmbedder::new(model)?))
        }
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingKind::Local => {
            anyhow::bail!("local embeddings require the `local-embeddings` feature")
        }
    }
}

/// Opens both SQLite tiers under the cache dir, degrading to `None` per tier on failure.
pub async fn open_caches(settings: &CacheSettings, state_dir: &Path) -> CacheHandles {
    if !settings.enabled {
        return CacheHandles::default();
    }
    let dir = cache_dir(settings, state_dir);

    let exact: Option<Arc<dyn ExactCache>> =
        match SqliteExactCache::open(&dir.join(EXACT_DB_FILE)).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                warn!(target: "codeloom.cache", "exact cache unavailable: {err}");
                None
            }
        };

    let semantic: Option<Arc<dyn SemanticCache>> = match build_embedder(&settings.embedding) {
        Ok(embedder) => match SqliteSemanticCache::open(&dir.join(SEMANTIC_DB_FILE), embedder).await
        {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                warn!(target: "codeloom.cache", "semantic cache unavailable: {err}");
                None
            }
        },
        Err(err) => {
            warn!(target: "codeloom.cache", "semantic cache disabled: {err:#}");
            None
        }
    };

    info!(
        target: "codeloom.cache",
        dir = %dir.display(),
        exact = exact.is_some(),
        semantic = semantic.is_some(),
        "cache tiers opened"
    );
    CacheHandles { exact, semantic }
}

pub fn build_sandbox(settings: &SandboxSettings) -> anyhow::Result<Arc<dyn Sandbox>> {
    let client = match settings.kind {
        SandboxKind::Remote => {
            let url = settings
                .url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .context("sandbox.url is required for the remote sandbox")?;
            SandboxClient::new(HttpSandboxBackend::new(url, settings.api_key.clone()))
        }
        SandboxKind::Local => SandboxClient::new(LocalProcessBackend::new(settings.python.clone())),
    };
    info!(target: "codeloom.sandbox", backend = client.backend_name(), "sandbox ready");
    Ok(Arc::new(client))
}

/// Wires providers, tools, sandbox and caches from the effective configuration.
pub async fn build_orchestrator(
    config: &CodeloomConfig,
    state_dir: &Path,
    use_cache: bool,
) -> anyhow::Result<Orchestrator> {
    let providers = ProviderRegistry::new(config.app_config());
    let sandbox = build_sandbox(&config.sandbox)?;
    let mut orchestrator = Orchestrator::new(
        providers,
        ToolRegistry::new(),
        sandbox,
        config.orchestrator_settings(),
    )
    .with_cache_timeout(Duration::from_secs(config.cache.timeout_secs.max(1)));

    if use_cache {
        let caches = open_caches(&config.cache, state_dir).await;
        if let Some(exact) = caches.exact {
            orchestrator = orchestrator.with_exact_cache(exact);
        }
        if let Some(semantic) = caches.semantic {
            orchestrator = orchestrator.with_semantic_cache(semantic);
        }
    }
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn remote_backends_need_a_url() {
        let sandbox = SandboxSettings {
            kind: SandboxKind::Remote,
            ..SandboxSettings::default()
        };
        assert!(build_sandbox(&sandbox).is_err());

        let embedding = EmbeddingSettings {
            kind: EmbeddingKind::Remote,
            ..EmbeddingSettings::default()
        };
        assert!(build_embedder(&embedding).is_err());
    }

    #[test]
    fn hash_embedder_is_the_default() {
        let embedder = build_embedder(&EmbeddingSettings::default()).expect("embedder");
        assert_eq!(embedder.dimension(), codeloom_cache::DEFAULT_EMBEDDING_DIMENSION);
    }

    #[tokio::test]
    async fn caches_open_under_the_state_dir() {
        let dir = TempDir::new().expect("tempdir");
        let caches = open_caches(&CacheSettings::default(), dir.path()).await;
        assert!(caches.exact.is_some());
        assert!(caches.semantic.is_some());
        assert!(dir.path().join("cache").join(EXACT_DB_FILE).exists());

        let disabled = CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        };
        let caches = open_caches(&disabled, dir.path()).await;
        assert!(caches.exact.is_none() && caches.semantic.is_none());
    }
}
