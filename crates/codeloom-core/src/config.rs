use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use codeloom_providers::{AppConfig, ProviderConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub semantic_threshold: f64,
    pub semantic_top_k: usize,
    pub analysis_enabled: bool,
    pub output_validation: bool,
    pub llm_timeout_secs: u64,
    pub default_exec_timeout_secs: u64,
    pub max_doc_lookups: usize,
    pub provider: Option<String>,
    pub generation_model: Option<String>,
    /// Model used to judge outputs. See [`OrchestratorSettings::judge_model`].
    pub validation_model: Option<String>,
}

/// Low-cost model per hosted provider, used to judge outputs when no
/// `validation_model` is configured.
const CHEAP_JUDGE_MODELS: [(&str, &str); 6] = [
    ("openai", "gpt-4o-mini"),
    ("openrouter", "openai/gpt-4o-mini"),
    ("anthropic", "claude-3-5-haiku-latest"),
    ("groq", "llama-3.1-8b-instant"),
    ("mistral", "mistral-small-latest"),
    ("together", "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo"),
];

impl OrchestratorSettings {
    /// Model for output validation: `validation_model` if set, else the cheap
    /// variant of the configured `provider`, else `generation_model`.
    /// Without an explicit provider (or for ollama) the judge runs on the
    /// generation model, or the provider default when that is unset too.
    pub fn judge_model(&self) -> Option<String> {
        if let Some(model) = &self.validation_model {
            return Some(model.clone());
        }
        self.provider
            .as_deref()
            .and_then(cheap_judge_model)
            .or_else(|| self.generation_model.clone())
    }
}

fn cheap_judge_model(provider: &str) -> Option<String> {
    CHEAP_JUDGE_MODELS
        .iter()
        .find(|(id, _)| *id == provider)
        .map(|(_, model)| model.to_string())
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            semantic_threshold: 0.85,
            semantic_top_k: 3,
            analysis_enabled: true,
            output_validation: true,
            llm_timeout_secs: 120,
            default_exec_timeout_secs: 60,
            max_doc_lookups: 3,
            provider: None,
            generation_model: None,
            validation_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Remote,
    Local,
    #[default]
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub kind: EmbeddingKind,
    pub url: Option<String>,
    pub model: Option<String>,
    pub dimension: usize,
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::Hash,
            url: None,
            model: None,
            dimension: codeloom_cache::DEFAULT_EMBEDDING_DIMENSION,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub embedding: EmbeddingSettings,
    pub timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            embedding: EmbeddingSettings::default(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Remote,
    #[default]
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub kind: SandboxKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub python: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Local,
            url: None,
            api_key: None,
            python: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeloomConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

impl CodeloomConfig {
    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }

    /// Orchestrator settings with the judge model resolved against
    /// `default_provider` when the orchestrator names no provider itself.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let mut settings = self.orchestrator.clone();
        if settings.validation_model.is_none() {
            settings.validation_model = settings
                .provider
                .as_deref()
                .or(self.default_provider.as_deref())
                .and_then(cheap_judge_model);
        }
        settings
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment, CLI.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_paths(path, global_path, cli_overrides).await
    }

    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> CodeloomConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("config did not match the expected shape, using defaults: {err}");
                CodeloomConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }
}

/// State directory: explicit argument, `CODELOOM_STATE_DIR`, then the platform data dir.
pub fn resolve_state_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    if let Ok(dir) = std::env::var("CODELOOM_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|base| base.join("codeloom"))
        .unwrap_or_else(|| PathBuf::from(".codeloom"))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops file-persisted keys that the environment already supplies.
fn strip_persisted_secrets(value: &mut Value) {
    let Value::Object(root) = value else {
        return;
    };
    if let Some(sandbox) = root.get_mut("sandbox").and_then(|v| v.as_object_mut()) {
        if env_has_value("CODELOOM_SANDBOX_API_KEY") {
            sandbox.remove("api_key");
            sandbox.remove("apiKey");
        }
    }

    let Some(providers) = root.get_mut("providers").and_then(|v| v.as_object_mut()) else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        if provider_has_runtime_secret(provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        tracing::info!("removed persisted secrets from {}", path.display());
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn env_has_value(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_env_candidates(provider_id)
        .into_iter()
        .any(|key| env_has_value(&key))
}

fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();

    let mut out = vec![format!("{}_API_KEY", normalized)];
    if let Some(known) = codeloom_providers::provider_api_key_env(&provider_id.to_ascii_lowercase()) {
        out.push(known.to_string());
    }
    out.sort();
    out.dedup();
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CODELOOM_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("codeloom").join("config.json"));
    }
    Ok(PathBuf::from(".codeloom/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    add_openai_env(
        &mut root,
        "openai",
        "OPENAI_API_KEY",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
    );
    add_openai_env(
        &mut root,
        "openrouter",
        "OPENROUTER_API_KEY",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
    );
    add_openai_env(
        &mut root,
        "groq",
        "GROQ_API_KEY",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
    );
    add_openai_env(
        &mut root,
        "mistral",
        "MISTRAL_API_KEY",
        "https://api.mistral.ai/v1",
        "codestral-latest",
    );
    add_openai_env(
        &mut root,
        "together",
        "TOGETHER_API_KEY",
        "https://api.together.xyz/v1",
        "Qwen/Qwen2.5-Coder-32B-Instruct",
    );
    add_openai_env(
        &mut root,
        "anthropic",
        "ANTHROPIC_API_KEY",
        "https://api.anthropic.com/v1",
        "claude-3-5-sonnet-latest",
    );
    if let Ok(ollama_url) = std::env::var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": ollama_url,
                        "default_model": "qwen2.5-coder:7b"
                    }
                }
            }),
        );
    } else if std::net::TcpStream::connect("127.0.0.1:11434").is_ok() {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": "http://127.0.0.1:11434/v1",
                        "default_model": "qwen2.5-coder:7b"
                    }
                }
            }),
        );
    }

    if let Ok(url) = std::env::var("CODELOOM_SANDBOX_URL") {
        if !url.trim().is_empty() {
            deep_merge(
                &mut root,
                &json!({ "sandbox": { "kind": "remote", "url": url } }),
            );
        }
    }
    if let Ok(key) = std::env::var("CODELOOM_SANDBOX_API_KEY") {
        if !key.trim().is_empty() {
            deep_merge(&mut root, &json!({ "sandbox": { "api_key": key } }));
        }
    }
    if let Ok(dir) = std::env::var("CODELOOM_CACHE_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "cache": { "dir": dir } }));
        }
    }
    if let Some(threshold) = std::env::var("CODELOOM_SEMANTIC_THRESHOLD")
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|t| (0.0..=1.0).contains(t))
    {
        deep_merge(
            &mut root,
            &json!({ "orchestrator": { "semantic_threshold": threshold } }),
        );
    }
    if let Some(enabled) = std::env::var("CODELOOM_ANALYSIS")
        .ok()
        .and_then(|raw| parse_bool_like(&raw))
    {
        deep_merge(
            &mut root,
            &json!({ "orchestrator": { "analysis_enabled": enabled } }),
        );
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn add_openai_env(root: &mut Value, provider: &str, key_env: &str, default_url: &str, model: &str) {
    if let Ok(api_key) = std::env::var(key_env) {
        if api_key.trim().is_empty() {
            return;
        }
        deep_merge(
            root,
            &json!({
                "providers": {
                    provider: {
                        "api_key": api_key,
                        "url": default_url,
                        "default_model": model
                    }
                }
            }),
        );
    }
}

/// Recursively overlays `overlay` onto `base`; nulls never override.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
