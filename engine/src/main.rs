use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io::Read};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use codeloom_cache::{ExactCache, SemanticCache};
use codeloom_core::{
    build_orchestrator, open_caches, resolve_state_dir, ConfigStore, OrchestratorError,
};
use codeloom_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use codeloom_types::{Context, ContextProfile};

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "openai",
    "openrouter",
    "anthropic",
    "ollama",
    "groq",
    "mistral",
    "together",
];

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "codeloom")]
#[command(about = "Synthesize, validate and run Python programs for workflow tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task against a context and print `{result, metadata}`.
    Run {
        #[arg(long)]
        task: String,
        /// Inline JSON, `@path` or `-` for stdin.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Sandbox timeout in seconds; 0 uses the configured default.
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Statically validate a program against a context shape.
    Validate {
        /// Inline source, `@path` or `-` for stdin.
        #[arg(long)]
        code: String,
        #[arg(long, default_value = "{}")]
        context: String,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Entry, reuse and saved-token counts for both tiers.
    Stats {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            task,
            context,
            timeout,
            provider,
            model,
            api_key,
            config,
            no_cache,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let context = read_json_arg(&context).context("failed to read --context")?;

            let store = open_config(&state_dir, config, overrides).await?;
            let config = store.get().await;
            let orchestrator = build_orchestrator(&config, &state_dir, !no_cache).await?;

            match orchestrator
                .run(&task, context, Duration::from_secs(timeout))
                .await
            {
                Ok(output) => {
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                Err(err) => {
                    println!("{}", serde_json::to_string_pretty(&error_report(&err))?);
                    drop(log_guard);
                    std::process::exit(exit_code(&err));
                }
            }
        }
        Command::Validate { code, context } => {
            let code = read_text_arg(&code).context("failed to read --code")?;
            let context = Context::from_value(read_json_arg(&context)?)?;
            let profile = ContextProfile::from_context(&context);
            let report = codeloom_validator::validate(&code, &profile)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        Command::Cache {
            command: CacheCommand::Stats { config, state_dir },
        } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let store = open_config(&state_dir, config, None).await?;
            let config = store.get().await;
            let caches = open_caches(&config.cache, &state_dir).await;
            let exact = match &caches.exact {
                Some(cache) => serde_json::to_value(cache.stats().await?)?,
                None => Value::Null,
            };
            let semantic = match &caches.semantic {
                Some(cache) => serde_json::to_value(cache.stats().await?)?,
                None => Value::Null,
            };
            let output = json!({
                "cache_dir": codeloom_core::cache_dir(&config.cache, &state_dir),
                "exact": exact,
                "semantic": semantic,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn open_config(
    state_dir: &Path,
    config: Option<String>,
    overrides: Option<Value>,
) -> anyhow::Result<ConfigStore> {
    let config_path = config
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"));
    info!(
        "config paths: state_dir={} config_path={}",
        state_dir.display(),
        config_path.display()
    );
    ConfigStore::new(config_path, overrides).await
}

fn error_report(err: &OrchestratorError) -> Value {
    match err {
        OrchestratorError::SynthesisExhausted {
            task,
            last_code,
            errors,
        } => json!({
            "error": {
                "code": err.code(),
                "message": err.to_string(),
                "task": task,
                "last_code": last_code,
                "errors": errors,
            }
        }),
        OrchestratorError::Schema(_) => json!({
            "error": {
                "code": err.code(),
                "message": err.to_string(),
            }
        }),
    }
}

fn exit_code(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::Schema(_) => 2,
        OrchestratorError::SynthesisExhausted { .. } => 3,
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // api_key/model land on the selected provider, or openai when none is named.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn read_text_arg(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return Ok(fs::read_to_string(path)?);
    }
    Ok(input.to_string())
}

fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    let raw = read_text_arg(input)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloom_types::SchemaBuildError;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("qwen/qwen-2.5-coder-32b-instruct".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("qwen/qwen-2.5-coder-32b-instruct")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_model_and_key_to_openai_without_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            None,
            Some("gpt-4o-mini".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(overrides["providers"]["openai"]["api_key"], json!("sk-test"));
        assert_eq!(
            overrides["providers"]["openai"]["default_model"],
            json!("gpt-4o-mini")
        );
    }

    #[test]
    fn no_flags_means_no_overrides() {
        assert!(build_cli_overrides(None, None, None).expect("overrides").is_none());
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" Groq ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("groq"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[test]
    fn json_args_accept_inline_and_file_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("context.json");
        fs::write(&path, r#"{"a": 2}"#).expect("write");

        assert_eq!(read_json_arg(r#"{"b": 3}"#).expect("inline"), json!({"b": 3}));
        assert_eq!(
            read_json_arg(&format!("@{}", path.display())).expect("file"),
            json!({"a": 2})
        );
        assert!(read_json_arg("not json").is_err());
    }

    #[test]
    fn exhausted_runs_report_their_history() {
        let err = OrchestratorError::SynthesisExhausted {
            task: "sum".to_string(),
            last_code: Some("print(1)".to_string()),
            errors: Vec::new(),
        };
        let report = error_report(&err);
        assert_eq!(report["error"]["code"], "SYNTHESIS_EXHAUSTED");
        assert_eq!(report["error"]["last_code"], "print(1)");
        assert_eq!(exit_code(&err), 3);

        let schema: OrchestratorError = SchemaBuildError::EmptyKey.into();
        assert_eq!(error_report(&schema)["error"]["code"], "SCHEMA_ERROR");
    }
}
