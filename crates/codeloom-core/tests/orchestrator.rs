use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use codeloom_cache::{
    CacheError, CacheResult, ExactCache, InMemoryExactCache, SemanticCache,
};
use codeloom_core::{
    AnalysisStatus, AttemptErrorKind, Orchestrator, OrchestratorError, OrchestratorSettings,
    ResultSource, TierOutcome, MAX_TASK_ATTEMPTS,
};
use codeloom_providers::{ChatCompletion, ChatMessage, Provider, ProviderRegistry, TokenUsage};
use codeloom_sandbox::{RawExecution, SandboxBackend, SandboxClient, SandboxFailure, SandboxRequest};
use codeloom_tools::ToolRegistry;
use codeloom_types::{
    CacheEntry, CacheStats, Context, ContextProfile, NewCacheEntry, ProviderInfo, SemanticMatch,
    ToolSchema,
};

const SUM_CODE: &str = "import json\n\
total = context['a'] + context['b']\n\
print(json.dumps({'status': 'success', 'context_updates': {'total': total}}))";

const VALID_VERDICT: &str = r#"{"valid": true, "reason": "total holds the sum"}"#;

fn staged(stage: &str, code: &str) -> String {
    json!({"stage": stage, "code": code}).to_string()
}

#[derive(Default)]
struct Script {
    generations: Mutex<VecDeque<String>>,
    verdicts: Mutex<VecDeque<String>>,
    generation_prompts: Mutex<Vec<String>>,
    /// Per generation call: whether the analysis choice was offered.
    analysis_offered: Mutex<Vec<bool>>,
    verdict_calls: Mutex<u32>,
}

impl Script {
    fn with_generations(replies: &[String]) -> Arc<Self> {
        let script = Self::default();
        script
            .generations
            .lock()
            .expect("lock")
            .extend(replies.iter().cloned());
        Arc::new(script)
    }

    fn push_verdict(&self, verdict: &str) {
        self.verdicts.lock().expect("lock").push_back(verdict.to_string());
    }

    fn generation_calls(&self) -> usize {
        self.generation_prompts.lock().expect("lock").len()
    }

    fn prompt(&self, index: usize) -> String {
        self.generation_prompts.lock().expect("lock")[index].clone()
    }

    fn analysis_offers(&self) -> Vec<bool> {
        self.analysis_offered.lock().expect("lock").clone()
    }
}

struct ScriptedProvider {
    script: Arc<Script>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: Vec::new(),
        }
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
    ) -> anyhow::Result<ChatCompletion> {
        let judging = messages
            .first()
            .is_some_and(|m| m.content.contains("output accomplishes a task"));
        let text = if judging {
            *self.script.verdict_calls.lock().expect("lock") += 1;
            self.script
                .verdicts
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| VALID_VERDICT.to_string())
        } else {
            let user = messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let offered = messages
                .first()
                .is_some_and(|m| m.content.contains("\"stage\""));
            self.script.analysis_offered.lock().expect("lock").push(offered);
            self.script.generation_prompts.lock().expect("lock").push(user);
            self.script
                .generations
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))?
        };
        Ok(ChatCompletion {
            text,
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            }),
        })
    }
}

type Outcome = Result<RawExecution, SandboxFailure>;

/// Replies to a program by the first marker its source contains.
struct ScriptedBackend {
    replies: Vec<(&'static str, Outcome)>,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure> {
        let program = request
            .code
            .split_once('\n')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        self.seen.lock().expect("lock").push(program.clone());
        self.replies
            .iter()
            .find(|(marker, _)| program.contains(marker))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| Err(SandboxFailure::Transport("no scripted reply".to_string())))
    }
}

fn declared(updates: Value) -> RawExecution {
    RawExecution {
        stdout: format!(
            "{}\n",
            json!({"status": "success", "context_updates": updates})
        ),
        stderr: String::new(),
        exit_code: 0,
        declared_output: None,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    sandbox_seen: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(
        script: Arc<Script>,
        replies: Vec<(&'static str, RawExecution)>,
        settings: OrchestratorSettings,
    ) -> Self {
        let outcomes = replies
            .into_iter()
            .map(|(marker, raw)| (marker, Ok(raw)))
            .collect();
        Self::with_outcomes(script, outcomes, settings)
    }

    fn with_outcomes(
        script: Arc<Script>,
        replies: Vec<(&'static str, Outcome)>,
        settings: OrchestratorSettings,
    ) -> Self {
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider { script });
        let providers = ProviderRegistry::from_providers(vec![provider], None);
        let sandbox_seen = Arc::new(Mutex::new(Vec::new()));
        let sandbox = SandboxClient::new(ScriptedBackend {
            replies,
            seen: sandbox_seen.clone(),
        });
        Self {
            orchestrator: Orchestrator::new(providers, ToolRegistry::empty(), Arc::new(sandbox), settings),
            sandbox_seen,
        }
    }

    fn exact(mut self, cache: Arc<dyn ExactCache>) -> Self {
        self.orchestrator = self.orchestrator.with_exact_cache(cache);
        self
    }

    fn semantic(mut self, cache: Arc<dyn SemanticCache>) -> Self {
        self.orchestrator = self.orchestrator.with_semantic_cache(cache);
        self
    }

    fn sandbox_runs(&self) -> Vec<String> {
        self.sandbox_seen.lock().expect("lock").clone()
    }
}

fn sum_replies() -> Vec<(&'static str, RawExecution)> {
    vec![("context['a'] + context['b']", declared(json!({"total": 5})))]
}

const RUN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn sums_two_numbers_on_the_first_attempt() {
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    let exact = Arc::new(InMemoryExactCache::new());
    let harness = Harness::new(script, sum_replies(), OrchestratorSettings::default())
        .exact(exact.clone());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert_eq!(output.result.get("total"), Some(&json!(5)));
    let meta = &output.metadata;
    assert_eq!(meta.execution_metadata.attempts, 1);
    assert!(meta.execution_metadata.errors.is_empty());
    assert_eq!(meta.execution_metadata.updated_keys, vec!["total".to_string()]);
    assert_eq!(meta.execution_metadata.libraries, vec!["json".to_string()]);
    assert_eq!(meta.cache_metadata.source, ResultSource::Generated);
    assert_eq!(meta.cache_metadata.exact, TierOutcome::Miss);
    assert!(meta.cache_metadata.persisted);
    assert_eq!(meta.ai_metadata.total_tokens, 120);
    assert_eq!(meta.ai_metadata.provider_id.as_deref(), Some("scripted"));
    assert_eq!(harness.sandbox_runs().len(), 1);
    assert_eq!(exact.len().await, 1);
}

#[tokio::test]
async fn analysis_findings_reach_the_task_prompt() {
    let analysis = "import base64\nimport json\n\
raw = base64.b64decode(context['pdf_data'])\n\
print(json.dumps({'status': 'success', 'context_updates': {'byte_count': len(raw), 'starts_with_pdf': raw[:4] == b'%PDF'}}))";
    let task = "import json\n\
total = 42.5\n\
print(json.dumps({'status': 'success', 'context_updates': {'invoice_total': total}}))";
    let script = Script::with_generations(&[staged("analysis", analysis), staged("task", task)]);
    let replies = vec![
        (
            "b64decode",
            declared(json!({"byte_count": 72, "starts_with_pdf": true})),
        ),
        ("invoice_total", declared(json!({"invoice_total": 42.5}))),
    ];
    let harness = Harness::new(script.clone(), replies, OrchestratorSettings::default());
    let pdf = "JVBERi0xLjQKJcfsj6IKNSAwIG9iago8PC9MZW5ndGggNiAwIFIvRmlsdGVyIC9GbGF0ZURlY29kZT4+CnN0cmVhbQp4";

    let output = harness
        .orchestrator
        .run(
            "extract invoice total from this PDF",
            json!({"pdf_data": pdf}),
            RUN_TIMEOUT,
        )
        .await
        .expect("run");

    assert_eq!(output.result.get("invoice_total"), Some(&json!(42.5)));
    assert_eq!(script.generation_calls(), 2);
    assert!(!script.prompt(0).contains("Findings from the analysis program"));
    let second = script.prompt(1);
    assert!(second.contains("Findings from the analysis program"));
    assert!(second.contains("byte_count"));

    let ai = &output.metadata.ai_metadata;
    assert_eq!(
        ai.analysis,
        AnalysisStatus::Completed {
            keys: vec!["byte_count".to_string(), "starts_with_pdf".to_string()]
        }
    );
    assert!(!ai.data_insights.is_empty());
    assert_eq!(ai.generation_calls, 2);
    // Analysis findings are insights, not results.
    assert!(!output.result.contains_key("byte_count"));
    assert_eq!(output.metadata.execution_metadata.attempts, 1);
}

/// Always answers with one candidate, ignoring the threshold it is given.
struct FixedSemanticCache {
    candidate: CacheEntry,
    similarity: f64,
    excluded_seen: Mutex<Vec<String>>,
    reused: Mutex<Vec<String>>,
}

impl FixedSemanticCache {
    fn new(candidate: CacheEntry, similarity: f64) -> Arc<Self> {
        Arc::new(Self {
            candidate,
            similarity,
            excluded_seen: Mutex::new(Vec::new()),
            reused: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SemanticCache for FixedSemanticCache {
    async fn search(
        &self,
        _query: &str,
        _threshold: f64,
        _top_k: usize,
        excluded_ids: &[String],
    ) -> CacheResult<Vec<SemanticMatch>> {
        self.excluded_seen
            .lock()
            .expect("lock")
            .extend(excluded_ids.iter().cloned());
        Ok(vec![SemanticMatch {
            entry: self.candidate.clone(),
            similarity: self.similarity,
        }])
    }

    async fn save(&self, _entry: &CacheEntry) -> CacheResult<()> {
        Ok(())
    }

    async fn record_reuse(&self, id: &str) -> CacheResult<()> {
        self.reused.lock().expect("lock").push(id.to_string());
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats::default())
    }
}

fn cached_entry(task: &str, context: Value, code: &str) -> CacheEntry {
    let context = Context::from_value(context).expect("context");
    let profile = ContextProfile::from_context(&context);
    CacheEntry::new(NewCacheEntry {
        fingerprint: profile.fingerprint(task),
        task: task.to_string(),
        description: task.to_string(),
        schema: profile.schema,
        config: profile.config,
        code: code.to_string(),
        libraries: vec!["json".to_string()],
        generation_tokens: 500,
    })
}

#[tokio::test]
async fn semantic_candidate_below_threshold_is_never_executed() {
    let candidate_code = "import json\n\
cached_candidate = context['a'] * context['b']\n\
print(json.dumps({'status': 'success', 'context_updates': {'product': cached_candidate}}))";
    let semantic = FixedSemanticCache::new(
        cached_entry("multiply two numbers", json!({"a": 1, "b": 1}), candidate_code),
        0.80,
    );
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    let mut replies = sum_replies();
    replies.push(("cached_candidate", declared(json!({"product": 6}))));
    let harness = Harness::new(script.clone(), replies, OrchestratorSettings::default());
    let harness = harness.semantic(semantic.clone());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert!(harness
        .sandbox_runs()
        .iter()
        .all(|code| !code.contains("cached_candidate")));
    assert_eq!(script.generation_calls(), 1);
    assert_eq!(output.metadata.cache_metadata.semantic, TierOutcome::Miss);
    assert_eq!(output.metadata.cache_metadata.semantic_candidates_tried, 0);
    assert!(semantic.reused.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn semantic_candidate_above_threshold_is_reused_without_generation() {
    let semantic = FixedSemanticCache::new(
        cached_entry("add the two numbers", json!({"a": 1, "b": 1}), SUM_CODE),
        0.93,
    );
    let script = Script::with_generations(&[]);
    let harness = Harness::new(script.clone(), sum_replies(), OrchestratorSettings::default());
    let harness = harness.semantic(semantic.clone());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert_eq!(output.result.get("total"), Some(&json!(5)));
    assert_eq!(script.generation_calls(), 0);
    assert_eq!(*script.verdict_calls.lock().expect("lock"), 1);
    let cache = &output.metadata.cache_metadata;
    assert_eq!(cache.source, ResultSource::SemanticCache);
    assert_eq!(cache.semantic, TierOutcome::Hit);
    assert_eq!(cache.similarity, Some(0.93));
    assert_eq!(
        semantic.reused.lock().expect("lock").as_slice(),
        [semantic.candidate.id.clone()]
    );
}

#[tokio::test]
async fn semantic_candidate_judged_invalid_falls_through_to_generation() {
    let semantic = FixedSemanticCache::new(
        cached_entry("add the two numbers", json!({"a": 1, "b": 1}), SUM_CODE),
        0.95,
    );
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    script.push_verdict(r#"{"valid": false, "reason": "expected a difference, got a sum"}"#);
    let harness = Harness::new(script.clone(), sum_replies(), OrchestratorSettings::default());
    let harness = harness.semantic(semantic.clone());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    let cache = &output.metadata.cache_metadata;
    assert_eq!(cache.semantic, TierOutcome::Rejected);
    assert_eq!(cache.semantic_candidates_tried, 1);
    assert_eq!(cache.source, ResultSource::Generated);
    assert_eq!(script.generation_calls(), 1);
    assert!(semantic.reused.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn missing_declared_output_is_an_execution_failure_and_retries() {
    let silent = "total = context['a'] + context['b']\nprint('silent_done', total)";
    let script = Script::with_generations(&[staged("task", silent), staged("task", SUM_CODE)]);
    let replies = vec![
        (
            "silent_done",
            RawExecution {
                stdout: "silent_done 5\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                declared_output: None,
            },
        ),
        ("context['a'] + context['b']", declared(json!({"total": 5}))),
    ];
    let harness = Harness::new(script.clone(), replies, OrchestratorSettings::default());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    let details = &output.metadata.execution_metadata;
    assert_eq!(details.attempts, 2);
    assert_eq!(details.errors.len(), 1);
    assert_eq!(details.errors[0].kind, AttemptErrorKind::Execution);
    assert!(details.errors[0].messages[0].contains("declared output"));
    assert_eq!(output.result.get("total"), Some(&json!(5)));
    assert!(script.prompt(1).contains("Previous attempts failed"));
    assert!(script.prompt(1).contains("silent_done"));
}

#[tokio::test]
async fn always_invalid_code_stops_after_three_attempts() {
    let bad = "import subprocess\nimport json\nprint(json.dumps({'status': 'success', 'context_updates': {'x': 1}}))";
    let replies = (0..5).map(|_| staged("task", bad)).collect::<Vec<_>>();
    let script = Script::with_generations(&replies);
    let harness = Harness::new(script.clone(), Vec::new(), OrchestratorSettings::default());

    let err = harness
        .orchestrator
        .run("list running processes", json!({}), RUN_TIMEOUT)
        .await
        .expect_err("exhausted");

    assert_eq!(script.generation_calls(), MAX_TASK_ATTEMPTS as usize);
    assert!(harness.sandbox_runs().is_empty());
    match err {
        OrchestratorError::SynthesisExhausted {
            task,
            last_code,
            errors,
        } => {
            assert_eq!(task, "list running processes");
            assert_eq!(last_code.as_deref(), Some(bad));
            assert_eq!(errors.len(), 3);
            assert!(errors.iter().all(|e| e.kind == AttemptErrorKind::Validation));
            assert_eq!(
                errors.iter().map(|e| e.attempt).collect::<Vec<_>>(),
                vec![1, 2, 3]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn provider_failures_consume_the_attempt_budget() {
    let script = Script::with_generations(&[]);
    let harness = Harness::new(script.clone(), Vec::new(), OrchestratorSettings::default());

    let err = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect_err("exhausted");

    assert_eq!(err.code(), "SYNTHESIS_EXHAUSTED");
    assert_eq!(script.generation_calls(), 3);
    if let OrchestratorError::SynthesisExhausted { errors, last_code, .. } = err {
        assert!(last_code.is_none());
        assert!(errors.iter().all(|e| e.kind == AttemptErrorKind::Generation));
    }
}

#[tokio::test]
async fn warm_exact_cache_answers_without_calling_the_model() {
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    let exact = Arc::new(InMemoryExactCache::new());
    let harness = Harness::new(script.clone(), sum_replies(), OrchestratorSettings::default());
    let harness = harness.exact(exact.clone());

    harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("first run");
    let generations = script.generation_calls();
    let verdicts = *script.verdict_calls.lock().expect("lock");

    // Different values, same shape and whitespace-insensitive task text.
    let second = harness
        .orchestrator
        .run("sum  two numbers", json!({"a": 10, "b": 20}), RUN_TIMEOUT)
        .await
        .expect("second run");

    assert_eq!(script.generation_calls(), generations);
    assert_eq!(*script.verdict_calls.lock().expect("lock"), verdicts);
    let cache = &second.metadata.cache_metadata;
    assert_eq!(cache.source, ResultSource::ExactCache);
    assert_eq!(cache.exact, TierOutcome::Hit);
    assert_eq!(cache.reuse_count, Some(0));
    assert_eq!(second.metadata.execution_metadata.attempts, 0);

    let fingerprint = cache.fingerprint.clone();
    let stored = exact.lookup(&fingerprint).await.expect("lookup").expect("entry");
    assert_eq!(stored.reuse_count, 1);
    assert_eq!(stored.cost_saved, stored.generation_tokens);
}

#[tokio::test]
async fn failing_exact_hit_is_excluded_from_the_semantic_search() {
    let broken = "import json\n\
broken_cached = context['a']\n\
print(json.dumps({'status': 'success', 'context_updates': {'total': broken_cached}}))";
    let exact = Arc::new(InMemoryExactCache::new());
    let entry = cached_entry("sum two numbers", json!({"a": 2, "b": 3}), broken);
    exact.save(&entry).await.expect("save");
    let semantic = FixedSemanticCache::new(
        cached_entry("unrelated", json!({"x": 1}), "x = 1"),
        0.10,
    );
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    let mut replies = sum_replies();
    replies.push((
        "broken_cached",
        RawExecution {
            stdout: String::new(),
            stderr: "KeyError: 'b'".to_string(),
            exit_code: 1,
            declared_output: None,
        },
    ));
    let harness = Harness::new(script, replies, OrchestratorSettings::default());
    let harness = harness.exact(exact.clone()).semantic(semantic.clone());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert_eq!(output.metadata.cache_metadata.exact, TierOutcome::Rejected);
    assert_eq!(
        semantic.excluded_seen.lock().expect("lock").as_slice(),
        [entry.id.clone()]
    );
    assert_eq!(output.result.get("total"), Some(&json!(5)));
}

#[tokio::test]
async fn caller_keys_survive_and_reserved_keys_never_leak() {
    let code = "import json\n\
total = context['a'] + context['b']\n\
print(json.dumps({'status': 'success', 'context_updates': {'a': 100, '__trace': 'x', 'total': total}}))";
    let script = Script::with_generations(&[staged("task", code)]);
    let replies = vec![(
        "'__trace'",
        declared(json!({"a": 100, "__trace": "x", "total": 5})),
    )];
    let harness = Harness::new(script, replies, OrchestratorSettings::default());
    let input = json!({"a": 2, "b": 3, "label": "pair"});

    let output = harness
        .orchestrator
        .run("sum two numbers", input.clone(), RUN_TIMEOUT)
        .await
        .expect("run");

    for (key, value) in input.as_object().expect("object") {
        assert_eq!(output.result.get(key), Some(value), "key {key} changed");
    }
    assert!(output.result.keys().all(|k| !k.starts_with("__")));
    assert_eq!(
        output.metadata.execution_metadata.ignored_overwrites,
        vec!["a".to_string()]
    );
}

#[tokio::test]
async fn rejected_output_feeds_the_reason_into_the_next_attempt() {
    let script = Script::with_generations(&[staged("task", SUM_CODE), staged("task", SUM_CODE)]);
    script.push_verdict(r#"{"valid": false, "reason": "expected total as an integer, got a string"}"#);
    let harness = Harness::new(script.clone(), sum_replies(), OrchestratorSettings::default());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    let details = &output.metadata.execution_metadata;
    assert_eq!(details.attempts, 2);
    assert_eq!(details.errors[0].kind, AttemptErrorKind::Validation);
    assert!(script.prompt(1).contains("expected total as an integer"));
    assert_eq!(output.metadata.ai_metadata.output_validation.len(), 2);
}

#[tokio::test]
async fn disabled_output_validation_still_rejects_error_keys() {
    let code = "import json\nprint(json.dumps({'status': 'success', 'context_updates': {'error': 'no rows'}}))";
    let script = Script::with_generations(&[staged("task", code), staged("task", SUM_CODE)]);
    let replies = vec![
        ("'no rows'", declared(json!({"error": "no rows"}))),
        ("context['a'] + context['b']", declared(json!({"total": 5}))),
    ];
    let settings = OrchestratorSettings {
        output_validation: false,
        analysis_enabled: false,
        ..OrchestratorSettings::default()
    };
    let harness = Harness::new(script.clone(), replies, settings);

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert_eq!(output.metadata.execution_metadata.attempts, 2);
    assert_eq!(*script.verdict_calls.lock().expect("lock"), 0);
    assert!(script.prompt(1).contains("error-shaped keys"));
    assert_eq!(output.metadata.ai_metadata.analysis, AnalysisStatus::NotRun);
}

#[tokio::test]
async fn non_object_context_is_a_schema_error() {
    let script = Script::with_generations(&[]);
    let harness = Harness::new(script.clone(), Vec::new(), OrchestratorSettings::default());

    let err = harness
        .orchestrator
        .run("sum", json!([1, 2]), RUN_TIMEOUT)
        .await
        .expect_err("schema error");

    assert!(matches!(err, OrchestratorError::Schema(_)));
    assert_eq!(script.generation_calls(), 0);
}

#[test]
fn fingerprint_ignores_secret_values_and_payload_size() {
    let small = "QUJDRGVmZ2gxMjM0".repeat(300);
    let large = "QUJDRGVmZ2gxMjM0".repeat(900);
    let profile = |password: &str, blob: &str| {
        let context = Context::from_value(json!({
            "db_password": password,
            "attachment": blob,
            "rows": 3
        }))
        .expect("context");
        ContextProfile::from_context(&context)
    };
    let first = profile("hunter2", &small).fingerprint("archive attachment");
    let second = profile("correct horse", &large).fingerprint("archive attachment");
    assert_eq!(first, second);
    assert_ne!(
        first,
        profile("hunter2", &small).fingerprint("delete attachment")
    );
}

/// Both tiers fail every call.
struct UnreachableCache;

#[async_trait]
impl ExactCache for UnreachableCache {
    async fn lookup(&self, _fingerprint: &str) -> CacheResult<Option<CacheEntry>> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn save(&self, _entry: &CacheEntry) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn record_reuse(&self, _id: &str) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl SemanticCache for UnreachableCache {
    async fn search(
        &self,
        _query: &str,
        _threshold: f64,
        _top_k: usize,
        _excluded_ids: &[String],
    ) -> CacheResult<Vec<SemanticMatch>> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn save(&self, _entry: &CacheEntry) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn record_reuse(&self, _id: &str) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unavailable_caches_are_skipped() {
    let script = Script::with_generations(&[staged("task", SUM_CODE)]);
    let harness = Harness::new(script, sum_replies(), OrchestratorSettings::default());
    let cache = Arc::new(UnreachableCache);
    let harness = harness.exact(cache.clone()).semantic(cache);

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    let meta = &output.metadata.cache_metadata;
    assert_eq!(meta.exact, TierOutcome::Unavailable);
    assert_eq!(meta.semantic, TierOutcome::Unavailable);
    assert!(!meta.persisted);
    assert!(meta.errors.len() >= 4);
    assert_eq!(output.result.get("total"), Some(&json!(5)));
}

#[tokio::test]
async fn analysis_is_not_offered_again_after_a_task_attempt() {
    let bad = "import subprocess\nimport json\nprint(json.dumps({'status': 'success', 'context_updates': {'x': 1}}))";
    let analysis = "import json\nprint(json.dumps({'status': 'success', 'context_updates': {'late_insight': 1}}))";
    let script = Script::with_generations(&[
        staged("task", bad),
        staged("analysis", analysis),
        staged("task", SUM_CODE),
    ]);
    let mut replies = sum_replies();
    replies.push(("late_insight", declared(json!({"late_insight": 1}))));
    let harness = Harness::new(script.clone(), replies, OrchestratorSettings::default());

    let output = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect("run");

    assert_eq!(script.analysis_offers(), vec![true, false, false]);
    assert_eq!(output.metadata.ai_metadata.analysis, AnalysisStatus::NotRun);
    assert!(output.metadata.ai_metadata.data_insights.is_empty());
    let details = &output.metadata.execution_metadata;
    assert_eq!(details.attempts, 3);
    assert_eq!(
        details.errors.iter().map(|e| e.kind).collect::<Vec<_>>(),
        vec![AttemptErrorKind::Validation, AttemptErrorKind::Generation]
    );
    assert!(harness
        .sandbox_runs()
        .iter()
        .all(|code| !code.contains("late_insight")));
    assert_eq!(output.result.get("total"), Some(&json!(5)));
}

#[tokio::test]
async fn sandbox_timeouts_count_against_the_attempt_budget() {
    let replies = (0..5).map(|_| staged("task", SUM_CODE)).collect::<Vec<_>>();
    let script = Script::with_generations(&replies);
    let outcomes = vec![(
        "context['a'] + context['b']",
        Err(SandboxFailure::Timeout(Duration::from_secs(5))),
    )];
    let harness = Harness::with_outcomes(script.clone(), outcomes, OrchestratorSettings::default());

    let err = harness
        .orchestrator
        .run("sum two numbers", json!({"a": 2, "b": 3}), RUN_TIMEOUT)
        .await
        .expect_err("exhausted");

    assert_eq!(script.generation_calls(), MAX_TASK_ATTEMPTS as usize);
    assert_eq!(harness.sandbox_runs().len(), MAX_TASK_ATTEMPTS as usize);
    assert!(script.prompt(1).contains("timed out"));
    assert!(script.prompt(2).contains("Attempt 2"));
    match err {
        OrchestratorError::SynthesisExhausted { errors, last_code, .. } => {
            assert_eq!(last_code.as_deref(), Some(SUM_CODE));
            assert_eq!(
                errors.iter().map(|e| e.attempt).collect::<Vec<_>>(),
                vec![1, 2, 3]
            );
            assert!(errors.iter().all(|e| e.kind == AttemptErrorKind::Execution));
            assert!(errors.iter().all(|e| e.messages[0].contains("timed out")));
        }
        other => panic!("unexpected error: {other}"),
    }
}
