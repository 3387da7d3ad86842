//! The synthesis state machine.
//!
//! A run walks the exact cache, the semantic cache, an optional analysis pass
//! and then at most [`MAX_TASK_ATTEMPTS`] generate/validate/execute/judge
//! attempts. Recoverable failures are folded into an [`ExecutionState`] value
//! and only surface as [`OrchestratorError::SynthesisExhausted`] once the
//! budget is spent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Level;

use codeloom_cache::{ExactCache, SemanticCache};
use codeloom_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use codeloom_providers::ProviderRegistry;
use codeloom_sandbox::{Sandbox, SandboxResult};
use codeloom_tools::ToolRegistry;
use codeloom_types::{
    normalize_task, CacheEntry, Context, ContextProfile, NewCacheEntry, SemanticMatch,
};
use codeloom_validator::ValidationReport;

use crate::codegen::{CodeGenerator, GenerationMode, GenerationRequest, StageOutput};
use crate::config::OrchestratorSettings;
use crate::error::{AttemptError, AttemptErrorKind, OrchestratorError};
use crate::metadata::{ExecutionMetadata, ResultSource, TierOutcome};
use crate::output_validator::{context_changes, precheck, OutputValidator, OutputVerdict};
use crate::state::{ContextState, ExecutionState, Stage, VerdictRecord, VerdictStatus};

/// Task attempts per run. Not configurable.
pub const MAX_TASK_ATTEMPTS: u32 = 3;

const COMPONENT: &str = "orchestrator";
const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    /// Caller context plus the keys produced by the run; never carries reserved keys.
    pub result: Map<String, Value>,
    pub metadata: ExecutionMetadata,
}

/// Natural-language description used both to index and to query the semantic tier.
pub fn describe(task: &str, profile: &ContextProfile) -> String {
    let mut lines = vec![format!("Task: {}", normalize_task(task))];
    if !profile.schema.is_empty() {
        lines.push(format!(
            "Inputs: {}",
            profile
                .schema
                .iter()
                .map(|(k, v)| format!("{k} ({v})"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if !profile.config.is_empty() {
        lines.push(format!(
            "Credentials: {}",
            profile
                .config
                .iter()
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    lines.join("\n")
}

struct RunScope {
    run_id: String,
    fingerprint: String,
}

impl RunScope {
    fn event<'a>(&'a self, name: &'a str) -> ObservabilityEvent<'a> {
        ObservabilityEvent {
            event: name,
            component: COMPONENT,
            run_id: Some(&self.run_id),
            fingerprint: Some(&self.fingerprint),
            ..ObservabilityEvent::default()
        }
    }
}

struct Accepted {
    state: ContextState,
    execution: SandboxResult,
    applied: Vec<String>,
}

struct TaskSuccess {
    accepted: Accepted,
    code: String,
    report: ValidationReport,
}

pub struct Orchestrator {
    generator: CodeGenerator,
    output_validator: OutputValidator,
    sandbox: Arc<dyn Sandbox>,
    exact_cache: Option<Arc<dyn ExactCache>>,
    semantic_cache: Option<Arc<dyn SemanticCache>>,
    settings: OrchestratorSettings,
    cache_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        sandbox: Arc<dyn Sandbox>,
        settings: OrchestratorSettings,
    ) -> Self {
        let llm_timeout = Duration::from_secs(settings.llm_timeout_secs.max(1));
        let generator = CodeGenerator::new(
            providers.clone(),
            tools,
            settings.provider.clone(),
            settings.generation_model.clone(),
            llm_timeout,
            settings.max_doc_lookups,
        );
        let output_validator = OutputValidator::new(
            providers,
            settings.provider.clone(),
            settings.judge_model(),
            llm_timeout,
        );
        Self {
            generator,
            output_validator,
            sandbox,
            exact_cache: None,
            semantic_cache: None,
            settings,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    pub fn with_exact_cache(mut self, cache: Arc<dyn ExactCache>) -> Self {
        self.exact_cache = Some(cache);
        self
    }

    pub fn with_semantic_cache(mut self, cache: Arc<dyn SemanticCache>) -> Self {
        self.semantic_cache = Some(cache);
        self
    }

    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs `task` against `context`; `timeout` bounds each sandbox execution (zero means the default).
    pub async fn run(
        &self,
        task: &str,
        context: Value,
        timeout: Duration,
    ) -> Result<RunOutput, OrchestratorError> {
        let started = Instant::now();
        let context = Context::from_value(context)?;
        let exec_timeout = if timeout.is_zero() {
            Duration::from_secs(self.settings.default_exec_timeout_secs.max(1))
        } else {
            timeout
        };
        let profile = ContextProfile::from_context(&context);
        let run = RunScope {
            run_id: uuid::Uuid::new_v4().to_string(),
            fingerprint: profile.fingerprint(task),
        };
        let redacted_task = redact_text(task);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                status: Some("start"),
                detail: Some(redacted_task.as_str()),
                ..run.event("run.start")
            },
        );

        let mut meta = ExecutionMetadata::new(&run.run_id, &run.fingerprint);
        let mut excluded = Vec::new();

        if let Some((entry, accepted)) = self
            .try_exact(&run, &context, exec_timeout, &mut meta, &mut excluded)
            .await
        {
            meta.cache_metadata.semantic = if self.semantic_cache.is_some() {
                TierOutcome::Skipped
            } else {
                TierOutcome::Disabled
            };
            return Ok(self.finish_reused(&run, entry, None, accepted, meta, started));
        }

        if let Some((matched, accepted)) = self
            .try_semantic(&run, task, &context, &profile, exec_timeout, &excluded, &mut meta)
            .await
        {
            let similarity = matched.similarity;
            return Ok(self.finish_reused(
                &run,
                matched.entry,
                Some(similarity),
                accepted,
                meta,
                started,
            ));
        }

        self.synthesize(&run, task, &context, &profile, exec_timeout, meta, started)
            .await
    }

    async fn try_exact(
        &self,
        run: &RunScope,
        context: &Context,
        exec_timeout: Duration,
        meta: &mut ExecutionMetadata,
        excluded: &mut Vec<String>,
    ) -> Option<(CacheEntry, Accepted)> {
        let cache = self.exact_cache.as_ref()?;
        let lookup = match tokio::time::timeout(self.cache_timeout, cache.lookup(&run.fingerprint)).await
        {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                self.tier_unavailable(run, "cache.exact.error", &err.to_string(), meta);
                meta.cache_metadata.exact = TierOutcome::Unavailable;
                return None;
            }
            Err(_) => {
                self.tier_unavailable(run, "cache.exact.error", "lookup timed out", meta);
                meta.cache_metadata.exact = TierOutcome::Unavailable;
                return None;
            }
        };
        let Some(entry) = lookup else {
            meta.cache_metadata.exact = TierOutcome::Miss;
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    status: Some("miss"),
                    ..run.event("cache.exact.miss")
                },
            );
            return None;
        };

        match self.sandbox.execute(&entry.code, context, exec_timeout).await {
            Ok(execution) => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        status: Some("hit"),
                        detail: Some(entry.id.as_str()),
                        ..run.event("cache.exact.hit")
                    },
                );
                meta.cache_metadata.exact = TierOutcome::Hit;
                let mut state = ContextState::new(context.clone());
                let applied = state.apply_updates(&execution.context_updates);
                match tokio::time::timeout(self.cache_timeout, cache.record_reuse(&entry.id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => meta
                        .cache_metadata
                        .errors
                        .push(format!("exact reuse not recorded: {err}")),
                    Err(_) => meta
                        .cache_metadata
                        .errors
                        .push("exact reuse not recorded: timed out".to_string()),
                }
                Some((
                    entry,
                    Accepted {
                        state,
                        execution,
                        applied,
                    },
                ))
            }
            Err(failure) => {
                let detail = failure.to_string();
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        status: Some("rejected"),
                        error_code: Some(failure.code()),
                        detail: Some(detail.as_str()),
                        ..run.event("cache.exact.error")
                    },
                );
                meta.cache_metadata.exact = TierOutcome::Rejected;
                meta.cache_metadata
                    .errors
                    .push(format!("exact entry {} failed to execute: {detail}", entry.id));
                excluded.push(entry.id);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_semantic(
        &self,
        run: &RunScope,
        task: &str,
        context: &Context,
        profile: &ContextProfile,
        exec_timeout: Duration,
        excluded: &[String],
        meta: &mut ExecutionMetadata,
    ) -> Option<(SemanticMatch, Accepted)> {
        let cache = self.semantic_cache.as_ref()?;
        let threshold = self.settings.semantic_threshold;
        let query = describe(task, profile);
        let search = cache.search(&query, threshold, self.settings.semantic_top_k, excluded);
        let matches = match tokio::time::timeout(self.cache_timeout, search).await {
            Ok(Ok(matches)) => matches,
            Ok(Err(err)) => {
                self.tier_unavailable(run, "cache.semantic.error", &err.to_string(), meta);
                meta.cache_metadata.semantic = TierOutcome::Unavailable;
                return None;
            }
            Err(_) => {
                self.tier_unavailable(run, "cache.semantic.error", "search timed out", meta);
                meta.cache_metadata.semantic = TierOutcome::Unavailable;
                return None;
            }
        };
        let candidates = matches
            .into_iter()
            .filter(|m| m.similarity >= threshold && !excluded.contains(&m.entry.id))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            meta.cache_metadata.semantic = TierOutcome::Miss;
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    status: Some("miss"),
                    ..run.event("cache.semantic.miss")
                },
            );
            return None;
        }

        for candidate in candidates {
            meta.cache_metadata.semantic_candidates_tried += 1;
            match self
                .vet_candidate(task, &candidate.entry.code, context, profile, exec_timeout)
                .await
            {
                Ok(accepted) => {
                    let similarity = format!("{:.3}", candidate.similarity);
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            status: Some("hit"),
                            detail: Some(similarity.as_str()),
                            ..run.event("cache.semantic.hit")
                        },
                    );
                    meta.cache_metadata.semantic = TierOutcome::Hit;
                    match tokio::time::timeout(
                        self.cache_timeout,
                        cache.record_reuse(&candidate.entry.id),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => meta
                            .cache_metadata
                            .errors
                            .push(format!("semantic reuse not recorded: {err}")),
                        Err(_) => meta
                            .cache_metadata
                            .errors
                            .push("semantic reuse not recorded: timed out".to_string()),
                    }
                    return Some((candidate, accepted));
                }
                Err(reason) => {
                    tracing::debug!(
                        entry_id = %candidate.entry.id,
                        similarity = candidate.similarity,
                        "semantic candidate rejected: {reason}"
                    );
                    meta.cache_metadata
                        .errors
                        .push(format!("semantic entry {} rejected: {reason}", candidate.entry.id));
                }
            }
        }

        meta.cache_metadata.semantic = TierOutcome::Rejected;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                status: Some("rejected"),
                ..run.event("cache.semantic.miss")
            },
        );
        None
    }

    /// A semantic candidate must pass static checks, run cleanly and satisfy the judge.
    async fn vet_candidate(
        &self,
        task: &str,
        code: &str,
        context: &Context,
        profile: &ContextProfile,
        exec_timeout: Duration,
    ) -> Result<Accepted, String> {
        let report = codeloom_validator::validate(code, profile).map_err(|e| e.to_string())?;
        if !report.valid {
            return Err(report.error_messages().join("; "));
        }
        let execution = self
            .sandbox
            .execute(code, context, exec_timeout)
            .await
            .map_err(|f| f.to_string())?;
        let mut state = ContextState::new(context.clone());
        let applied = state.apply_updates(&execution.context_updates);

        let verdict = if self.settings.output_validation {
            self.output_validator
                .validate(task, context, state.context())
                .await
                .map_err(|e| format!("output could not be judged: {e}"))?
        } else {
            precheck(task, &context_changes(context, state.context())).unwrap_or(OutputVerdict {
                valid: true,
                reason: String::new(),
            })
        };
        if !verdict.valid {
            return Err(verdict.reason);
        }
        Ok(Accepted {
            state,
            execution,
            applied,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize(
        &self,
        run: &RunScope,
        task: &str,
        context: &Context,
        profile: &ContextProfile,
        exec_timeout: Duration,
        mut meta: ExecutionMetadata,
        started: Instant,
    ) -> Result<RunOutput, OrchestratorError> {
        let mut state = ExecutionState::new();
        let mut attempt = 0u32;

        while attempt < MAX_TASK_ATTEMPTS {
            let mode = if self.settings.analysis_enabled && state.analysis_open() {
                GenerationMode::SelfDetermine
            } else {
                GenerationMode::TaskOnly
            };
            let generation = self
                .generator
                .generate(GenerationRequest {
                    task,
                    profile,
                    data_insights: state.data_insights(),
                    prior_errors: state.errors(),
                    mode,
                })
                .await;

            let generation = match generation {
                Ok(generation) => generation,
                Err(err) => {
                    attempt += 1;
                    let detail = err.to_string();
                    emit_event(
                        Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            stage: Some(Stage::Task.as_str()),
                            attempt: Some(attempt),
                            status: Some("failed"),
                            error_code: Some(AttemptErrorKind::Generation.as_str()),
                            detail: Some(detail.as_str()),
                            ..run.event("stage.error")
                        },
                    );
                    state = state.with_generation(None, 0).with_task_attempt(None).with_error(
                        AttemptError::new(
                            attempt,
                            Stage::Task,
                            AttemptErrorKind::Generation,
                            vec![detail],
                            None,
                        ),
                    );
                    continue;
                }
            };
            meta.ai_metadata.provider_id = Some(generation.provider_id.clone());
            meta.ai_metadata.model_id = generation.model_id.clone();
            state = state.with_generation(generation.usage.as_ref(), generation.doc_lookups);

            match generation.output {
                StageOutput::Analysis(code) => {
                    state = self
                        .run_analysis(run, &code, context, profile, exec_timeout, state)
                        .await;
                }
                StageOutput::Task(code) => {
                    attempt += 1;
                    state = state.with_task_attempt(Some(code.clone()));
                    let (next, success) = self
                        .attempt_task(run, task, attempt, code, context, profile, exec_timeout, state)
                        .await;
                    state = next;
                    if let Some(success) = success {
                        return Ok(self
                            .finish_generated(run, task, profile, success, state, meta, started)
                            .await);
                    }
                }
            }
        }

        let detail = format!("{} attempts failed", state.task_attempts());
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                status: Some("exhausted"),
                error_code: Some("SYNTHESIS_EXHAUSTED"),
                detail: Some(detail.as_str()),
                ..run.event("run.exhausted")
            },
        );
        Err(OrchestratorError::SynthesisExhausted {
            task: task.to_string(),
            last_code: state.last_code().map(str::to_string),
            errors: state.into_errors(),
        })
    }

    /// Executes an analysis program once; its declared output becomes data insights.
    async fn run_analysis(
        &self,
        run: &RunScope,
        code: &str,
        context: &Context,
        profile: &ContextProfile,
        exec_timeout: Duration,
        state: ExecutionState,
    ) -> ExecutionState {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                stage: Some(Stage::Analysis.as_str()),
                status: Some("start"),
                ..run.event("stage.start")
            },
        );
        let failure = match codeloom_validator::validate(code, profile) {
            Err(err) => Some(format!("analysis program could not be checked: {err}")),
            Ok(report) if !report.valid => Some(format!(
                "analysis program rejected: {}",
                report.error_messages().join("; ")
            )),
            Ok(_) => None,
        };
        let outcome = match failure {
            Some(reason) => Err(reason),
            None => match self.sandbox.execute(code, context, exec_timeout).await {
                Ok(execution) if execution.context_updates.is_empty() => {
                    Err("analysis program reported no findings".to_string())
                }
                Ok(execution) => Ok(execution.context_updates),
                Err(failure) => Err(failure.feedback()),
            },
        };
        match outcome {
            Ok(insights) => {
                let detail = format!("{} insight keys", insights.len());
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        stage: Some(Stage::Analysis.as_str()),
                        status: Some("ok"),
                        detail: Some(detail.as_str()),
                        ..run.event("stage.finish")
                    },
                );
                state.with_insights(&insights)
            }
            Err(reason) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        stage: Some(Stage::Analysis.as_str()),
                        status: Some("failed"),
                        detail: Some(reason.as_str()),
                        ..run.event("stage.error")
                    },
                );
                state.with_analysis_failure(reason)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_task(
        &self,
        run: &RunScope,
        task: &str,
        attempt: u32,
        code: String,
        context: &Context,
        profile: &ContextProfile,
        exec_timeout: Duration,
        state: ExecutionState,
    ) -> (ExecutionState, Option<TaskSuccess>) {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                stage: Some(Stage::Task.as_str()),
                attempt: Some(attempt),
                status: Some("start"),
                ..run.event("stage.start")
            },
        );
        let fail = |state: ExecutionState, kind: AttemptErrorKind, messages: Vec<String>| {
            let detail = messages.join("; ");
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    stage: Some(Stage::Task.as_str()),
                    attempt: Some(attempt),
                    status: Some("failed"),
                    error_code: Some(kind.as_str()),
                    detail: Some(detail.as_str()),
                    ..run.event("stage.error")
                },
            );
            let error = AttemptError::new(attempt, Stage::Task, kind, messages, Some(code.clone()));
            (state.with_error(error), None)
        };

        let report = match codeloom_validator::validate(&code, profile) {
            Ok(report) => report,
            Err(err) => {
                return fail(state, AttemptErrorKind::Validation, vec![err.to_string()]);
            }
        };
        if !report.valid {
            return fail(state, AttemptErrorKind::Validation, report.error_messages());
        }

        let execution = match self.sandbox.execute(&code, context, exec_timeout).await {
            Ok(execution) => execution,
            Err(failure) => {
                return fail(state, AttemptErrorKind::Execution, vec![failure.feedback()]);
            }
        };
        let mut candidate = ContextState::new(context.clone());
        let applied = candidate.apply_updates(&execution.context_updates);

        let (verdict, record) = if self.settings.output_validation {
            match self
                .output_validator
                .validate(task, context, candidate.context())
                .await
            {
                Ok(verdict) => {
                    let status = if verdict.valid {
                        VerdictStatus::Valid
                    } else {
                        VerdictStatus::Invalid
                    };
                    let record = VerdictRecord {
                        attempt,
                        status,
                        reason: verdict.reason.clone(),
                    };
                    (verdict, record)
                }
                Err(err) => {
                    tracing::warn!(attempt, "output validation skipped: {err}");
                    let record = VerdictRecord {
                        attempt,
                        status: VerdictStatus::Skipped,
                        reason: err.to_string(),
                    };
                    (
                        OutputVerdict {
                            valid: true,
                            reason: String::new(),
                        },
                        record,
                    )
                }
            }
        } else {
            let changes = context_changes(context, candidate.context());
            match precheck(task, &changes) {
                Some(verdict) => {
                    let record = VerdictRecord {
                        attempt,
                        status: VerdictStatus::Invalid,
                        reason: verdict.reason.clone(),
                    };
                    (verdict, record)
                }
                None => (
                    OutputVerdict {
                        valid: true,
                        reason: String::new(),
                    },
                    VerdictRecord {
                        attempt,
                        status: VerdictStatus::Skipped,
                        reason: "output validation disabled".to_string(),
                    },
                ),
            }
        };
        let state = state.with_verdict(record);
        if !verdict.valid {
            return fail(state, AttemptErrorKind::Validation, vec![verdict.reason]);
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                stage: Some(Stage::Task.as_str()),
                attempt: Some(attempt),
                status: Some("ok"),
                ..run.event("stage.finish")
            },
        );
        let success = TaskSuccess {
            accepted: Accepted {
                state: candidate,
                execution,
                applied,
            },
            code,
            report,
        };
        (state, Some(success))
    }

    fn finish_reused(
        &self,
        run: &RunScope,
        entry: CacheEntry,
        similarity: Option<f64>,
        accepted: Accepted,
        mut meta: ExecutionMetadata,
        started: Instant,
    ) -> RunOutput {
        let source = if similarity.is_some() {
            ResultSource::SemanticCache
        } else {
            ResultSource::ExactCache
        };
        let cache = &mut meta.cache_metadata;
        cache.source = source;
        cache.entry_id = Some(entry.id.clone());
        cache.similarity = similarity;
        cache.reuse_count = Some(entry.reuse_count);

        let details = &mut meta.execution_metadata;
        details.code = Some(entry.code);
        details.libraries = entry.libraries;
        self.complete(run, accepted, meta, started)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_generated(
        &self,
        run: &RunScope,
        task: &str,
        profile: &ContextProfile,
        success: TaskSuccess,
        state: ExecutionState,
        mut meta: ExecutionMetadata,
        started: Instant,
    ) -> RunOutput {
        meta.cache_metadata.source = ResultSource::Generated;
        meta.ai_metadata.absorb(&state);
        meta.execution_metadata.attempts = state.task_attempts();
        meta.execution_metadata.errors = state.errors().to_vec();
        meta.execution_metadata.code = Some(success.code.clone());
        meta.execution_metadata.libraries = success.report.libraries.clone();

        let entry = CacheEntry::new(NewCacheEntry {
            fingerprint: run.fingerprint.clone(),
            task: normalize_task(task),
            description: describe(task, profile),
            schema: profile.schema.clone(),
            config: profile.config.clone(),
            code: success.code,
            libraries: success.report.libraries,
            generation_tokens: state.usage().total_tokens,
        });
        self.persist(run, &entry, &mut meta).await;
        self.complete(run, success.accepted, meta, started)
    }

    async fn persist(&self, run: &RunScope, entry: &CacheEntry, meta: &mut ExecutionMetadata) {
        if let Some(cache) = &self.exact_cache {
            match tokio::time::timeout(self.cache_timeout, cache.save(entry)).await {
                Ok(Ok(())) => meta.cache_metadata.persisted = true,
                Ok(Err(err)) => self.tier_unavailable(run, "cache.exact.error", &err.to_string(), meta),
                Err(_) => self.tier_unavailable(run, "cache.exact.error", "save timed out", meta),
            }
        }
        if let Some(cache) = &self.semantic_cache {
            match tokio::time::timeout(self.cache_timeout, cache.save(entry)).await {
                Ok(Ok(())) => meta.cache_metadata.persisted = true,
                Ok(Err(err)) => {
                    self.tier_unavailable(run, "cache.semantic.error", &err.to_string(), meta)
                }
                Err(_) => self.tier_unavailable(run, "cache.semantic.error", "save timed out", meta),
            }
        }
    }

    fn complete(
        &self,
        run: &RunScope,
        accepted: Accepted,
        mut meta: ExecutionMetadata,
        started: Instant,
    ) -> RunOutput {
        let details = &mut meta.execution_metadata;
        details.absorb_execution(&accepted.execution);
        details.updated_keys = accepted.applied;
        details.ignored_overwrites = accepted.state.ignored_overwrites().to_vec();
        details.total_duration_ms = started.elapsed().as_millis() as u64;

        let source = match meta.cache_metadata.source {
            ResultSource::ExactCache => "exact_cache",
            ResultSource::SemanticCache => "semantic_cache",
            ResultSource::Generated => "generated",
        };
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                status: Some("ok"),
                detail: Some(source),
                attempt: Some(meta.execution_metadata.attempts),
                provider_id: meta.ai_metadata.provider_id.as_deref(),
                model_id: meta.ai_metadata.model_id.as_deref(),
                ..run.event("run.finish")
            },
        );
        RunOutput {
            result: accepted.state.into_result(),
            metadata: meta,
        }
    }

    fn tier_unavailable(
        &self,
        run: &RunScope,
        event: &str,
        detail: &str,
        meta: &mut ExecutionMetadata,
    ) {
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                status: Some("unavailable"),
                error_code: Some("CACHE_UNAVAILABLE"),
                detail: Some(detail),
                ..run.event(event)
            },
        );
        meta.cache_metadata.errors.push(format!("{event}: {detail}"));
    }
}
