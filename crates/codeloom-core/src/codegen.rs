//! Code generation client: prompt assembly, the documentation tool loop and
//! parsing of the model's reply into a stage-tagged program.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use codeloom_providers::{ChatCompletion, ChatMessage, ProviderRegistry, TokenUsage};
use codeloom_tools::{validate_tool_schemas, ToolRegistry};
use codeloom_types::{ContextProfile, ToolSchema, CONTEXT_ACCESSOR};
use codeloom_validator::{DENIED_MODULES, DYNAMIC_EVAL};

use crate::error::AttemptError;
use crate::state::Stage;

const TOOL_OUTPUT_MAX_CHARS: usize = 6_000;
const INSIGHTS_MAX_CHARS: usize = 4_000;
const FEEDBACK_CODE_MAX_CHARS: usize = 2_500;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("valid fence regex")
});

/// Program returned by the model, tagged with the stage it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Analysis(String),
    Task(String),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Analysis(_) => Stage::Analysis,
            StageOutput::Task(_) => Stage::Task,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            StageOutput::Analysis(code) | StageOutput::Task(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// The model decides whether it needs an analysis pass first.
    SelfDetermine,
    TaskOnly,
}

pub struct GenerationRequest<'a> {
    pub task: &'a str,
    pub profile: &'a ContextProfile,
    pub data_insights: &'a Map<String, Value>,
    pub prior_errors: &'a [AttemptError],
    pub mode: GenerationMode,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub output: StageOutput,
    pub usage: Option<TokenUsage>,
    pub doc_lookups: u32,
    pub provider_id: String,
    pub model_id: Option<String>,
}

#[derive(Clone)]
pub struct CodeGenerator {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    provider_id: Option<String>,
    model_id: Option<String>,
    timeout: Duration,
    max_doc_lookups: usize,
}

impl CodeGenerator {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        provider_id: Option<String>,
        model_id: Option<String>,
        timeout: Duration,
        max_doc_lookups: usize,
    ) -> Self {
        Self {
            providers,
            tools,
            provider_id,
            model_id,
            timeout,
            max_doc_lookups,
        }
    }

    pub async fn generate(&self, request: GenerationRequest<'_>) -> anyhow::Result<Generation> {
        let provider = self
            .providers
            .select_provider(self.provider_id.as_deref())
            .await?;
        let provider_id = provider.info().id;

        let tool_schemas = self.tools.list().await;
        validate_tool_schemas(&tool_schemas)?;
        let tools = (!tool_schemas.is_empty() && self.max_doc_lookups > 0).then_some(tool_schemas);

        let mut messages = vec![
            ChatMessage::system(system_prompt(request.mode, tools.is_some())),
            ChatMessage::user(user_prompt(&request)),
        ];
        let mut usage: Option<TokenUsage> = None;
        let mut doc_lookups = 0u32;

        let completion = loop {
            let offered = if (doc_lookups as usize) < self.max_doc_lookups {
                tools.clone()
            } else {
                None
            };
            let completion = self
                .chat_with_timeout(provider.as_ref(), messages.clone(), offered.as_ref())
                .await?;
            accumulate(&mut usage, completion.usage.as_ref());

            if completion.tool_calls.is_empty() {
                break completion;
            }
            if (doc_lookups as usize) >= self.max_doc_lookups || offered.is_none() {
                messages.push(ChatMessage::assistant(completion.text.clone()));
                messages.push(ChatMessage::user(
                    "Documentation lookups are exhausted. Reply with the final answer now.",
                ));
                let last = self
                    .chat_with_timeout(provider.as_ref(), messages.clone(), None)
                    .await?;
                accumulate(&mut usage, last.usage.as_ref());
                break last;
            }

            messages.push(ChatMessage::assistant_tool_calls(
                completion.text.clone(),
                completion.tool_calls.clone(),
            ));
            for call in &completion.tool_calls {
                doc_lookups += 1;
                let output = match tokio::time::timeout(
                    self.timeout,
                    self.tools.execute(&call.name, call.arguments.clone()),
                )
                .await
                {
                    Ok(Ok(result)) => truncate(&result.output, TOOL_OUTPUT_MAX_CHARS),
                    Ok(Err(err)) => format!("Tool `{}` failed: {err}", call.name),
                    Err(_) => format!("Tool `{}` timed out", call.name),
                };
                tracing::debug!(tool = %call.name, doc_lookups, "documentation lookup finished");
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        };

        let output = parse_stage_output(&completion.text, request.mode)?;
        Ok(Generation {
            output,
            usage,
            doc_lookups,
            provider_id,
            model_id: self.model_id.clone(),
        })
    }

    async fn chat_with_timeout(
        &self,
        provider: &dyn codeloom_providers::Provider,
        messages: Vec<ChatMessage>,
        tools: Option<&Vec<ToolSchema>>,
    ) -> anyhow::Result<ChatCompletion> {
        tokio::time::timeout(
            self.timeout,
            provider.chat(messages, self.model_id.as_deref(), tools.cloned()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("model call timed out after {:?}", self.timeout))?
    }
}

fn accumulate(total: &mut Option<TokenUsage>, usage: Option<&TokenUsage>) {
    let Some(usage) = usage else {
        return;
    };
    let total = total.get_or_insert_with(TokenUsage::default);
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut = input.chars().take(max_chars).collect::<String>();
    format!("{cut}\n...[truncated]")
}

fn system_prompt(mode: GenerationMode, docs_available: bool) -> String {
    let mut parts = vec![format!(
        "You write Python 3 programs that run unattended in an isolated sandbox.\n\
         A dict named `{CONTEXT_ACCESSOR}` is already defined and holds the input data. \
         Read inputs only from `{CONTEXT_ACCESSOR}` using the keys listed in the prompt.\n\
         The program's final action must be printing exactly one line:\n\
         print(json.dumps({{\"status\": \"success\", \"context_updates\": {{...}}}}))\n\
         `context_updates` holds only the new keys your program produces, with JSON-serializable values. \
         On failure print {{\"status\": \"error\", \"context_updates\": {{}}, \"message\": \"...\"}} instead.\n\
         Do not overwrite existing keys. Do not print anything else on the last line.\n\
         Forbidden modules: {}. Forbidden builtins: {}. Do not use os.system, os.popen, os.exec*, os.spawn* or shutil.rmtree.",
        DENIED_MODULES.join(", "),
        DYNAMIC_EVAL.join(", ")
    )];
    if docs_available {
        parts.push(
            "If you are unsure how a third-party library works, call the docs_lookup tool before writing code."
                .to_string(),
        );
    }
    match mode {
        GenerationMode::SelfDetermine => parts.push(
            "Decide first whether you understand the data well enough to solve the task.\n\
             If the structure of the data is unclear (binary payloads, documents, CSV text, nested records), \
             write an analysis program that inspects the data and reports what it finds in `context_updates`; \
             it will run and its findings will be given back to you. Otherwise write the final task program.\n\
             Reply with a single JSON object and nothing else: \
             {\"stage\": \"analysis\" | \"task\", \"code\": \"<python source>\"}"
                .to_string(),
        ),
        GenerationMode::TaskOnly => parts.push(
            "Reply with the Python source of the final task program only: no prose, no explanations."
                .to_string(),
        ),
    }
    parts.join("\n\n")
}

fn user_prompt(request: &GenerationRequest<'_>) -> String {
    let profile = request.profile;
    let mut sections = vec![format!("Task:\n{}", request.task.trim())];

    let schema = if profile.schema.is_empty() {
        "(no data keys)".to_string()
    } else {
        profile.schema.render()
    };
    sections.push(format!("Context keys and types:\n{schema}"));

    if !profile.config.is_empty() {
        sections.push(format!(
            "Credential keys (read them from `{CONTEXT_ACCESSOR}`, never print them):\n{}",
            profile.config.render()
        ));
    }
    if !profile.previews.is_empty() {
        let previews = profile
            .previews
            .iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Sample values:\n{previews}"));
    }
    if !request.data_insights.is_empty() {
        let rendered = serde_json::to_string_pretty(request.data_insights).unwrap_or_default();
        sections.push(format!(
            "Findings from the analysis program:\n{}",
            truncate(&rendered, INSIGHTS_MAX_CHARS)
        ));
    }
    if !request.prior_errors.is_empty() {
        let mut feedback = vec!["Previous attempts failed. Fix every problem listed:".to_string()];
        for error in request.prior_errors {
            feedback.push(format!(
                "- Attempt {} ({} {}):",
                error.attempt,
                error.stage.as_str(),
                error.kind.as_str()
            ));
            for message in &error.messages {
                feedback.push(format!("  * {message}"));
            }
        }
        if let Some(code) = request.prior_errors.iter().rev().find_map(|e| e.code.as_deref()) {
            feedback.push(format!(
                "Last program:\n```python\n{}\n```",
                truncate(code, FEEDBACK_CODE_MAX_CHARS)
            ));
        }
        sections.push(feedback.join("\n"));
    }
    sections.join("\n\n")
}

/// Removes a surrounding markdown fence, keeping the first fenced block if prose surrounds it.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(captures) = CODE_FENCE.captures(trimmed) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim_end().to_string();
        }
    }
    trimmed
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

#[derive(Deserialize)]
struct StagedReply {
    stage: String,
    code: String,
}

fn parse_staged_reply(text: &str) -> Option<StagedReply> {
    let candidate = strip_code_fences(text);
    if let Ok(reply) = serde_json::from_str::<StagedReply>(&candidate) {
        return Some(reply);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<StagedReply>(&text[start..=end]).ok()
}

/// Turns the model's reply into a stage-tagged program.
pub fn parse_stage_output(text: &str, mode: GenerationMode) -> anyhow::Result<StageOutput> {
    let output = match parse_staged_reply(text) {
        Some(reply) => {
            let code = strip_code_fences(&reply.code);
            match reply.stage.trim().to_ascii_lowercase().as_str() {
                "analysis" => StageOutput::Analysis(code),
                "task" => StageOutput::Task(code),
                other => anyhow::bail!("model returned unknown stage `{other}`"),
            }
        }
        None => {
            if mode == GenerationMode::SelfDetermine {
                tracing::debug!("model reply was not a staged JSON object; treating it as task code");
            }
            StageOutput::Task(strip_code_fences(text))
        }
    };
    if output.code().trim().is_empty() {
        anyhow::bail!("model returned no code");
    }
    if mode == GenerationMode::TaskOnly {
        if let StageOutput::Analysis(_) = output {
            anyhow::bail!("model asked for an analysis pass after the analysis decision was made");
        }
    }
    Ok(output)
}
