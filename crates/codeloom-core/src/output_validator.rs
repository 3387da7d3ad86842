//! Judges whether a program's context updates actually accomplish the task.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use codeloom_providers::{ChatMessage, ProviderRegistry};
use codeloom_types::{is_internal_key, is_secret_key, Context};

const VALUE_PREVIEW_CHARS: usize = 300;
const ERROR_SHAPED_KEYS: [&str; 4] = ["error", "errors", "exception", "traceback"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputVerdict {
    pub valid: bool,
    pub reason: String,
}

impl OutputVerdict {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Keys added or changed between two contexts, ignoring reserved keys.
pub fn context_changes(before: &Context, after: &Context) -> Map<String, Value> {
    after
        .iter()
        .filter(|(key, _)| !is_internal_key(key))
        .filter(|(key, value)| before.get(key) != Some(*value))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Rejections that need no model: nothing changed, or an error-shaped key appeared.
pub fn precheck(task: &str, changes: &Map<String, Value>) -> Option<OutputVerdict> {
    if changes.is_empty() {
        return Some(OutputVerdict::invalid(format!(
            "expected new or changed context keys for the task `{}`, but the program produced no changes",
            task.trim()
        )));
    }
    let error_keys = changes
        .keys()
        .filter(|key| ERROR_SHAPED_KEYS.contains(&key.to_ascii_lowercase().as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if !error_keys.is_empty() {
        return Some(OutputVerdict::invalid(format!(
            "expected task results, but the program produced error-shaped keys: {}",
            error_keys.join(", ")
        )));
    }
    None
}

fn preview(key: &str, value: &Value) -> String {
    if is_secret_key(key) {
        return "[redacted]".to_string();
    }
    let rendered = value.to_string();
    if rendered.chars().count() <= VALUE_PREVIEW_CHARS {
        return rendered;
    }
    let cut = rendered.chars().take(VALUE_PREVIEW_CHARS).collect::<String>();
    format!("{cut}...")
}

const RUBRIC: &str = "You check whether a program's output accomplishes a task.\n\
Rules:\n\
- INVALID if no keys were added or changed.\n\
- INVALID if added values are empty, null or zero where that is implausible for the task (a silent failure).\n\
- INVALID if a key describing an error appears in the output.\n\
- INVALID if the task's stated objective is not reflected in any added or changed key.\n\
- VALID otherwise, including legitimately falsy results such as an empty list or a zero count that the task makes plausible.\n\
Reply with a single JSON object: {\"valid\": true|false, \"reason\": \"...\"}. \
When invalid, the reason must state what was expected and what was produced.";

#[derive(Clone)]
pub struct OutputValidator {
    providers: ProviderRegistry,
    provider_id: Option<String>,
    model_id: Option<String>,
    timeout: Duration,
}

impl OutputValidator {
    pub fn new(
        providers: ProviderRegistry,
        provider_id: Option<String>,
        model_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            provider_id,
            model_id,
            timeout,
        }
    }

    /// Returns `Err` only when the model could not be asked or answered unintelligibly.
    pub async fn validate(
        &self,
        task: &str,
        before: &Context,
        after: &Context,
    ) -> anyhow::Result<OutputVerdict> {
        let changes = context_changes(before, after);
        if let Some(verdict) = precheck(task, &changes) {
            return Ok(verdict);
        }

        let existing = before
            .iter()
            .filter(|(k, _)| !is_internal_key(k))
            .map(|(k, v)| format!("- {k}: {}", codeloom_types::TypeTag::of(v)))
            .collect::<Vec<_>>()
            .join("\n");
        let produced = changes
            .iter()
            .map(|(k, v)| {
                let verb = if before.contains_key(k) { "changed" } else { "added" };
                format!("- {k} ({verb}): {}", preview(k, v))
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Task:\n{}\n\nContext before (key: type):\n{}\n\nKeys produced by the program:\n{}",
            task.trim(),
            if existing.is_empty() { "(empty)".to_string() } else { existing },
            produced
        );

        let completion = tokio::time::timeout(
            self.timeout,
            self.providers.chat_for_provider(
                self.provider_id.as_deref(),
                self.model_id.as_deref(),
                vec![ChatMessage::system(RUBRIC), ChatMessage::user(prompt)],
                None,
            ),
        )
        .await
        .map_err(|_| anyhow::anyhow!("output validation timed out after {:?}", self.timeout))??;

        parse_verdict(&completion.text)
            .ok_or_else(|| anyhow::anyhow!("output validator reply was not a verdict object"))
    }
}

fn parse_verdict(text: &str) -> Option<OutputVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let valid = match value.get("valid")? {
        Value::Bool(b) => *b,
        Value::String(s) => crate::config::parse_bool_like(s)?,
        _ => return None,
    };
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let reason = if reason.is_empty() && !valid {
        "output did not satisfy the task".to_string()
    } else {
        reason
    };
    Some(OutputVerdict { valid, reason })
}
