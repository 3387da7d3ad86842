//! Per-run state. Each run owns one [`ContextState`] and threads an
//! [`ExecutionState`] value through its attempt loop.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use codeloom_providers::TokenUsage;
use codeloom_types::{is_internal_key, Context};

use crate::error::AttemptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analysis,
    Task,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Task => "task",
        }
    }
}

/// The working context of one run.
///
/// Keys supplied by the caller are protected: updates that would overwrite
/// them are dropped and reported. Keys added during the run stay writable.
#[derive(Debug, Clone)]
pub struct ContextState {
    context: Context,
    protected: BTreeSet<String>,
    ignored_overwrites: Vec<String>,
}

impl ContextState {
    pub fn new(context: Context) -> Self {
        let protected = context.keys().cloned().collect();
        Self {
            context,
            protected,
            ignored_overwrites: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Applies declared updates and returns the keys actually written.
    pub fn apply_updates(&mut self, updates: &Map<String, Value>) -> Vec<String> {
        let mut applied = Vec::new();
        for (key, value) in updates {
            if is_internal_key(key) {
                tracing::debug!(key = %key, "dropping reserved key from context updates");
                continue;
            }
            if self.protected.contains(key) {
                if self.context.get(key) != Some(value) && !self.ignored_overwrites.contains(key) {
                    self.ignored_overwrites.push(key.clone());
                }
                continue;
            }
            self.context.insert(key.clone(), value.clone());
            applied.push(key.clone());
        }
        applied
    }

    pub fn ignored_overwrites(&self) -> &[String] {
        &self.ignored_overwrites
    }

    /// Functional result handed back to the caller.
    pub fn into_result(self) -> Map<String, Value> {
        self.context.without_internal_keys().into_map()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    NotRun,
    Completed {
        keys: Vec<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Valid,
    Invalid,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub attempt: u32,
    pub status: VerdictStatus,
    pub reason: String,
}

/// Accumulated facts about a run's generation attempts.
///
/// Transitions consume the value and return the next one, so every attempt
/// sees exactly the history that preceded it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    errors: Vec<AttemptError>,
    data_insights: Map<String, Value>,
    analysis: AnalysisStatus,
    usage: TokenUsage,
    generation_calls: u32,
    doc_lookups: u32,
    task_attempts: u32,
    last_code: Option<String>,
    verdicts: Vec<VerdictRecord>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generation(mut self, usage: Option<&TokenUsage>, doc_lookups: u32) -> Self {
        self.generation_calls += 1;
        self.doc_lookups += doc_lookups;
        if let Some(usage) = usage {
            self.usage.prompt_tokens += usage.prompt_tokens;
            self.usage.completion_tokens += usage.completion_tokens;
            self.usage.total_tokens += usage.total_tokens;
        }
        self
    }

    pub fn with_task_attempt(mut self, code: Option<String>) -> Self {
        self.task_attempts += 1;
        if code.is_some() {
            self.last_code = code;
        }
        self
    }

    pub fn with_error(mut self, error: AttemptError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_insights(mut self, insights: &Map<String, Value>) -> Self {
        for (key, value) in insights {
            if is_internal_key(key) {
                continue;
            }
            self.data_insights.insert(key.clone(), value.clone());
        }
        let keys = insights
            .keys()
            .filter(|k| !is_internal_key(k))
            .cloned()
            .collect();
        self.analysis = AnalysisStatus::Completed { keys };
        self
    }

    pub fn with_analysis_failure(mut self, reason: impl Into<String>) -> Self {
        self.analysis = AnalysisStatus::Failed {
            reason: reason.into(),
        };
        self
    }

    pub fn with_verdict(mut self, verdict: VerdictRecord) -> Self {
        self.verdicts.push(verdict);
        self
    }

    pub fn errors(&self) -> &[AttemptError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<AttemptError> {
        self.errors
    }

    pub fn data_insights(&self) -> &Map<String, Value> {
        &self.data_insights
    }

    pub fn analysis(&self) -> &AnalysisStatus {
        &self.analysis
    }

    pub fn analysis_attempted(&self) -> bool {
        !matches!(self.analysis, AnalysisStatus::NotRun)
    }

    /// The analysis choice is offered once, before the first task attempt.
    pub fn analysis_open(&self) -> bool {
        !self.analysis_attempted() && self.task_attempts == 0
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn generation_calls(&self) -> u32 {
        self.generation_calls
    }

    pub fn doc_lookups(&self) -> u32 {
        self.doc_lookups
    }

    pub fn task_attempts(&self) -> u32 {
        self.task_attempts
    }

    pub fn last_code(&self) -> Option<&str> {
        self.last_code.as_deref()
    }

    pub fn verdicts(&self) -> &[VerdictRecord] {
        &self.verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttemptErrorKind;
    use serde_json::json;

    fn context(value: Value) -> Context {
        Context::from_value(value).expect("context")
    }

    #[test]
    fn caller_keys_are_protected_but_run_keys_are_not() {
        let mut state = ContextState::new(context(json!({"a": 1})));
        let applied = state.apply_updates(
            json!({"a": 2, "total": 3, "__telemetry": 1})
                .as_object()
                .expect("object"),
        );
        assert_eq!(applied, vec!["total".to_string()]);
        assert_eq!(state.ignored_overwrites(), ["a".to_string()]);

        let applied = state.apply_updates(json!({"total": 4}).as_object().expect("object"));
        assert_eq!(applied, vec!["total".to_string()]);
        let result = state.into_result();
        assert_eq!(result.get("a"), Some(&json!(1)));
        assert_eq!(result.get("total"), Some(&json!(4)));
        assert!(!result.contains_key("__telemetry"));
    }

    #[test]
    fn rewriting_a_caller_key_with_the_same_value_is_not_an_overwrite() {
        let mut state = ContextState::new(context(json!({"a": 1})));
        state.apply_updates(json!({"a": 1}).as_object().expect("object"));
        assert!(state.ignored_overwrites().is_empty());
    }

    #[test]
    fn execution_state_accumulates_functionally() {
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        let state = ExecutionState::new()
            .with_generation(Some(&usage), 1)
            .with_task_attempt(Some("print(1)".to_string()))
            .with_error(AttemptError::new(
                1,
                Stage::Task,
                AttemptErrorKind::Validation,
                vec!["bad".to_string()],
                None,
            ))
            .with_generation(Some(&usage), 0)
            .with_task_attempt(None);

        assert_eq!(state.usage().total_tokens, 30);
        assert_eq!(state.generation_calls(), 2);
        assert_eq!(state.doc_lookups(), 1);
        assert_eq!(state.task_attempts(), 2);
        assert_eq!(state.last_code(), Some("print(1)"));
        assert_eq!(state.errors().len(), 1);
    }

    #[test]
    fn analysis_closes_after_the_first_task_attempt() {
        let state = ExecutionState::new();
        assert!(state.analysis_open());

        let state = state.with_task_attempt(Some("print(1)".to_string()));
        assert!(!state.analysis_attempted());
        assert!(!state.analysis_open());

        let failed = ExecutionState::new().with_analysis_failure("no output");
        assert!(!failed.analysis_open());
    }

    #[test]
    fn insights_mark_analysis_complete() {
        let state = ExecutionState::new()
            .with_insights(json!({"pages": 2, "__x": 1}).as_object().expect("object"));
        assert!(state.analysis_attempted());
        assert_eq!(state.data_insights().len(), 1);
        assert_eq!(
            state.analysis(),
            &AnalysisStatus::Completed {
                keys: vec!["pages".to_string()]
            }
        );
    }
}
