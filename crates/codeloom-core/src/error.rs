use serde::{Deserialize, Serialize};
use thiserror::Error;

use codeloom_types::SchemaBuildError;

use crate::state::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// Static or semantic validation rejected the candidate.
    Validation,
    /// Sandbox timeout, transport failure or missing declared output.
    Execution,
    /// The model call failed or returned nothing usable.
    Generation,
}

impl AttemptErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptErrorKind::Validation => "validation",
            AttemptErrorKind::Execution => "execution",
            AttemptErrorKind::Generation => "generation",
        }
    }
}

/// One recoverable failure, fed back into the next generation prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub stage: Stage,
    pub kind: AttemptErrorKind,
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AttemptError {
    pub fn new(
        attempt: u32,
        stage: Stage,
        kind: AttemptErrorKind,
        messages: Vec<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            attempt,
            stage,
            kind,
            messages,
            code,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempt {} ({} {}): {}",
            self.attempt,
            self.stage.as_str(),
            self.kind.as_str(),
            self.messages.join("; ")
        )
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid context: {0}")]
    Schema(#[from] SchemaBuildError),

    #[error("synthesis exhausted after {} attempts: {}", errors.len(), summarize(errors))]
    SynthesisExhausted {
        task: String,
        last_code: Option<String>,
        errors: Vec<AttemptError>,
    },
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Schema(_) => "SCHEMA_ERROR",
            OrchestratorError::SynthesisExhausted { .. } => "SYNTHESIS_EXHAUSTED",
        }
    }
}

fn summarize(errors: &[AttemptError]) -> String {
    errors
        .last()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no attempts recorded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_error_reports_last_failure() {
        let err = OrchestratorError::SynthesisExhausted {
            task: "sum".to_string(),
            last_code: Some("print(1)".to_string()),
            errors: vec![
                AttemptError::new(1, Stage::Task, AttemptErrorKind::Validation, vec!["a".into()], None),
                AttemptError::new(2, Stage::Task, AttemptErrorKind::Execution, vec!["b".into()], None),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("after 2 attempts"));
        assert!(text.contains("attempt 2 (task execution): b"));
        assert_eq!(err.code(), "SYNTHESIS_EXHAUSTED");
    }

    #[test]
    fn schema_errors_convert() {
        let err: OrchestratorError = SchemaBuildError::EmptyKey.into();
        assert_eq!(err.code(), "SCHEMA_ERROR");
    }
}
