use serde::Serialize;
use serde_json::{Map, Value};

use codeloom_sandbox::SandboxResult;

use crate::error::AttemptError;
use crate::state::{AnalysisStatus, ExecutionState, VerdictRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierOutcome {
    /// Tier not configured for this run.
    #[default]
    Disabled,
    /// Not consulted because an earlier tier answered.
    Skipped,
    Hit,
    Miss,
    /// Candidates were found but none survived execution or validation.
    Rejected,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    ExactCache,
    SemanticCache,
    #[default]
    Generated,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetadata {
    pub fingerprint: String,
    pub exact: TierOutcome,
    pub semantic: TierOutcome,
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub semantic_candidates_tried: u32,
    /// Reuse count of the served entry before this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reuse_count: Option<u64>,
    pub persisted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AiMetadata {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub generation_calls: u32,
    pub doc_lookups: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub analysis: AnalysisStatus,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data_insights: Map<String, Value>,
    pub output_validation: Vec<VerdictRecord>,
}

impl AiMetadata {
    pub(crate) fn absorb(&mut self, state: &ExecutionState) {
        self.generation_calls = state.generation_calls();
        self.doc_lookups = state.doc_lookups();
        self.prompt_tokens = state.usage().prompt_tokens;
        self.completion_tokens = state.usage().completion_tokens;
        self.total_tokens = state.usage().total_tokens;
        self.analysis = state.analysis().clone();
        self.data_insights = state.data_insights().clone();
        self.output_validation = state.verdicts().to_vec();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionDetails {
    pub run_id: String,
    pub attempts: u32,
    pub errors: Vec<AttemptError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub libraries: Vec<String>,
    pub updated_keys: Vec<String>,
    pub ignored_overwrites: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub sandbox_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ExecutionDetails {
    pub(crate) fn absorb_execution(&mut self, result: &SandboxResult) {
        self.stdout = result.stdout.clone();
        self.stderr = result.stderr.clone();
        self.exit_code = Some(result.exit_code);
        self.message = result.message.clone();
        self.sandbox_duration_ms = result.duration_ms;
    }
}

/// Telemetry for one run, kept apart from the functional result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetadata {
    pub cache_metadata: CacheMetadata,
    pub ai_metadata: AiMetadata,
    pub execution_metadata: ExecutionDetails,
}

impl ExecutionMetadata {
    pub(crate) fn new(run_id: &str, fingerprint: &str) -> Self {
        Self {
            cache_metadata: CacheMetadata {
                fingerprint: fingerprint.to_string(),
                ..CacheMetadata::default()
            },
            execution_metadata: ExecutionDetails {
                run_id: run_id.to_string(),
                ..ExecutionDetails::default()
            },
            ..Self::default()
        }
    }
}
