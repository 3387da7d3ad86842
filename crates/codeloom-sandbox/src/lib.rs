//! Client side of sandboxed program execution.
//!
//! A [`SandboxClient`] injects the context into the program, hands it to a
//! [`SandboxBackend`] (remote service or local interpreter) under a hard
//! timeout, and parses the program's declared output line back out.

mod local;
mod remote;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use codeloom_types::Context;

pub use local::LocalProcessBackend;
pub use remote::HttpSandboxBackend;

/// Extra time allowed for transport on top of the program's own budget.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);
const FEEDBACK_TAIL_CHARS: usize = 1_500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRequest {
    pub code: String,
    pub context: Value,
    /// Seconds the program may run.
    pub timeout: u64,
}

/// What a backend reports about one process run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawExecution {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub declared_output: Option<Value>,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredStatus {
    Success,
    Error,
}

/// The structured line a program prints as its final action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredOutput {
    pub status: DeclaredStatus,
    #[serde(default)]
    pub context_updates: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxResult {
    pub context_updates: Map<String, Value>,
    pub message: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxFailure {
    #[error("sandbox execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("sandbox transport error: {0}")]
    Transport(String),
    #[error("program exited with status {exit_code} without a declared output")]
    NonZeroExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("program did not emit a valid declared output line: {reason}")]
    MissingDeclaredOutput {
        reason: String,
        stdout: String,
        stderr: String,
    },
    #[error("program reported an error: {message}")]
    ReportedError {
        message: String,
        stdout: String,
        stderr: String,
    },
    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
}

impl SandboxFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxFailure::Timeout(_) => "timeout",
            SandboxFailure::Transport(_) => "transport",
            SandboxFailure::NonZeroExit { .. } => "non_zero_exit",
            SandboxFailure::MissingDeclaredOutput { .. } => "missing_declared_output",
            SandboxFailure::ReportedError { .. } => "reported_error",
            SandboxFailure::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Failure description with the tail of stderr, sized for a retry prompt.
    pub fn feedback(&self) -> String {
        match self {
            SandboxFailure::NonZeroExit { stderr, .. }
            | SandboxFailure::MissingDeclaredOutput { stderr, .. }
            | SandboxFailure::ReportedError { stderr, .. }
                if !stderr.trim().is_empty() =>
            {
                format!("{self}\nstderr:\n{}", tail_chars(stderr.trim(), FEEDBACK_TAIL_CHARS))
            }
            _ => self.to_string(),
        }
    }
}

fn tail_chars(input: &str, max_chars: usize) -> String {
    let count = input.chars().count();
    if count <= max_chars {
        return input.to_string();
    }
    let tail = input.chars().skip(count - max_chars).collect::<String>();
    format!("...{tail}")
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        context: &Context,
        timeout: Duration,
    ) -> Result<SandboxResult, SandboxFailure>;
}

#[derive(Clone)]
pub struct SandboxClient {
    backend: Arc<dyn SandboxBackend>,
}

impl SandboxClient {
    pub fn new(backend: impl SandboxBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

#[async_trait]
impl Sandbox for SandboxClient {
    async fn execute(
        &self,
        code: &str,
        context: &Context,
        timeout: Duration,
    ) -> Result<SandboxResult, SandboxFailure> {
        if code.trim().is_empty() {
            return Err(SandboxFailure::InvalidRequest("program is empty".to_string()));
        }
        if timeout.is_zero() {
            return Err(SandboxFailure::InvalidRequest(
                "timeout must be positive".to_string(),
            ));
        }
        let request = SandboxRequest {
            code: with_context_prelude(code, context)?,
            context: context.to_value(),
            timeout: whole_seconds(timeout),
        };

        let started = Instant::now();
        let raw = tokio::time::timeout(timeout + TRANSPORT_GRACE, self.backend.run(&request))
            .await
            .map_err(|_| SandboxFailure::Timeout(timeout))??;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            backend = self.backend.name(),
            exit_code = raw.exit_code,
            duration_ms,
            "sandbox run finished"
        );
        interpret(raw, duration_ms)
    }
}

/// Budget in whole seconds for the wire, rounded up so a fractional budget is never cut short.
fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    let secs = if timeout.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}

/// Prepends a single line that rebuilds `context` from a base64 JSON literal.
pub fn with_context_prelude(code: &str, context: &Context) -> Result<String, SandboxFailure> {
    let payload = serde_json::to_vec(context)
        .map_err(|err| SandboxFailure::InvalidRequest(format!("context is not serializable: {err}")))?;
    let encoded = STANDARD.encode(payload);
    Ok(format!(
        "import base64 as _cl_b64, json as _cl_json; context = _cl_json.loads(_cl_b64.b64decode(\"{encoded}\").decode(\"utf-8\")); del _cl_b64, _cl_json\n{code}"
    ))
}

fn interpret(raw: RawExecution, duration_ms: u64) -> Result<SandboxResult, SandboxFailure> {
    let declared = match raw.declared_output.clone() {
        Some(value) if !value.is_null() => parse_declared(value),
        _ => last_stdout_line(&raw.stdout)
            .ok_or_else(|| "stdout is empty".to_string())
            .and_then(|line| {
                serde_json::from_str::<Value>(line)
                    .map_err(|err| format!("last stdout line is not JSON ({err})"))
            })
            .and_then(parse_declared),
    };

    let declared = match declared {
        Ok(declared) => declared,
        Err(reason) if raw.exit_code != 0 => {
            tracing::debug!(%reason, "no declared output after non-zero exit");
            return Err(SandboxFailure::NonZeroExit {
                exit_code: raw.exit_code,
                stdout: raw.stdout,
                stderr: raw.stderr,
            });
        }
        Err(reason) => {
            return Err(SandboxFailure::MissingDeclaredOutput {
                reason,
                stdout: raw.stdout,
                stderr: raw.stderr,
            })
        }
    };

    match declared.status {
        DeclaredStatus::Error => Err(SandboxFailure::ReportedError {
            message: declared
                .message
                .unwrap_or_else(|| "no message given".to_string()),
            stdout: raw.stdout,
            stderr: raw.stderr,
        }),
        DeclaredStatus::Success => Ok(SandboxResult {
            context_updates: declared.context_updates,
            message: declared.message,
            stdout: raw.stdout,
            stderr: raw.stderr,
            exit_code: raw.exit_code,
            duration_ms,
        }),
    }
}

fn last_stdout_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

fn parse_declared(value: Value) -> Result<DeclaredOutput, String> {
    let Value::Object(map) = &value else {
        return Err("declared output is not a JSON object".to_string());
    };
    if let Some(updates) = map.get("context_updates") {
        if !updates.is_object() {
            return Err("`context_updates` must be an object".to_string());
        }
    } else if map.get("status").and_then(Value::as_str) == Some("success") {
        return Err("`context_updates` is missing".to_string());
    }
    serde_json::from_value(value).map_err(|err| format!("declared output is malformed ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedBackend {
        reply: Result<RawExecution, SandboxFailure>,
        delay: Duration,
        seen: Mutex<Vec<SandboxRequest>>,
    }

    impl ScriptedBackend {
        fn replying(reply: Result<RawExecution, SandboxFailure>) -> Self {
            Self {
                reply,
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure> {
            self.seen.lock().expect("lock").push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    fn stdout_run(stdout: &str, exit_code: i32) -> RawExecution {
        RawExecution {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            declared_output: None,
        }
    }

    fn ctx() -> Context {
        Context::from_value(json!({"a": 2, "b": 3})).expect("context")
    }

    #[tokio::test]
    async fn parses_declared_line_after_other_output() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(stdout_run(
            "working...\n{\"status\": \"success\", \"context_updates\": {\"sum\": 5}}\n\n",
            0,
        ))));
        let result = client
            .execute("print(1)", &ctx(), Duration::from_secs(5))
            .await
            .expect("result");
        assert_eq!(result.context_updates.get("sum"), Some(&json!(5)));
        assert!(result.stdout.starts_with("working"));
    }

    #[tokio::test]
    async fn prefers_backend_declared_output() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(RawExecution {
            stdout: "not json".to_string(),
            declared_output: Some(json!({"status": "success", "context_updates": {"x": 1}})),
            ..RawExecution::default()
        })));
        let result = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect("result");
        assert_eq!(result.context_updates.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn clean_exit_without_declared_line_is_a_failure() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(stdout_run("done\n", 0))));
        let err = client
            .execute("print('done')", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "missing_declared_output");
    }

    #[tokio::test]
    async fn non_zero_exit_without_declared_line_keeps_stderr() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(RawExecution {
            stderr: "Traceback...\nKeyError: 'c'".to_string(),
            exit_code: 1,
            ..RawExecution::default()
        })));
        let err = client
            .execute("context['c']", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "non_zero_exit");
        assert!(err.feedback().contains("KeyError"));
    }

    #[tokio::test]
    async fn reported_error_status_is_a_failure() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(stdout_run(
            "{\"status\": \"error\", \"context_updates\": {}, \"message\": \"bad input\"}",
            0,
        ))));
        let err = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("must fail");
        assert_eq!(
            err,
            SandboxFailure::ReportedError {
                message: "bad input".to_string(),
                stdout: "{\"status\": \"error\", \"context_updates\": {}, \"message\": \"bad input\"}"
                    .to_string(),
                stderr: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn success_without_updates_object_is_rejected() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(stdout_run(
            "{\"status\": \"success\", \"context_updates\": [1]}",
            0,
        ))));
        let err = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "missing_declared_output");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let mut backend = ScriptedBackend::replying(Ok(stdout_run("", 0)));
        backend.delay = Duration::from_secs(120);
        let client = SandboxClient::new(backend);
        let err = client
            .execute("pass", &ctx(), Duration::from_secs(1))
            .await
            .expect_err("must time out");
        assert_eq!(err, SandboxFailure::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn request_embeds_context_prelude() {
        let backend = Arc::new(ScriptedBackend::replying(Ok(stdout_run(
            "{\"status\": \"success\", \"context_updates\": {}}",
            0,
        ))));
        struct Shared(Arc<ScriptedBackend>);
        #[async_trait]
        impl SandboxBackend for Shared {
            fn name(&self) -> &str {
                "shared"
            }
            async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure> {
                self.0.run(request).await
            }
        }
        let client = SandboxClient::new(Shared(backend.clone()));
        client
            .execute("x = context['a']", &ctx(), Duration::from_secs(7))
            .await
            .expect("result");
        let seen = backend.seen.lock().expect("lock");
        let request = &seen[0];
        assert_eq!(request.timeout, 7);
        assert_eq!(request.context, json!({"a": 2, "b": 3}));
        let mut lines = request.code.lines();
        assert!(lines.next().is_some_and(|l| l.contains("b64decode")));
        assert_eq!(lines.next(), Some("x = context['a']"));
    }

    #[test]
    fn fractional_budgets_round_up_to_whole_seconds() {
        assert_eq!(whole_seconds(Duration::from_millis(2_500)), 3);
        assert_eq!(whole_seconds(Duration::from_secs(2)), 2);
        assert_eq!(whole_seconds(Duration::from_millis(200)), 1);
    }

    #[tokio::test]
    async fn rejects_empty_program_and_zero_timeout() {
        let client = SandboxClient::new(ScriptedBackend::replying(Ok(stdout_run("", 0))));
        let err = client
            .execute("  ", &ctx(), Duration::from_secs(1))
            .await
            .expect_err("empty");
        assert_eq!(err.code(), "invalid_request");
        let err = client
            .execute("pass", &ctx(), Duration::ZERO)
            .await
            .expect_err("zero timeout");
        assert_eq!(err.code(), "invalid_request");
    }
}
